//! Built-in request handlers
//!
//! - `echo`: replies `Echo: <request>`
//! - `logger`: appends the request to a log file
//! - `http-proxy`: answers HTTP/1.x requests, forwarding to an upstream if
//!   one is configured
//! - `status`: reports the shared process table as JSON

mod echo;
mod http_proxy;
mod logger;
mod status;

pub use echo::EchoHandler;
pub use http_proxy::{HttpProxyHandler, HttpRequest};
pub use logger::LoggerHandler;
pub use status::StatusHandler;
