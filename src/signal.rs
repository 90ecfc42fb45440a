//! Cooperative shutdown for worker processes
//!
//! `SIGTERM` and `SIGINT` only set a flag; the run loop reads it once per tick
//! and tears down on its own schedule, so a handler already running is never
//! interrupted.

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Signals that request a graceful shutdown
pub const SHUTDOWN_SIGNALS: [i32; 2] = [SIGTERM, SIGINT];

/// Shutdown request shared between signal handlers and the run loop
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
    signal: Arc<AtomicUsize>,
}

impl ShutdownFlag {
    /// Create a flag that only [`request`](Self::request) can set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a flag set by `SIGTERM` and `SIGINT`
    pub fn install() -> io::Result<Self> {
        let flag = Self::new();
        for sig in SHUTDOWN_SIGNALS {
            // Record the signal number first so it is visible once the flag is
            signal_hook::flag::register_usize(sig, Arc::clone(&flag.signal), sig as usize)?;
            signal_hook::flag::register(sig, Arc::clone(&flag.requested))?;
        }
        Ok(flag)
    }

    /// Request shutdown without a signal
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// The signal that requested shutdown, if one did
    pub fn signal_number(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig as i32),
        }
    }

    pub fn signal_name(&self) -> &'static str {
        match self.signal_number() {
            Some(SIGTERM) => "SIGTERM",
            Some(SIGINT) => "SIGINT",
            Some(SIGHUP) => "SIGHUP",
            Some(_) => "signal",
            None => "request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_flag_is_clear() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_requested());
        assert_eq!(flag.signal_number(), None);
        assert_eq!(flag.signal_name(), "request");
    }

    #[test]
    fn test_request_is_seen_by_clones() {
        let flag = ShutdownFlag::new();
        let observer = flag.clone();
        flag.request();
        assert!(observer.is_requested());
        assert_eq!(observer.signal_number(), None);
    }

    #[test]
    fn test_install_succeeds() {
        let flag = ShutdownFlag::install();
        assert!(flag.is_ok());
        assert!(!flag.unwrap().is_requested());
    }
}
