//! Channel transport: requests and responses travel over the socket pair
//! created at fork time, one message each

use super::{Incoming, Transport, TransportKind};
use crate::channel::WorkerChannel;
use crate::error::WorkerResult;
use crate::worker::{RunOptions, WorkerArgs};
use std::io;

pub struct StandardTransport {
    channel: WorkerChannel,
}

impl Transport for StandardTransport {
    const KIND: TransportKind = TransportKind::Standard;
    type Peer = ();

    fn bind(_args: &WorkerArgs, channel: WorkerChannel, _options: &RunOptions) -> WorkerResult<Self> {
        Ok(Self { channel })
    }

    fn poll(&mut self) -> io::Result<Option<Incoming<()>>> {
        match self.channel.try_recv()? {
            Some(request) if !request.is_empty() => Ok(Some(Incoming { peer: (), request })),
            _ => Ok(None),
        }
    }

    fn reply(&mut self, _peer: (), response: Option<&[u8]>) -> io::Result<()> {
        match response {
            Some(bytes) => self.channel.send(bytes),
            None => Ok(()),
        }
    }

    fn close(&mut self) {}

    fn endpoint(&self) -> String {
        "channel".to_string()
    }
}
