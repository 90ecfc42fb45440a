use crate::table::ProcessTable;
use crate::worker::{Handler, WorkerArgs};

pub struct EchoHandler;

impl Handler for EchoHandler {
    const NAME: &'static str = "echo";

    fn init(_args: &WorkerArgs, _table: &ProcessTable) -> anyhow::Result<Self> {
        Ok(EchoHandler)
    }

    fn process_message(&mut self, request: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let mut response = Vec::with_capacity(request.len() + 6);
        response.extend_from_slice(b"Echo: ");
        response.extend_from_slice(request);
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo() {
        let table = ProcessTable::new(1).unwrap();
        let mut handler = EchoHandler::init(&WorkerArgs::new(), &table).unwrap();
        assert_eq!(
            handler.process_message(b"hello").unwrap().unwrap(),
            b"Echo: hello"
        );
    }

    #[test]
    fn test_echo_passes_bytes_through() {
        let table = ProcessTable::new(1).unwrap();
        let mut handler = EchoHandler::init(&WorkerArgs::new(), &table).unwrap();
        let response = handler.process_message(&[0xff, 0x00, 0x7f]).unwrap().unwrap();
        assert_eq!(&response[6..], &[0xff, 0x00, 0x7f]);
    }
}
