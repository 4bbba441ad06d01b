//! Mock transport for testing engine logic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{OtaTransport, TransportError};
use crate::protocol::{Command, Incoming, Response};

/// Mock transport with a scripted incoming-command queue and captured
/// outgoing responses.
pub struct MockTransport {
    /// Queued device commands, returned in order on `recv`.
    command_queue: Arc<Mutex<VecDeque<Incoming>>>,
    /// Captured sends: response and echoed transaction sequence number.
    send_log: Arc<Mutex<Vec<(Response, Option<u8>)>>>,
    /// Whether the device is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            command_queue: Arc::new(Mutex::new(VecDeque::new())),
            send_log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue an incoming device command to be returned on the next `recv`.
    pub fn queue_command(&self, transaction_seq: u8, command: Command) {
        self.command_queue.lock().unwrap().push_back(Incoming {
            transaction_seq,
            command,
        });
    }

    /// Get all captured sends.
    pub fn sent(&self) -> Vec<(Response, Option<u8>)> {
        self.send_log.lock().unwrap().clone()
    }

    /// Clear captured sends.
    pub fn clear_sent(&self) {
        self.send_log.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl OtaTransport for MockTransport {
    fn send(
        &self,
        response: &Response,
        transaction_seq: Option<u8>,
    ) -> Result<(), TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }

        self.send_log
            .lock()
            .unwrap()
            .push((response.clone(), transaction_seq));
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Incoming, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }

        self.command_queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;

    #[test]
    fn queued_commands_come_back_in_order() {
        let mock = MockTransport::new();
        mock.queue_command(1, Command::DeviceAnnounce);
        mock.queue_command(
            2,
            Command::UpgradeEndRequest(crate::protocol::UpgradeEndRequest {
                status: Status::Success,
                manufacturer_code: 4476,
                image_type: 1,
                file_version: 2,
            }),
        );

        let first = mock.recv(Duration::from_secs(1)).unwrap();
        assert_eq!(first.transaction_seq, 1);
        assert_eq!(first.command, Command::DeviceAnnounce);

        let second = mock.recv(Duration::from_secs(1)).unwrap();
        assert_eq!(second.transaction_seq, 2);

        // Queue is empty now: recv reports a timeout.
        assert!(matches!(
            mock.recv(Duration::from_secs(1)),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn sends_are_captured() {
        let mock = MockTransport::new();
        mock.send(
            &Response::ImageNotify {
                payload_type: 0,
                query_jitter: 100,
            },
            None,
        )
        .unwrap();

        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, None);
    }

    #[test]
    fn disconnect_fails_io() {
        let mock = MockTransport::new();
        mock.disconnect();
        assert!(matches!(
            mock.recv(Duration::from_secs(1)),
            Err(TransportError::Disconnected)
        ));
    }
}
