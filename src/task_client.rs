//! One-shot synchronous command sender.
//!
//! Opens a blocking connection per command, writes one framed message,
//! then flushes and closes. Used by launched tasks and by [`Controller`],
//! neither of which needs to hear anything back.
//!
//! [`Controller`]: crate::controller::Controller

use std::io::{self, Write};

use crate::command::Command;
use crate::transport::Address;

/// Sends commands for one domain to one server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskClient {
    domain: String,
    address: Address,
}

impl TaskClient {
    /// Client for `domain` talking to `address`.
    pub fn new(domain: impl Into<String>, address: impl Into<Address>) -> Self {
        Self {
            domain: domain.into(),
            address: address.into(),
        }
    }

    /// Domain stamped on every command.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Server address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Stamp the domain on `command` and deliver it.
    ///
    /// # Errors
    ///
    /// Connect or write errors. The server gives no acknowledgement, so
    /// success only means the bytes left this process.
    pub fn run(&self, mut command: Command) -> io::Result<()> {
        command.set_domain(self.domain.as_str());
        let bytes = command.to_message().encode();
        self.address
            .with_sync_connection(|conn| conn.write_all(&bytes))?;
        log::debug!(
            "[TaskClient] Sent {} to {} for {}",
            command.kind(),
            self.address,
            self.domain
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BroadcastMessage, MessageDecoder};
    use std::io::Read;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_run_writes_one_stamped_message_then_closes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("server.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let client = TaskClient::new("example.com", path.to_str().unwrap());
        let reader = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes).unwrap();
            bytes
        });

        client.run(Command::set_pid("publish", 12)).unwrap();
        let bytes = reader.join().unwrap();

        let messages: Vec<BroadcastMessage> = MessageDecoder::new().feed(&bytes);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].domain, "example.com");
        assert_eq!(messages[0].event, "command");
        let command = Command::load(&messages[0].data).unwrap();
        assert_eq!(command.domain(), "example.com");
        assert_eq!(command.task_name(), Some("publish"));
    }

    #[test]
    fn test_run_without_server_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let client = TaskClient::new("example.com", tmp.path().join("missing.sock").to_str().unwrap());
        assert!(client.run(Command::task_complete("publish")).is_err());
    }
}
