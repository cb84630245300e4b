//! Caller-side facade for firing and controlling named tasks.
//!
//! A [`Controller`] is what an application embeds: it knows its domain,
//! the server address and the tasks it may fire. Every call opens a short
//! blocking connection through [`TaskClient`]; nothing waits for the server
//! to act on the command.

use std::collections::HashMap;

use crate::command::{Command, Params, TaskDescription};
use crate::error::{Error, Result};
use crate::task_client::TaskClient;
use crate::transport::Address;

/// Named tasks plus a channel to the server for one domain.
#[derive(Debug, Clone)]
pub struct Controller {
    client: TaskClient,
    tasks: HashMap<String, TaskDescription>,
}

impl Controller {
    /// Controller for `domain` talking to `address`.
    pub fn new(domain: impl Into<String>, address: impl Into<Address>) -> Self {
        Self {
            client: TaskClient::new(domain, address),
            tasks: HashMap::new(),
        }
    }

    /// Domain stamped on every command.
    pub fn domain(&self) -> &str {
        self.client.domain()
    }

    /// Register `task` under its name, replacing any task of the same name.
    pub fn add_task(&mut self, task: TaskDescription) -> &TaskDescription {
        let name = task.name.clone();
        self.tasks.insert(name.clone(), task);
        &self.tasks[&name]
    }

    /// Registered task called `name`.
    pub fn task(&self, name: &str) -> Option<&TaskDescription> {
        self.tasks.get(name)
    }

    /// Ask the server to launch `name` with `overrides` merged onto its
    /// default params.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownTask`] if `name` was never added; connection errors.
    pub fn fire(&self, name: &str, overrides: &Params) -> Result<()> {
        let task = self
            .tasks
            .get(name)
            .ok_or_else(|| Error::UnknownTask(name.to_string()))?;
        self.send(Command::fire(task.clone(), overrides))
    }

    /// Ask the server to SIGTERM the registered process of `name`.
    pub fn kill(&self, name: &str) -> Result<()> {
        self.send(Command::kill(name))
    }

    /// Register `pid` for `name`.
    pub fn set_pid(&self, name: &str, pid: u32) -> Result<()> {
        self.send(Command::set_pid(name, pid))
    }

    /// Announce that `name` finished.
    pub fn task_complete(&self, name: &str) -> Result<()> {
        self.send(Command::task_complete(name))
    }

    /// Publish `data` as `event` to every client of this domain.
    pub fn send_event(&self, event: &str, data: &str) -> Result<()> {
        self.send(Command::client_event(self.domain(), event, data))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.client.run(command).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageDecoder;
    use std::io::Read;
    use std::os::unix::net::UnixListener;
    use std::path::Path;

    /// Accept `n` one-shot connections and decode the command each carried.
    fn capture(path: &Path, n: usize) -> std::thread::JoinHandle<Vec<Command>> {
        let listener = UnixListener::bind(path).unwrap();
        std::thread::spawn(move || {
            (0..n)
                .map(|_| {
                    let (mut stream, _) = listener.accept().unwrap();
                    let mut bytes = Vec::new();
                    stream.read_to_end(&mut bytes).unwrap();
                    let message = MessageDecoder::new().feed(&bytes).remove(0);
                    Command::load(&message.data).unwrap()
                })
                .collect()
        })
    }

    #[test]
    fn test_fire_unknown_task_sends_nothing() {
        let controller = Controller::new("example.com", "/nonexistent/server.sock");
        let err = controller.fire("publish", &Params::new()).unwrap_err();
        assert!(matches!(err, Error::UnknownTask(ref name) if name == "publish"));
    }

    #[test]
    fn test_fire_sends_merged_params_for_domain() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("server.sock");
        let received = capture(&path, 1);

        let mut controller = Controller::new("example.org", path.to_str().unwrap());
        controller.add_task(
            TaskDescription::new("publish", "/path/to/binary")
                .with_niceness(10)
                .with_param("param1", "param1")
                .with_env("ENV_PARAM", "envparam"),
        );
        let overrides: Params = [("param2", "param2")].into_iter().collect();
        controller.fire("publish", &overrides).unwrap();

        let commands = received.join().unwrap();
        let Command::Fire { domain, task, params } = &commands[0] else {
            panic!("expected fire, got {:?}", commands[0]);
        };
        assert_eq!(domain, "example.org");
        assert_eq!(task.niceness, 10);
        assert_eq!(params.get("param1"), Some("param1"));
        assert_eq!(params.get("param2"), Some("param2"));
    }

    #[test]
    fn test_other_commands_are_stamped_with_domain() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("server.sock");
        let received = capture(&path, 4);

        let controller = Controller::new("example.com", path.to_str().unwrap());
        controller.set_pid("publish", 42).unwrap();
        controller.kill("publish").unwrap();
        controller.task_complete("publish").unwrap();
        controller.send_event("status", "done").unwrap();

        let commands = received.join().unwrap();
        assert_eq!(commands[0], {
            let mut c = Command::set_pid("publish", 42);
            c.set_domain("example.com");
            c
        });
        assert!(commands.iter().all(|c| c.domain() == "example.com"));
        assert_eq!(
            commands[3],
            Command::client_event("example.com", "status", "done")
        );
    }

    #[test]
    fn test_unreachable_server_is_an_io_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let controller = Controller::new("example.com", tmp.path().join("none.sock").to_str().unwrap());
        assert!(matches!(controller.kill("publish"), Err(Error::Io(_))));
    }
}
