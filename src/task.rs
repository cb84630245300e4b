//! Helper for programs launched by the server.
//!
//! A launched task finds its domain, name and the server address in its
//! environment. [`TaskContext::start`] reports the task's pid so the
//! server can `Kill` it later; [`TaskContext::emit`] and
//! [`TaskContext::complete`] publish progress to the task's domain.
//!
//! None of these fail the task: when the server is unreachable the call
//! returns [`Delivery::Unreachable`] and the task carries on.

use std::io;

use crate::command::Command;
use crate::constants::{DEFAULT_CONNECTION, ENV_CONNECTION, ENV_DOMAIN, ENV_TASK_NAME};
use crate::task_client::TaskClient;

/// Outcome of a report sent to the server.
#[derive(Debug)]
pub enum Delivery {
    /// The message was written to the server.
    Delivered,
    /// The server could not be reached.
    Unreachable(io::Error),
}

impl Delivery {
    /// Returns `true` for [`Delivery::Delivered`].
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    fn from_result(result: io::Result<()>, what: &str) -> Self {
        match result {
            Ok(()) => Self::Delivered,
            Err(e) => {
                log::warn!("[Task] Could not deliver {what}: {e}");
                Self::Unreachable(e)
            }
        }
    }
}

/// Identity of a launched task and its channel back to the server.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_name: String,
    client: TaskClient,
}

impl TaskContext {
    /// Context for `task_name` in `domain`, reporting to `connection`.
    pub fn new(
        domain: impl Into<String>,
        task_name: impl Into<String>,
        connection: &str,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            client: TaskClient::new(domain, connection),
        }
    }

    /// Context from the variables the launcher injects.
    ///
    /// Returns `None` when the process was not started by the server.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`TaskContext::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let domain = lookup(ENV_DOMAIN).filter(|v| !v.is_empty())?;
        let task_name = lookup(ENV_TASK_NAME).filter(|v| !v.is_empty())?;
        let connection = lookup(ENV_CONNECTION)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_CONNECTION.to_string());
        Some(Self::new(domain, task_name, &connection))
    }

    /// Domain the task runs under.
    pub fn domain(&self) -> &str {
        self.client.domain()
    }

    /// Task name.
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Channel to the server.
    pub fn client(&self) -> &TaskClient {
        &self.client
    }

    /// Report this process's pid.
    pub fn start(&self) -> Delivery {
        self.report_pid(std::process::id())
    }

    /// Report `pid` as the task's process.
    pub fn report_pid(&self, pid: u32) -> Delivery {
        log::debug!("[Task] {} running as pid {pid}", self.task_name);
        Delivery::from_result(
            self.client.run(Command::set_pid(self.task_name.as_str(), pid)),
            "pid",
        )
    }

    /// Publish `data` as `event` to every client of the task's domain.
    pub fn emit(&self, event: &str, data: &str) -> Delivery {
        Delivery::from_result(
            self.client
                .run(Command::client_event(self.domain(), event, data)),
            "event",
        )
    }

    /// Report that the task finished.
    pub fn complete(&self) -> Delivery {
        Delivery::from_result(
            self.client
                .run(Command::task_complete(self.task_name.as_str())),
            "completion",
        )
    }
}
