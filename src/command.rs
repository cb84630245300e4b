//! Typed commands and their wire serialization.
//!
//! A [`Command`] travels as the payload of one [`BroadcastMessage`] with
//! event [`EVENT_COMMAND`]. The payload is a single-line JSON object tagged
//! by `"type"`:
//!
//! ```text
//! {"type":"kill","domain":"example.com","task_name":"publish"}
//! ```
//!
//! Parameter overrides are merged into the task's defaults when a
//! [`Command::fire`] is constructed, so a loaded command already carries
//! the merged parameters.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::EVENT_COMMAND;
use crate::error::{Error, Result};
use crate::message::BroadcastMessage;

/// Ordered string-to-string parameter map.
///
/// Keeps insertion order, which decides the order of `--key=value`
/// arguments on the launched command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(Vec<(String, String)>);

impl Params {
    /// Empty parameter map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, replacing an existing value in place or
    /// appending a new entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Iterate entries in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Defaults overlaid with `overrides`.
    ///
    /// Overridden keys keep their default position; new keys are appended in
    /// override order.
    pub fn merged(&self, overrides: &Params) -> Params {
        let mut merged = self.clone();
        for (key, value) in overrides.iter() {
            merged.insert(key, value);
        }
        merged
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// A launchable task as registered by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescription {
    /// Task name; forms the registry key together with the domain.
    pub name: String,
    /// Executable path, optionally followed by literal leading arguments
    /// (e.g. `"/usr/bin/rake all"`).
    pub binary: String,
    /// Scheduling niceness applied in the child.
    pub niceness: i32,
    /// Default parameters.
    pub params: Params,
    /// Extra environment for the launched process.
    pub env: BTreeMap<String, String>,
}

impl TaskDescription {
    /// Task with no niceness, parameters or environment.
    pub fn new(name: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            niceness: 0,
            params: Params::new(),
            env: BTreeMap::new(),
        }
    }

    /// Set the niceness.
    pub fn with_niceness(mut self, niceness: i32) -> Self {
        self.niceness = niceness;
        self
    }

    /// Add a default parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The executable: first word of `binary`.
    pub fn executable(&self) -> PathBuf {
        PathBuf::from(self.binary.split_whitespace().next().unwrap_or_default())
    }

    /// Literal arguments following the executable in `binary`.
    pub fn leading_args(&self) -> Vec<String> {
        self.binary.split_whitespace().skip(1).map(str::to_string).collect()
    }
}

/// Variant tag of a [`Command`], as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Register a task's pid.
    SetPid,
    /// Look up a task's pid.
    GetPid,
    /// Task reports it has finished.
    TaskComplete,
    /// Launch a task.
    Fire,
    /// Terminate a task.
    Kill,
    /// Re-broadcast an event to the domain's clients.
    ClientEvent,
}

impl CommandKind {
    /// Wire tag.
    pub fn tag(self) -> &'static str {
        match self {
            Self::SetPid => "set_pid",
            Self::GetPid => "get_pid",
            Self::TaskComplete => "task_complete",
            Self::Fire => "fire",
            Self::Kill => "kill",
            Self::ClientEvent => "client_event",
        }
    }

    /// Parse a wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "set_pid" => Some(Self::SetPid),
            "get_pid" => Some(Self::GetPid),
            "task_complete" => Some(Self::TaskComplete),
            "fire" => Some(Self::Fire),
            "kill" => Some(Self::Kill),
            "client_event" => Some(Self::ClientEvent),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// An operation sent from a client to the server.
///
/// The `domain` of every variant is stamped by the sending client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Register `pid` for `domain/task_name`.
    SetPid {
        /// Sending domain.
        #[serde(default)]
        domain: String,
        /// Task name.
        task_name: String,
        /// OS process id.
        pid: u32,
    },
    /// Look up the pid of `domain/task_name`.
    GetPid {
        /// Sending domain.
        #[serde(default)]
        domain: String,
        /// Task name.
        task_name: String,
    },
    /// Advisory completion signal from a task.
    TaskComplete {
        /// Sending domain.
        #[serde(default)]
        domain: String,
        /// Task name.
        task_name: String,
    },
    /// Launch `task` with merged `params`.
    Fire {
        /// Sending domain.
        #[serde(default)]
        domain: String,
        /// Task to launch.
        task: TaskDescription,
        /// Default parameters merged with the caller's overrides.
        params: Params,
    },
    /// Send SIGTERM to the registered pid of `domain/task_name`.
    Kill {
        /// Sending domain.
        #[serde(default)]
        domain: String,
        /// Task name.
        task_name: String,
    },
    /// Broadcast `event`/`data` to clients on `domain`.
    ClientEvent {
        /// Target domain.
        #[serde(default)]
        domain: String,
        /// Event name.
        event: String,
        /// Opaque payload.
        data: String,
    },
}

impl Command {
    /// `SetPid` for `task_name`.
    pub fn set_pid(task_name: impl Into<String>, pid: u32) -> Self {
        Self::SetPid {
            domain: String::new(),
            task_name: task_name.into(),
            pid,
        }
    }

    /// `GetPid` for `task_name`.
    pub fn get_pid(task_name: impl Into<String>) -> Self {
        Self::GetPid {
            domain: String::new(),
            task_name: task_name.into(),
        }
    }

    /// `TaskComplete` for `task_name`.
    pub fn task_complete(task_name: impl Into<String>) -> Self {
        Self::TaskComplete {
            domain: String::new(),
            task_name: task_name.into(),
        }
    }

    /// `Fire` for `task`, merging `overrides` onto its default params.
    pub fn fire(task: TaskDescription, overrides: &Params) -> Self {
        let params = task.params.merged(overrides);
        Self::Fire {
            domain: String::new(),
            task,
            params,
        }
    }

    /// `Kill` for `task_name`.
    pub fn kill(task_name: impl Into<String>) -> Self {
        Self::Kill {
            domain: String::new(),
            task_name: task_name.into(),
        }
    }

    /// `ClientEvent` addressed to `domain`.
    pub fn client_event(
        domain: impl Into<String>,
        event: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self::ClientEvent {
            domain: domain.into(),
            event: event.into(),
            data: data.into(),
        }
    }

    /// Variant tag.
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::SetPid { .. } => CommandKind::SetPid,
            Self::GetPid { .. } => CommandKind::GetPid,
            Self::TaskComplete { .. } => CommandKind::TaskComplete,
            Self::Fire { .. } => CommandKind::Fire,
            Self::Kill { .. } => CommandKind::Kill,
            Self::ClientEvent { .. } => CommandKind::ClientEvent,
        }
    }

    /// Domain the command is scoped to.
    pub fn domain(&self) -> &str {
        match self {
            Self::SetPid { domain, .. }
            | Self::GetPid { domain, .. }
            | Self::TaskComplete { domain, .. }
            | Self::Fire { domain, .. }
            | Self::Kill { domain, .. }
            | Self::ClientEvent { domain, .. } => domain,
        }
    }

    /// Stamp the domain.
    pub fn set_domain(&mut self, new_domain: impl Into<String>) {
        match self {
            Self::SetPid { domain, .. }
            | Self::GetPid { domain, .. }
            | Self::TaskComplete { domain, .. }
            | Self::Fire { domain, .. }
            | Self::Kill { domain, .. }
            | Self::ClientEvent { domain, .. } => *domain = new_domain.into(),
        }
    }

    /// Name of the task this command refers to; `None` for `ClientEvent`.
    pub fn task_name(&self) -> Option<&str> {
        match self {
            Self::SetPid { task_name, .. }
            | Self::GetPid { task_name, .. }
            | Self::TaskComplete { task_name, .. }
            | Self::Kill { task_name, .. } => Some(task_name),
            Self::Fire { task, .. } => Some(&task.name),
            Self::ClientEvent { .. } => None,
        }
    }

    /// Registry key `"{domain}/{task_name}"`; `None` for `ClientEvent`.
    pub fn namespaced_task_name(&self) -> Option<String> {
        self.task_name()
            .map(|name| crate::registry::namespaced_key(self.domain(), name))
    }

    /// Serialize to the single-line wire payload.
    pub fn dump(&self) -> String {
        // A derived Serialize over strings, integers and maps cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Deserialize a wire payload.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the payload is malformed or names an unknown
    /// variant.
    pub fn load(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| Error::Protocol(format!("invalid command payload: {e}")))
    }

    /// Wrap as the broadcast message sent to the server.
    pub fn to_message(&self) -> BroadcastMessage {
        BroadcastMessage::new(self.domain(), EVENT_COMMAND, self.dump())
    }
}

/// Read the `"type"` tag of a payload without decoding the body.
///
/// # Errors
///
/// [`Error::Protocol`] if the payload is not a JSON object with a string tag.
pub fn payload_tag(payload: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Tagged {
        #[serde(rename = "type")]
        tag: String,
    }

    serde_json::from_str::<Tagged>(payload)
        .map(|t| t.tag)
        .map_err(|e| Error::Protocol(format!("payload has no command tag: {e}")))
}
