//! Command dispatch against an explicit whitelist.
//!
//! The [`Dispatcher`] owns the [`ProcessRegistry`] and is driven by the
//! server event loop alone, so it needs no locking: every mutation of the
//! registry happens on that one task.
//!
//! Every command, typed or raw, is checked against [`APPROVED`] before
//! anything else happens. For raw payloads the check runs on the wire tag,
//! before the body is even decoded.

use std::sync::Arc;

use crate::command::{payload_tag, Command, CommandKind};
use crate::constants::{EVENT_TASK_COMPLETE, EVENT_TASK_PID};
use crate::error::{Error, Result};
use crate::launcher::{signalable_pid, LaunchRequest, ProcessControl};
use crate::message::BroadcastMessage;
use crate::registry::{namespaced_key, ProcessRegistry};

/// Commands the server will execute. Nothing else is ever dispatched.
pub const APPROVED: [CommandKind; 6] = [
    CommandKind::SetPid,
    CommandKind::GetPid,
    CommandKind::TaskComplete,
    CommandKind::Fire,
    CommandKind::Kill,
    CommandKind::ClientEvent,
];

/// Resolve a wire tag to an approved command kind.
///
/// # Errors
///
/// [`Error::Permissions`] for any tag not in [`APPROVED`].
pub fn approve(tag: &str) -> Result<CommandKind> {
    CommandKind::from_tag(tag)
        .filter(|kind| APPROVED.contains(kind))
        .ok_or_else(|| Error::Permissions(format!("command `{tag}` is not approved")))
}

/// Value returned to an in-process caller of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Nothing to report.
    None,
    /// `GetPid` result, or the pid a `Kill` signalled (`None`: nothing
    /// registered, nothing signalled).
    Pid(Option<u32>),
    /// `Fire` launched a process with this pid.
    Launched(u32),
}

/// What the event loop must do after a command ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Done; hand the reply to the caller.
    Reply(Reply),
    /// Publish to every subscriber.
    Broadcast(BroadcastMessage),
    /// Launch off the event loop.
    Launch(LaunchRequest),
}

/// Executes approved commands against the registry.
#[derive(Debug)]
pub struct Dispatcher {
    registry: ProcessRegistry,
    control: Arc<dyn ProcessControl>,
}

impl Dispatcher {
    /// Dispatcher with an empty registry.
    pub fn new(control: Arc<dyn ProcessControl>) -> Self {
        Self {
            registry: ProcessRegistry::new(),
            control,
        }
    }

    /// Read access to the pid table.
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Check the tag of a raw payload, decode it and run it.
    ///
    /// # Errors
    ///
    /// [`Error::Permissions`] for unapproved tags (body never decoded),
    /// [`Error::Protocol`] for malformed payloads, and anything
    /// [`Dispatcher::run`] returns.
    pub fn run_payload(&mut self, payload: &str) -> Result<Effect> {
        let tag = payload_tag(payload)?;
        approve(&tag)?;
        let command = Command::load(payload)?;
        self.run(command)
    }

    /// Run a command.
    ///
    /// # Errors
    ///
    /// [`Error::Permissions`] for unapproved kinds, [`Error::Protocol`] for
    /// task names containing `/` or pids that do not name a single
    /// process, and [`Error::Io`] when signalling fails.
    pub fn run(&mut self, command: Command) -> Result<Effect> {
        approve(command.kind().tag())?;

        // Registry keys are `domain/task`; a `/` in the task name could
        // alias another domain's entry.
        if let Some(name) = command.task_name() {
            if name.contains('/') {
                return Err(Error::Protocol(format!("task name `{name}` contains '/'")));
            }
        }

        match command {
            Command::GetPid { domain, task_name } => {
                Ok(Effect::Reply(Reply::Pid(self.registry.get(&domain, &task_name))))
            }
            Command::SetPid {
                domain,
                task_name,
                pid,
            } => {
                if signalable_pid(pid).is_none() {
                    return Err(Error::Protocol(format!(
                        "pid {pid} for {} does not name a single process",
                        namespaced_key(&domain, &task_name)
                    )));
                }
                self.registry.set(&domain, &task_name, pid);
                Ok(Effect::Broadcast(BroadcastMessage::new(
                    domain,
                    EVENT_TASK_PID,
                    format!("{task_name} {pid}"),
                )))
            }
            Command::TaskComplete { domain, task_name } => {
                log::info!("[Dispatch] Task complete: {}", namespaced_key(&domain, &task_name));
                Ok(Effect::Broadcast(BroadcastMessage::new(
                    domain,
                    EVENT_TASK_COMPLETE,
                    task_name,
                )))
            }
            Command::Kill { domain, task_name } => {
                let Some(pid) = self.registry.get(&domain, &task_name) else {
                    log::debug!(
                        "[Dispatch] Kill {}: no registered pid",
                        namespaced_key(&domain, &task_name)
                    );
                    return Ok(Effect::Reply(Reply::Pid(None)));
                };
                log::info!(
                    "[Dispatch] Sending SIGTERM to {} (pid {pid})",
                    namespaced_key(&domain, &task_name)
                );
                self.control.terminate(pid)?;
                Ok(Effect::Reply(Reply::Pid(Some(pid))))
            }
            Command::ClientEvent {
                domain,
                event,
                data,
            } => Ok(Effect::Broadcast(BroadcastMessage::new(domain, event, data))),
            Command::Fire {
                domain,
                task,
                params,
            } => Ok(Effect::Launch(LaunchRequest {
                domain,
                task,
                params,
            })),
        }
    }
}
