//! Supervisor server.
//!
//! # Architecture
//!
//! ```text
//! accept loop ──ClientConnected──┐
//! read loops  ──Message/Disconn──┤
//! Server::run ──Run──────────────┼──► event loop (owns Dispatcher + subscribers)
//! launch jobs ──Launched─────────┘        │
//!                                         ├─► write loops (fan-out, acceptance order)
//!                                         └─► spawn_blocking(Launcher::launch)
//! ```
//!
//! Only the event loop touches the pid registry and the subscriber list.
//! Everything else talks to it through [`ServerEvent`]s.

mod connection;
mod events;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Sender, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::config::Config;
use crate::constants::SUBSCRIBER_QUEUE_LIMIT;
use crate::dispatch::{Dispatcher, Effect, Reply};
use crate::error::{Error, Result};
use crate::launcher::{LaunchRequest, Launcher, ProcessControl, SystemProcessControl};
use crate::message::BroadcastMessage;
use crate::registry::namespaced_key;
use crate::transport::{Address, Listener};

use events::{ReplySender, ServerEvent};

/// Running supervisor: listener, accept loop and event loop.
#[derive(Debug)]
pub struct Server {
    address: Address,
    events: UnboundedSender<ServerEvent>,
    shutdown: CancellationToken,
    accept_handle: Option<JoinHandle<()>>,
    loop_handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind `config.connection` and start serving with real process control.
    ///
    /// # Errors
    ///
    /// Binding or socket permission errors.
    pub async fn start(config: &Config) -> Result<Self> {
        Self::start_with_control(config, Arc::new(SystemProcessControl)).await
    }

    /// Like [`Server::start`] with a custom [`ProcessControl`].
    ///
    /// # Errors
    ///
    /// Binding or socket permission errors.
    pub async fn start_with_control(
        config: &Config,
        control: Arc<dyn ProcessControl>,
    ) -> Result<Self> {
        let listener = Address::parse(&config.connection).listen().await?;
        let address = listener.address()?;
        log::info!("[Server] Listening on {address}");

        let launcher = Launcher::new(address.to_string(), Arc::clone(&control))
            .with_umask(config.task_umask)
            .with_log_dir(config.task_log_dir.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let event_loop = EventLoop {
            dispatcher: Dispatcher::new(control),
            launcher: Arc::new(launcher),
            subscribers: Vec::new(),
            events: events_tx.clone(),
        };
        let loop_handle = tokio::spawn(event_loop.run(events_rx, shutdown.clone()));
        let accept_handle = tokio::spawn(accept_loop(listener, events_tx.clone(), shutdown.clone()));

        Ok(Self {
            address,
            events: events_tx,
            shutdown,
            accept_handle: Some(accept_handle),
            loop_handle: Some(loop_handle),
        })
    }

    /// Address the server actually listens on (real port for TCP port 0).
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Run `command` in-process. `Fire` waits for the launch to finish.
    ///
    /// # Errors
    ///
    /// Dispatcher and launcher errors, or [`Error::ServerClosed`].
    pub async fn run(&self, command: Command) -> Result<Reply> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(ServerEvent::Run { command, reply })
            .map_err(|_| Error::ServerClosed)?;
        rx.await.map_err(|_| Error::ServerClosed)?
    }

    /// Snapshot of the pid registry, keyed by `domain/task_name`.
    ///
    /// # Errors
    ///
    /// [`Error::ServerClosed`] after shutdown.
    pub async fn pids(&self) -> Result<HashMap<String, u32>> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(ServerEvent::Pids { reply })
            .map_err(|_| Error::ServerClosed)?;
        rx.await.map_err(|_| Error::ServerClosed)
    }

    /// Number of connected subscribers.
    ///
    /// # Errors
    ///
    /// [`Error::ServerClosed`] after shutdown.
    pub async fn connection_count(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(ServerEvent::ConnectionCount { reply })
            .map_err(|_| Error::ServerClosed)?;
        rx.await.map_err(|_| Error::ServerClosed)
    }

    /// Stop accepting, close every connection and remove the socket file.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }
        log::info!("[Server] Stopped listening on {}", self.address);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Accept connections until shutdown, then remove the socket file.
async fn accept_loop(
    listener: Listener,
    events: UnboundedSender<ServerEvent>,
    shutdown: CancellationToken,
) {
    let mut next_id: u64 = 0;

    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(stream) => {
                next_id += 1;
                log::debug!("[Server] Accepted connection {next_id}");
                if !connection::attach(next_id, stream, &events, &shutdown) {
                    break;
                }
            }
            Err(e) => {
                log::warn!("[Server] Accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    listener.cleanup();
}

/// State owned by the event loop task.
struct EventLoop {
    dispatcher: Dispatcher,
    launcher: Arc<Launcher>,
    /// Connected subscribers in acceptance order.
    subscribers: Vec<(u64, Sender<Vec<u8>>)>,
    /// For re-entering the loop when a launch job finishes.
    events: UnboundedSender<ServerEvent>,
}

impl EventLoop {
    async fn run(mut self, mut rx: UnboundedReceiver<ServerEvent>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = rx.recv() => event,
            };
            let Some(event) = event else { break };
            self.handle(event);
        }
        log::debug!(
            "[Server] Event loop stopped, dropping {} subscriber(s)",
            self.subscribers.len()
        );
    }

    fn handle(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ClientConnected { conn_id, sender } => {
                self.subscribers.push((conn_id, sender));
            }
            ServerEvent::ClientDisconnected { conn_id } => {
                self.subscribers.retain(|(id, _)| *id != conn_id);
                log::debug!("[Server] Connection {conn_id} removed");
            }
            ServerEvent::Message { conn_id, message } => {
                match self.dispatcher.run_payload(&message.data) {
                    Ok(effect) => self.apply(effect, None),
                    Err(e) => log::warn!(
                        "[Server] Rejected command from connection {conn_id} ({}/{}): {e}",
                        message.domain,
                        message.event
                    ),
                }
            }
            ServerEvent::Run { command, reply } => match self.dispatcher.run(command) {
                Ok(effect) => self.apply(effect, Some(reply)),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ServerEvent::Launched { key, result, reply } => {
                match &result {
                    Ok(pid) => log::debug!("[Server] {key} launched as pid {pid}"),
                    Err(e) => log::warn!("[Server] Launch of {key} failed: {e}"),
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result.map(Reply::Launched));
                }
            }
            ServerEvent::Pids { reply } => {
                let _ = reply.send(self.dispatcher.registry().snapshot());
            }
            ServerEvent::ConnectionCount { reply } => {
                let _ = reply.send(self.subscribers.len());
            }
        }
    }

    fn apply(&mut self, effect: Effect, reply: Option<ReplySender>) {
        match effect {
            Effect::Reply(value) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(value));
                }
            }
            Effect::Broadcast(message) => {
                self.broadcast(&message);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(Reply::None));
                }
            }
            Effect::Launch(request) => self.launch(request, reply),
        }
    }

    /// Encode once and queue to every subscriber, dropping closed ones and
    /// ones whose queue is full.
    fn broadcast(&mut self, message: &BroadcastMessage) {
        let bytes = message.encode();
        self.subscribers
            .retain(|(conn_id, sender)| match sender.try_send(bytes.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "[Server] Connection {conn_id} is {SUBSCRIBER_QUEUE_LIMIT} broadcasts behind, dropping it"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
        log::trace!(
            "[Server] Broadcast {}/{} to {} subscriber(s)",
            message.domain,
            message.event,
            self.subscribers.len()
        );
    }

    fn launch(&self, request: LaunchRequest, reply: Option<ReplySender>) {
        let launcher = Arc::clone(&self.launcher);
        let events = self.events.clone();
        let key = namespaced_key(&request.domain, &request.task.name);

        tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || launcher.launch(&request)).await {
                Ok(result) => result,
                Err(e) => Err(Error::Io(std::io::Error::other(e.to_string()))),
            };
            let _ = events.send(ServerEvent::Launched { key, result, reply });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Params, TaskDescription};
    use crate::constants::{EVENT_TASK_PID, READ_BUFFER_SIZE};
    use crate::launcher::LaunchPlan;
    use crate::message::MessageDecoder;
    use std::path::Path;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;
    use tokio::time::timeout;

    #[derive(Debug, Default)]
    struct Recorder {
        spawned: Mutex<Vec<LaunchPlan>>,
        terminated: Mutex<Vec<u32>>,
    }

    impl ProcessControl for Recorder {
        fn spawn(&self, plan: &LaunchPlan) -> std::io::Result<u32> {
            self.spawned.lock().unwrap().push(plan.clone());
            Ok(9999)
        }

        fn terminate(&self, pid: u32) -> std::io::Result<()> {
            self.terminated.lock().unwrap().push(pid);
            Ok(())
        }
    }

    async fn start(dir: &Path) -> (Server, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let config = Config {
            connection: dir.join("server.sock").display().to_string(),
            ..Config::default()
        };
        let server = Server::start_with_control(&config, recorder.clone())
            .await
            .unwrap();
        (server, recorder)
    }

    async fn connect(server: &Server) -> UnixStream {
        let Address::Unix(path) = server.address() else {
            panic!("expected a unix address");
        };
        UnixStream::connect(path).await.unwrap()
    }

    async fn wait_for_connections(server: &Server, n: usize) {
        timeout(Duration::from_secs(2), async {
            while server.connection_count().await.unwrap() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connections never registered");
    }

    async fn next_message(stream: &mut UnixStream, decoder: &mut MessageDecoder) -> BroadcastMessage {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut ready = Vec::new();
        timeout(Duration::from_secs(2), async {
            while ready.is_empty() {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "server closed the connection");
                ready = decoder.feed(&buf[..n]);
            }
        })
        .await
        .expect("no message received");
        ready.remove(0)
    }

    async fn send(stream: &mut UnixStream, domain: &str, mut command: Command) {
        command.set_domain(domain);
        stream
            .write_all(&command.to_message().encode())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_set_pid_over_socket_is_broadcast_and_registered() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (server, _) = start(tmp.path()).await;

        let mut subscriber = connect(&server).await;
        let mut sender = connect(&server).await;
        wait_for_connections(&server, 2).await;

        send(&mut sender, "example.com", Command::set_pid("publish", 4242)).await;

        let mut decoder = MessageDecoder::new();
        let message = next_message(&mut subscriber, &mut decoder).await;
        assert_eq!(
            message,
            BroadcastMessage::new("example.com", EVENT_TASK_PID, "publish 4242")
        );
        assert_eq!(server.pids().await.unwrap().get("example.com/publish"), Some(&4242));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_event_reaches_every_connection() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (server, _) = start(tmp.path()).await;

        let mut a = connect(&server).await;
        let mut b = connect(&server).await;
        wait_for_connections(&server, 2).await;

        server
            .run(Command::client_event("domain1", "a", "data"))
            .await
            .unwrap();

        for stream in [&mut a, &mut b] {
            let mut decoder = MessageDecoder::new();
            let message = next_message(stream, &mut decoder).await;
            assert_eq!(message, BroadcastMessage::new("domain1", "a", "data"));
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unapproved_wire_command_is_dropped_and_connection_survives() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (server, _) = start(tmp.path()).await;

        let mut stream = connect(&server).await;
        wait_for_connections(&server, 1).await;

        let bogus = BroadcastMessage::new(
            "example.com",
            "command",
            r#"{"type":"shutdown","domain":"example.com","task_name":"publish","pid":1}"#,
        );
        stream.write_all(&bogus.encode()).await.unwrap();
        stream.write_all(b"garbage\n\n").await.unwrap();
        send(&mut stream, "example.com", Command::set_pid("publish", 7)).await;

        let mut decoder = MessageDecoder::new();
        let message = next_message(&mut stream, &mut decoder).await;
        assert_eq!(message.data, "publish 7");

        let pids = server.pids().await.unwrap();
        assert_eq!(pids.len(), 1);
        assert_eq!(server.connection_count().await.unwrap(), 1);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_kill_signals_registered_pid() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (server, recorder) = start(tmp.path()).await;

        let mut set = Command::set_pid("publish", 99999);
        set.set_domain("example.com");
        assert_eq!(server.run(set).await.unwrap(), Reply::None);

        let mut kill = Command::kill("publish");
        kill.set_domain("example.com");
        assert_eq!(server.run(kill).await.unwrap(), Reply::Pid(Some(99999)));

        let mut unknown = Command::kill("other");
        unknown.set_domain("example.com");
        assert_eq!(server.run(unknown).await.unwrap(), Reply::Pid(None));

        assert_eq!(*recorder.terminated.lock().unwrap(), [99999]);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_fire_launches_through_blocking_pool() {
        let tmp = tempfile::TempDir::new().unwrap();
        let binary = tmp.path().join("binary");
        std::fs::write(&binary, "#!/bin/sh\n").unwrap();
        let (server, recorder) = start(tmp.path()).await;

        let task = TaskDescription::new("publish", binary.display().to_string())
            .with_niceness(10)
            .with_param("param1", "param1")
            .with_env("ENV_PARAM", "envparam");
        let overrides: Params = [("param2", "param2")].into_iter().collect();
        let mut fire = Command::fire(task, &overrides);
        fire.set_domain("example.org");

        assert_eq!(server.run(fire).await.unwrap(), Reply::Launched(9999));

        let spawned = recorder.spawned.lock().unwrap();
        assert_eq!(spawned.len(), 1);
        assert_eq!(
            spawned[0].command_line(),
            format!(r#"{} --param1="param1" --param2="param2""#, binary.display())
        );
        assert_eq!(spawned[0].env_var("ENV_PARAM"), Some("envparam"));
        assert_eq!(
            spawned[0].env_var(crate::constants::ENV_CONNECTION),
            Some(server.address().to_string().as_str())
        );
        drop(spawned);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_fire_missing_binary_reports_file_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (server, recorder) = start(tmp.path()).await;

        let task = TaskDescription::new("publish", "/definitely/not/here");
        let err = server.run(Command::fire(task, &Params::new())).await.unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)), "got {err:?}");
        assert!(recorder.spawned.lock().unwrap().is_empty());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnected_clients_are_removed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (server, _) = start(tmp.path()).await;

        let stream = connect(&server).await;
        wait_for_connections(&server, 1).await;
        drop(stream);
        wait_for_connections(&server, 0).await;

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_subscriber_is_dropped_once_its_queue_is_full() {
        let recorder = Arc::new(Recorder::default());
        let (events, _events_rx) = mpsc::unbounded_channel();
        let mut event_loop = EventLoop {
            dispatcher: Dispatcher::new(recorder.clone()),
            launcher: Arc::new(Launcher::new("/tmp/unused.sock", recorder)),
            subscribers: Vec::new(),
            events,
        };

        let (stalled_tx, _stalled_rx) = mpsc::channel(SUBSCRIBER_QUEUE_LIMIT);
        let (live_tx, mut live_rx) = mpsc::channel(SUBSCRIBER_QUEUE_LIMIT);
        event_loop.handle(ServerEvent::ClientConnected { conn_id: 1, sender: stalled_tx });
        event_loop.handle(ServerEvent::ClientConnected { conn_id: 2, sender: live_tx });

        let message = BroadcastMessage::new("example.com", "tick", "x");
        for _ in 0..=SUBSCRIBER_QUEUE_LIMIT {
            event_loop.broadcast(&message);
            // Keep the second subscriber drained.
            while live_rx.try_recv().is_ok() {}
        }

        let ids: Vec<u64> = event_loop.subscribers.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, [2]);
    }

    #[tokio::test]
    async fn test_shutdown_removes_socket_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (server, _) = start(tmp.path()).await;
        let socket = tmp.path().join("server.sock");
        assert!(socket.exists());

        server.shutdown().await;
        assert!(!socket.exists());
    }
}
