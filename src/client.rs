//! Subscribing client.
//!
//! ```text
//! callbacks <--domain filter-- read loop <--messages-- socket <--> Server
//! Client::run --> frame_tx --> write loop ----------> socket
//! ```
//!
//! A client belongs to one domain. Messages for other domains are dropped
//! in the read loop; the rest go to the callbacks registered for their
//! event, in registration order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::command::Command;
use crate::constants::READ_BUFFER_SIZE;
use crate::error::{Error, Result};
use crate::message::MessageDecoder;
use crate::reactor;
use crate::transport::{Address, ReadHalf, WriteHalf};

/// Event callback; receives the message payload.
pub type Callback = Arc<dyn Fn(&str) + Send + Sync>;

type Subscribers = Arc<Mutex<HashMap<String, Vec<Callback>>>>;

/// Connection to the server on behalf of one domain.
pub struct Client {
    domain: String,
    subscribers: Subscribers,
    frame_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    read_handle: Option<JoinHandle<()>>,
    write_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events: Vec<String> = self
            .subscribers
            .lock()
            .map(|subs| subs.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("Client")
            .field("domain", &self.domain)
            .field("events", &events)
            .field("connected", &self.frame_tx.is_some())
            .finish()
    }
}

impl Client {
    /// Connect to `address` as a member of `domain`.
    ///
    /// # Errors
    ///
    /// Connection errors.
    pub async fn connect(domain: impl Into<String>, address: &Address) -> Result<Self> {
        let domain = domain.into();
        let stream = address.connect().await?;
        let (reader, writer) = stream.into_split();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let subscribers: Subscribers = Arc::default();

        let read_handle = tokio::spawn(read_loop(
            reader,
            domain.clone(),
            Arc::clone(&subscribers),
        ));
        let write_handle = tokio::spawn(write_loop(writer, frame_rx));

        log::debug!("[Client] Connected to {address} as {domain}");
        Ok(Self {
            domain,
            subscribers,
            frame_tx: Some(frame_tx),
            read_handle: Some(read_handle),
            write_handle: Some(write_handle),
        })
    }

    /// [`Client::connect`] for callers outside any runtime. The connection
    /// lives on the shared reactor.
    ///
    /// # Errors
    ///
    /// Connection errors, or [`Error::Io`] when called from inside a
    /// runtime (use [`Client::connect`] there).
    pub fn connect_blocking(domain: impl Into<String>, address: &Address) -> Result<Self> {
        if reactor::in_runtime() {
            return Err(Error::Io(std::io::Error::other(
                "connect_blocking called from inside a tokio runtime",
            )));
        }
        reactor::handle()?.block_on(Self::connect(domain, address))
    }

    /// Domain this client belongs to.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Register `callback` for `event`. Callbacks for the same event run
    /// in registration order.
    pub fn on_event<F>(&self, event: impl Into<String>, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.into())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Stamp this client's domain on `command` and queue it for the server.
    ///
    /// # Errors
    ///
    /// [`Error::ServerClosed`] once the connection is gone.
    pub fn run(&self, mut command: Command) -> Result<()> {
        command.set_domain(self.domain.as_str());
        let frame_tx = self.frame_tx.as_ref().ok_or(Error::ServerClosed)?;
        frame_tx
            .send(command.to_message().encode())
            .map_err(|_| Error::ServerClosed)
    }

    /// Flush queued commands, then close the connection.
    pub async fn close(mut self) {
        self.frame_tx = None;
        if let Some(handle) = self.write_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.read_handle.take() {
            handle.abort();
        }
        log::debug!("[Client] Closed connection for {}", self.domain);
    }

    /// [`Client::close`] for callers outside any runtime.
    pub fn close_blocking(self) {
        match reactor::handle() {
            Ok(handle) => handle.block_on(self.close()),
            Err(e) => log::warn!("[Client] No reactor to close on: {e}"),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(handle) = self.read_handle.take() {
            handle.abort();
        }
    }
}

async fn read_loop(mut reader: ReadHalf, domain: String, subscribers: Subscribers) {
    let mut decoder = MessageDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::debug!("[Client] Server closed the connection");
                break;
            }
            Ok(n) => {
                for message in decoder.feed(&buf[..n]) {
                    if message.domain != domain {
                        continue;
                    }
                    // Clone out so callbacks may register more callbacks.
                    let callbacks: Vec<Callback> = subscribers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get(&message.event)
                        .cloned()
                        .unwrap_or_default();
                    for callback in callbacks {
                        callback(&message.data);
                    }
                }
            }
            Err(e) => {
                log::warn!("[Client] Read error: {e}");
                break;
            }
        }
    }
}

async fn write_loop(mut writer: WriteHalf, mut frame_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = frame_rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            log::warn!("[Client] Write error: {e}");
            return;
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}
