//! Event channel for the server event loop.
//!
//! The accept loop, connection read loops, in-process callers and launch
//! jobs all send through one `mpsc::UnboundedSender<ServerEvent>`. The loop
//! receives on the other end and is the only code that touches the
//! registry and the subscriber list.

use std::collections::HashMap;

use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;

use crate::command::Command;
use crate::dispatch::Reply;
use crate::error::Result;
use crate::message::BroadcastMessage;

/// Reply slot for an in-process command.
pub(crate) type ReplySender = oneshot::Sender<Result<Reply>>;

/// Event delivered to the server event loop.
#[derive(Debug)]
pub(crate) enum ServerEvent {
    /// A connection was accepted; `sender` queues bytes to its write loop.
    ClientConnected {
        /// Connection id, increasing in acceptance order.
        conn_id: u64,
        /// Encoded-bytes sender for the connection's write loop.
        sender: Sender<Vec<u8>>,
    },

    /// The peer closed the connection or a read failed.
    ClientDisconnected {
        /// Connection id.
        conn_id: u64,
    },

    /// A complete, valid message arrived on a connection.
    Message {
        /// Connection id.
        conn_id: u64,
        /// Decoded message; its data is a command payload.
        message: BroadcastMessage,
    },

    /// Run a command on behalf of an in-process caller.
    Run {
        /// Command to dispatch.
        command: Command,
        /// Where the outcome goes.
        reply: ReplySender,
    },

    /// A launch job finished on the blocking pool.
    Launched {
        /// Registry key of the launched task.
        key: String,
        /// Pid or launch error.
        result: Result<u32>,
        /// Caller waiting on the launch, if it came from [`ServerEvent::Run`].
        reply: Option<ReplySender>,
    },

    /// Snapshot of the pid registry.
    Pids {
        /// Receives the snapshot.
        reply: oneshot::Sender<HashMap<String, u32>>,
    },

    /// Number of connected subscribers.
    ConnectionCount {
        /// Receives the count.
        reply: oneshot::Sender<usize>,
    },
}
