//! Simultaneous - fire-and-forget task launcher with a pub/sub channel.
//!
//! A long-running server launches named background programs on behalf of
//! clients, tracks their pids, and relays events between the launched tasks
//! and every client subscribed to the same domain.
//!
//! # Architecture
//!
//! ```text
//! Controller / TaskContext --TaskClient--> Server --fan-out--> Client(s)
//!                                            │
//!                                            ├─ Dispatcher (whitelist, pid registry)
//!                                            └─ Launcher (checks, fork/exec)
//! ```
//!
//! - **Server** - listens on TCP or a Unix socket, runs the event loop
//! - **Client** - subscribes to one domain and runs event callbacks
//! - **Controller** - fires, kills and signals named tasks
//! - **TaskContext** - used inside launched tasks to report back
//!
//! # Modules
//!
//! - [`transport`] - address parsing, listeners and streams
//! - [`message`] - wire format and incremental decoder
//! - [`command`] - typed commands and task descriptions
//! - [`dispatch`] - approved-command table and dispatcher
//! - [`launcher`] - privileged fork/exec of tasks

pub mod client;
pub mod command;
pub mod config;
pub mod constants;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod launcher;
pub mod message;
pub mod reactor;
pub mod registry;
pub mod server;
pub mod task;
pub mod task_client;
pub mod transport;

// Re-export commonly used types
pub use client::Client;
pub use command::{Command, CommandKind, Params, TaskDescription};
pub use config::Config;
pub use controller::Controller;
pub use dispatch::Reply;
pub use error::{Error, Result};
pub use message::BroadcastMessage;
pub use server::Server;
pub use task::{Delivery, TaskContext};
pub use task_client::TaskClient;
pub use transport::Address;
