//! Wire, environment and filesystem constants.
//!
//! Centralizes names shared between the server, clients and launched tasks
//! so both ends of the channel agree on them.

// ============================================================================
// Environment
// ============================================================================

/// Connection address a launched task reports back on.
pub const ENV_CONNECTION: &str = "SIMULTANEOUS_CONNECTION";

/// Domain the task was fired under.
pub const ENV_DOMAIN: &str = "SIMULTANEOUS_DOMAIN";

/// Name of the task, used to build its registry key.
pub const ENV_TASK_NAME: &str = "SIMULTANEOUS_TASK_NAME";

/// Overrides the per-task log directory of the server.
pub const ENV_TASK_LOG_DIR: &str = "SIMULTANEOUS_TASK_LOG_DIR";

/// Default server address when none is configured.
pub const DEFAULT_CONNECTION: &str = "/tmp/simultaneous-server.sock";

// ============================================================================
// Wire events
// ============================================================================

/// Event name carrying a serialized command from a client to the server.
pub const EVENT_COMMAND: &str = "command";

/// Broadcast after a task registered its pid. Data: `"{task_name} {pid}"`.
pub const EVENT_TASK_PID: &str = "task_pid";

/// Broadcast when a task reports completion. Data: the task name.
pub const EVENT_TASK_COMPLETE: &str = "task_complete";

// ============================================================================
// Filesystem & process
// ============================================================================

/// Unix socket file mode: owner and group rwx, nothing for others.
pub const SOCKET_MODE: u32 = 0o770;

/// File-creation mask applied in launched tasks.
pub const TASK_UMASK: u32 = 0o022;

/// Socket read buffer size.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Longest line the decoder buffers before discarding it (1 MiB).
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Largest message (all lines) the decoder holds before discarding it (4 MiB).
pub const MAX_MESSAGE_LENGTH: usize = 4 * 1024 * 1024;

/// Broadcasts queued for one subscriber before it is disconnected.
pub const SUBSCRIBER_QUEUE_LIMIT: usize = 1024;
