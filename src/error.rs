//! Error taxonomy for the command channel and task launcher.
//!
//! Library code returns [`Result`]; the binary wraps these in `anyhow`.

use std::path::PathBuf;

/// Errors raised by dispatch, launch and transport operations.
#[derive(Debug)]
pub enum Error {
    /// A wire payload could not be decoded into a command.
    Protocol(String),
    /// The command is not on the approved list, or the target binary is not
    /// owned by the effective user.
    Permissions(String),
    /// The task's executable does not exist.
    FileNotFound(PathBuf),
    /// No task with this name was registered with the controller.
    UnknownTask(String),
    /// The server event loop is gone.
    ServerClosed,
    /// Underlying socket or process error.
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::Permissions(msg) => write!(f, "Permission denied: {msg}"),
            Self::FileNotFound(path) => write!(f, "Binary not found: {}", path.display()),
            Self::UnknownTask(name) => write!(f, "Unknown task: {name}"),
            Self::ServerClosed => write!(f, "Server event loop closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
