//! Process-wide runtime for synchronous callers.
//!
//! Async code brings its own runtime. Code outside any runtime (task
//! helpers, blocking client connects) shares one multi-thread runtime that
//! is started on first use and lives for the rest of the process.

use std::io;
use std::sync::{Mutex, OnceLock, PoisonError};

use tokio::runtime::{Handle, Runtime};

static REACTOR: OnceLock<Runtime> = OnceLock::new();
static STARTING: Mutex<()> = Mutex::new(());

/// The shared runtime, started on first call. Later calls return the same
/// runtime.
pub fn shared() -> io::Result<&'static Runtime> {
    if let Some(runtime) = REACTOR.get() {
        return Ok(runtime);
    }

    let _starting = STARTING.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(runtime) = REACTOR.get() {
        return Ok(runtime);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("simultaneous-reactor")
        .build()?;
    log::debug!("[Reactor] Started shared runtime");
    Ok(REACTOR.get_or_init(|| runtime))
}

/// Handle to the shared runtime.
pub fn handle() -> io::Result<Handle> {
    shared().map(|runtime| runtime.handle().clone())
}

/// Returns `true` when called from inside any tokio runtime.
pub fn in_runtime() -> bool {
    Handle::try_current().is_ok()
}
