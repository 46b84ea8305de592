//! Detached background work and process signalling helpers.
//!
//! Completion side effects and resume waits run as detached tasks: nothing
//! awaits them on the scheduling path. [`spawn_detached`] isolates panics so
//! a failing side effect is logged instead of tearing down the runtime task
//! silently. The returned handle exists for tests; production callers drop it.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Spawn `work` detached, catching and logging any panic.
///
/// The handle resolves to `true` when the work completed and `false` when it
/// panicked.
pub fn spawn_detached<F>(label: &'static str, ticket: u64, work: F) -> JoinHandle<bool>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(()) => true,
            Err(panic) => {
                error!(
                    task = label,
                    ticket,
                    panic = panic_message(panic.as_ref()),
                    "detached task panicked"
                );
                false
            }
        }
    })
}

/// Best-effort text of a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Send SIGTERM to `pid`. Returns whether the signal was delivered.
#[cfg(unix)]
#[must_use]
pub fn send_terminate(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range for signalling");
        return false;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid, "process already gone");
            false
        }
        Err(err) => {
            warn!(pid, %err, "failed to send SIGTERM");
            false
        }
    }
}

/// No polite signal exists off unix; callers fall through to force-kill.
#[cfg(not(unix))]
#[must_use]
pub fn send_terminate(pid: u32) -> bool {
    debug!(pid, "SIGTERM unsupported on this platform");
    false
}
