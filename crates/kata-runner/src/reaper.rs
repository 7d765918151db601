//! Reaps `docker exec` clients abandoned after a deadline kill.
//!
//! The timeout path hands its SIGKILLed child here and returns at the
//! deadline; a background thread waits for the child so no zombie outlives
//! the run.

use std::process::Child;
use std::sync::{mpsc, Mutex, OnceLock};
use std::thread;

static QUEUE: OnceLock<Mutex<Option<mpsc::Sender<Child>>>> = OnceLock::new();

/// Takes ownership of an already-killed child and reaps it in the background.
pub fn register(child: Child) {
    let queue = QUEUE.get_or_init(|| Mutex::new(start()));
    let child = match queue.lock() {
        Ok(mut tx) => {
            let sent = match tx.as_ref() {
                Some(sender) => sender.send(child),
                None => Err(mpsc::SendError(child)),
            };
            match sent {
                Ok(()) => return,
                Err(mpsc::SendError(child)) => {
                    // No reaper thread; later callers wait inline too.
                    *tx = None;
                    child
                }
            }
        }
        Err(poisoned) => {
            tracing::warn!(error = %poisoned, "reaper queue poisoned; reaping inline");
            child
        }
    };
    wait_killed(child);
}

fn start() -> Option<mpsc::Sender<Child>> {
    let (tx, rx) = mpsc::channel::<Child>();
    let spawned = thread::Builder::new()
        .name("kata-runner-reaper".to_string())
        .spawn(move || rx.into_iter().for_each(wait_killed));
    match spawned {
        Ok(_) => Some(tx),
        Err(e) => {
            tracing::warn!(error = %e, "reaper thread unavailable; reaping inline");
            None
        }
    }
}

/// Blocks until `child` exits. Callers have already sent SIGKILL, so this is
/// prompt.
fn wait_killed(mut child: Child) {
    let pid = child.id();
    match child.wait() {
        Ok(status) => tracing::trace!(pid, %status, "reaped"),
        Err(e) => tracing::debug!(pid, error = %e, "reap failed"),
    }
}
