//! Background execution units owned by the controller.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Poll step while waiting for a thread to finish.
const JOIN_POLL: Duration = Duration::from_millis(5);

/// A thread-backed unit of work with a cooperative stop flag.
pub trait Worker {
    /// Name used in shutdown logs.
    fn name(&self) -> String;

    /// Request termination. Idempotent and non-blocking.
    fn stop(&self);

    /// Whether the underlying thread has exited (or was never started).
    fn is_finished(&self) -> bool;

    /// Wait up to `timeout` for the thread to exit. Returns `true` when it did.
    fn join(&mut self, timeout: Duration) -> bool;
}

/// Join `handle` if it finishes within `timeout`.
///
/// On timeout the handle is put back so a later call can retry.
pub(crate) fn join_within(handle: &mut Option<JoinHandle<()>>, timeout: Duration) -> bool {
    let Some(h) = handle.take() else {
        return true;
    };
    let deadline = Instant::now() + timeout;
    while !h.is_finished() {
        if Instant::now() >= deadline {
            *handle = Some(h);
            return false;
        }
        std::thread::sleep(JOIN_POLL);
    }
    if h.join().is_err() {
        log::warn!("Worker thread panicked");
    }
    true
}

/// Stop every worker, then join each within `timeout`.
///
/// Returns the names of workers that did not exit in time.
pub fn shutdown_all(workers: &mut [&mut dyn Worker], timeout: Duration) -> Vec<String> {
    for worker in workers.iter() {
        worker.stop();
    }
    workers
        .iter_mut()
        .filter_map(|worker| {
            if worker.join(timeout) {
                None
            } else {
                log::warn!("{} did not terminate within {timeout:?}", worker.name());
                Some(worker.name())
            }
        })
        .collect()
}
