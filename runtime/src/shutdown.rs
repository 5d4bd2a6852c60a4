//! Shutdown signalling shared by every long-lived task.
//!
//! The supervisor owns a `watch::Sender<bool>` and flips it to `true` once. Tasks hold
//! receivers and check them between units of work. A dropped sender counts as shutdown.

use std::time::Duration;
use tokio::sync::watch;

/// Create a shutdown channel in the running state.
#[must_use]
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once shutdown has been requested.
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay` unless shutdown comes first.
///
/// Returns `true` if the full delay elapsed.
pub async fn sleep_or_cancel(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = cancelled(shutdown) => false,
    }
}
