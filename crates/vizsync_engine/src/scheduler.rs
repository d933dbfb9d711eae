//! Cancellable delayed wake-ups.

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Handle to a pending wake-up.
///
/// Dropping the handle does not cancel the timer; call
/// [`ScheduledTask::cancel`].
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Cancels the wake-up. The paired [`Fired`] resolves to `Err`.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Returns true once the timer fired or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Completes when the paired [`ScheduledTask`] fires.
#[derive(Debug)]
pub struct Fired {
    rx: oneshot::Receiver<()>,
}

/// The scheduled wake-up was cancelled before it fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl Fired {
    /// Waits for the timer.
    pub async fn wait(self) -> Result<(), Cancelled> {
        self.rx.await.map_err(|_| Cancelled)
    }
}

/// Schedules a wake-up after `delay` on the current tokio runtime.
pub fn schedule_after(delay: Duration) -> (ScheduledTask, Fired) {
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(());
    });

    (ScheduledTask { handle }, Fired { rx })
}
