use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;

/// Non-blocking handle for waking the poll loop early
///
/// Backed by a single-slot channel: while a wake is pending further wakes
/// are dropped, so any number of signals between two loop iterations yields
/// exactly one early wake. Signalling never blocks.
#[derive(Debug, Clone)]
pub struct PollerWaker {
    sender: mpsc::Sender<()>,
    max_sleep: Duration,
}

impl PollerWaker {
    pub(crate) fn channel(max_sleep: Duration) -> (Self, mpsc::Receiver<()>) {
        let (sender, receiver) = mpsc::channel(1);
        (Self { sender, max_sleep }, receiver)
    }

    /// Hint that a message becomes due at `due`
    ///
    /// Only wakes the loop if `due` falls within one max sleep duration of
    /// now; anything later is picked up by the loop's own schedule. Returns
    /// `true` if a new wake was queued.
    pub fn signal(&self, due: DateTime<Utc>) -> bool {
        let within_horizon = TimeDelta::from_std(self.max_sleep)
            .ok()
            .and_then(|max_sleep| Utc::now().checked_add_signed(max_sleep))
            .is_none_or(|horizon| due <= horizon);

        within_horizon && self.wake()
    }

    /// Wake the loop unconditionally
    ///
    /// Returns `false` if a wake was already pending.
    pub fn wake(&self) -> bool {
        self.sender.try_send(()).is_ok()
    }
}
