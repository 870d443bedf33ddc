use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use tarry_common::{Transaction, internal, tracing};
use tokio::{sync::mpsc, task::JoinHandle};

use super::Shared;
use crate::error::DelayedDeliveryError;

pub(super) type DispatchTask = JoinHandle<Result<(), DelayedDeliveryError>>;

/// What the poll loop should do after one fetch
#[derive(Debug, PartialEq, Eq)]
enum Cycle {
    /// A message was handed off; fetch again straight away
    Dispatched,
    /// Nothing is due before this instant
    SleepUntil(DateTime<Utc>),
}

/// `now + max_sleep`, saturating at the latest representable instant
fn horizon(now: DateTime<Utc>, max_sleep: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(max_sleep)
        .ok()
        .and_then(|max_sleep| now.checked_add_signed(max_sleep))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(super) async fn poll(
    shared: Arc<Shared>,
    mut wake: mpsc::Receiver<()>,
    queue: mpsc::Sender<DispatchTask>,
) {
    internal!("Delayed message poll loop running");

    while !shared.token.is_cancelled() {
        let next = match shared.spin_once(&queue).await {
            Ok(cycle) => {
                shared.fetch_breaker.success();
                match cycle {
                    Cycle::Dispatched => continue,
                    Cycle::SleepUntil(next) => next,
                }
            }
            Err(e) if e.is_cancelled() || shared.token.is_cancelled() => break,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch due delayed messages");
                shared.fetch_breaker.failure(&e, &shared.token).await;
                continue;
            }
        };

        let sleep_for = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tracing::trace!(?sleep_for, next = %next, "Waiting for next due delayed message");

        tokio::select! {
            () = shared.token.cancelled() => break,
            () = tokio::time::sleep(sleep_for) => {}
            _ = wake.recv() => {
                tracing::trace!("Delayed message poller woken early");
            }
        }
    }

    // Dropping the sender lets the sink drain what is left and exit.
    drop(queue);
    internal!("Delayed message poll loop exited");
}

pub(super) async fn drain(shared: Arc<Shared>, mut pending: mpsc::Receiver<DispatchTask>) {
    while let Some(task) = pending.recv().await {
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(DelayedDeliveryError::from(e)),
        };

        if let Err(e) = result {
            tracing::error!(
                error = %e,
                "Failed to execute error handling for delayed message forwarding"
            );
            shared.failure_breaker.failure(&e);
        }
    }

    internal!("Delayed message completion sink drained");
}

impl Shared {
    /// Fetch the oldest due message and hand it off, or work out how long to sleep
    async fn spin_once(
        self: &Arc<Self>,
        queue: &mpsc::Sender<DispatchTask>,
    ) -> Result<Cycle, DelayedDeliveryError> {
        let now = Utc::now();
        let fetch = Transaction::begin();

        if let Some(message) = self.store.fetch_next_due_timeout(now, &fetch).await? {
            tracing::debug!(
                message_id = %message.message_id,
                destination = %message.destination,
                due = %message.time,
                "Fetched due delayed message"
            );

            // Reserve first so a full queue holds the loop back before the
            // next fetch. Dropping `fetch` on cancel releases the message.
            let permit = tokio::select! {
                () = self.token.cancelled() => return Err(DelayedDeliveryError::Cancelled),
                permit = queue.reserve() => permit.map_err(|_| DelayedDeliveryError::Cancelled)?,
            };

            let shared = Arc::clone(self);
            permit.send(tokio::spawn(async move {
                shared.handle_due_message(message, fetch).await
            }));
            return Ok(Cycle::Dispatched);
        }

        let lookup = Transaction::begin();
        let next = self.store.next(&lookup).await?;
        lookup.commit().await?;
        fetch.commit().await?;

        let horizon = horizon(now, self.settings.max_sleep_duration());
        Ok(Cycle::SleepUntil(
            next.map_or(horizon, |next| next.min(horizon)),
        ))
    }
}
