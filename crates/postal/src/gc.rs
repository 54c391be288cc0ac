//! Message GC: periodic deletion of expired delivery records.
//!
//! Only the message store is touched; queued jobs have their own lifecycle.
//! A failed sweep is logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_common::error::AppError;

use crate::messages::MessageStore;

pub struct MessageGc {
    messages: Arc<dyn MessageStore>,
    lifetime: Duration,
    interval: Duration,
}

impl MessageGc {
    pub fn new(messages: Arc<dyn MessageStore>, lifetime: Duration, interval: Duration) -> Self {
        Self {
            messages,
            lifetime,
            interval,
        }
    }

    /// Delete messages created strictly before `now - lifetime`, whatever
    /// their status.
    pub async fn collect(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let lifetime = chrono::Duration::from_std(self.lifetime)
            .map_err(|e| AppError::Config(format!("message lifetime out of range: {e}")))?;
        let cutoff = now
            .checked_sub_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let deleted = self.messages.delete_before(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, %cutoff, "Expired messages deleted");
        } else {
            tracing::debug!(%cutoff, "No expired messages");
        }
        Ok(deleted)
    }

    /// Sweep every interval, starting immediately. Runs until the task is
    /// cancelled.
    pub async fn run(self) {
        tracing::info!(
            lifetime_secs = self.lifetime.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Message GC started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.collect(Utc::now()).await {
                tracing::warn!(error = %e, "Message GC sweep failed, retrying next interval");
            }
        }
    }
}
