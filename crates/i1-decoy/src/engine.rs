//! Engine: connects the attempt tracker to the zone publisher.
//!
//! Tracker calls take the shared lock only for map updates. Logging and
//! publishing happen after it is released.

use chrono::{DateTime, Utc};
use std::net::IpAddr;
use tracing::{debug, error, info, warn};

use crate::publisher::ZonePublisher;
use crate::tracker::{AttemptEvent, AttemptTracker, BlockSnapshot, RecordOutcome, SweepOutcome};

/// Shared state used by every listener and the expiry scheduler.
pub struct DecoyEngine {
    tracker: AttemptTracker,
    publisher: ZonePublisher,
}

impl DecoyEngine {
    pub const fn new(tracker: AttemptTracker, publisher: ZonePublisher) -> Self {
        Self { tracker, publisher }
    }

    pub const fn tracker(&self) -> &AttemptTracker {
        &self.tracker
    }

    pub const fn publisher(&self) -> &ZonePublisher {
        &self.publisher
    }

    /// Record a connection from `ip` observed now.
    pub async fn record_attempt(&self, ip: IpAddr) -> RecordOutcome {
        self.record_attempt_at(ip, Utc::now()).await
    }

    /// Record a connection from `ip` observed at `now`.
    pub async fn record_attempt_at(&self, ip: IpAddr, now: DateTime<Utc>) -> RecordOutcome {
        let outcome = self.tracker.record_attempt(ip, now);

        match outcome.event {
            AttemptEvent::New | AttemptEvent::AlreadyBlocked => {
                info!(ip = %ip, status = outcome.event.label(), "incoming connection");
            }
            AttemptEvent::Counted => {
                debug!(ip = %ip, count = outcome.count, "incoming connection");
            }
            AttemptEvent::NewBlock => {
                warn!(ip = %ip, count = outcome.count, "blocked IP");
                info!(ip = %ip, status = outcome.event.label(), "incoming connection");
            }
        }

        if let Some(snapshot) = &outcome.publish {
            self.publish(snapshot).await;
        }
        outcome
    }

    /// Expire idle records as of `now` and publish if any block was lifted.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> SweepOutcome {
        let outcome = self.tracker.sweep_expired(now);

        for ip in &outcome.expired {
            info!(ip = %ip, "attempts expired");
        }
        for ip in &outcome.unblocked {
            info!(ip = %ip, "unblocking IP");
        }

        if let Some(snapshot) = &outcome.publish {
            self.publish(snapshot).await;
        }
        outcome
    }

    /// Seed blocks read from the existing zone. Never publishes.
    pub fn rehydrate(&self, ips: impl IntoIterator<Item = IpAddr>, now: DateTime<Utc>) -> usize {
        self.tracker.rehydrate(ips, now)
    }

    async fn publish(&self, snapshot: &BlockSnapshot) {
        if let Err(e) = self.publisher.publish(snapshot).await {
            error!(
                error = %e,
                generation = snapshot.generation,
                blocked = snapshot.ips.len(),
                "zone publish failed, zone stays stale until the next block change"
            );
        }
    }
}
