//! Expiry scheduler: runs the sweep on a fixed interval.
//!
//! Missed ticks are skipped, not replayed. Each wake runs exactly one
//! sweep stamped with the wake time.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::engine::DecoyEngine;

/// Sweep every `interval` until shutdown is signalled.
///
/// A sweep in progress (including its publish) always finishes before the
/// loop notices shutdown.
pub async fn run(engine: Arc<DecoyEngine>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                engine.sweep_expired(Utc::now()).await;
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("expiry scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneSettings;
    use crate::publisher::tests::RecordingSink;
    use crate::publisher::ZonePublisher;
    use crate::tracker::{AttemptState, AttemptTracker};
    use chrono::TimeDelta;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_scheduler_expires_and_stops() {
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(DecoyEngine::new(
            AttemptTracker::new(1, TimeDelta::minutes(60)),
            ZonePublisher::new(ZoneSettings::default(), sink.clone(), None),
        ));
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 44));
        engine
            .record_attempt_at(ip, Utc::now() - TimeDelta::minutes(90))
            .await;
        assert_eq!(sink.installs.lock().len(), 1);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run(Arc::clone(&engine), Duration::from_millis(10), rx));

        for _ in 0..200 {
            if engine.tracker().state(ip) == AttemptState::Unseen {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.tracker().state(ip), AttemptState::Unseen);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let installs = sink.installs.lock();
        assert_eq!(installs.len(), 2);
        assert!(crate::zone::parse(&installs[1]).blocked.is_empty());
    }

    #[test]
    fn test_scheduler_exits_when_already_shut_down() {
        let (_tx, rx) = watch::channel(true);
        let engine = Arc::new(DecoyEngine::new(
            AttemptTracker::new(5, TimeDelta::minutes(60)),
            ZonePublisher::new(
                ZoneSettings::default(),
                Arc::new(RecordingSink::default()),
                None,
            ),
        ));
        tokio_test::block_on(run(engine, Duration::from_secs(1), rx));
    }
}
