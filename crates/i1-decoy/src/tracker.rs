//! Attempt tracker: per-IP state machine and the block set.
//!
//! ```text
//!   Unseen --attempt--> Observed(1) --attempt--> ... --attempt (count >= threshold)--> Blocked
//!     ^                      |                                                         |
//!     +------ sweep (now - last_seen >= timeout) ---------------------------------------+
//! ```
//!
//! The attempt records and the block set live behind a single mutex. No I/O
//! happens while it is held: every change to block set membership bumps a
//! generation counter and hands back a [`BlockSnapshot`], which the caller
//! publishes after the lock is released.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

/// Attempts recorded for one source IP since it was first seen (or last expired).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Connections seen, always >= 1.
    pub count: u32,
    /// Time of the most recent connection (or of rehydration).
    pub last_seen: DateTime<Utc>,
}

/// Logical state of one IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// No record.
    Unseen,
    /// Tracked, below the block threshold.
    Observed {
        count: u32,
        last_seen: DateTime<Utc>,
    },
    /// Tracked and present in the block set.
    Blocked {
        count: u32,
        last_seen: DateTime<Utc>,
    },
}

/// What a single recorded attempt did to its IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEvent {
    /// First connection from this IP.
    New,
    /// Count raised, still below threshold.
    Counted,
    /// Threshold reached: the IP joined the block set.
    NewBlock,
    /// The IP was already blocked; only `last_seen` and the count moved.
    AlreadyBlocked,
}

impl AttemptEvent {
    /// Short label used in connection log lines.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Counted => "observed",
            Self::NewBlock => "new block",
            Self::AlreadyBlocked => "blocked",
        }
    }
}

/// Point-in-time copy of the block set, taken under the tracker lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSnapshot {
    /// Incremented on every membership change.
    pub generation: u64,
    /// Blocked addresses in ascending order.
    pub ips: Vec<IpAddr>,
}

/// Result of [`AttemptTracker::record_attempt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub event: AttemptEvent,
    /// Count after this attempt.
    pub count: u32,
    /// Present only when block set membership changed.
    pub publish: Option<BlockSnapshot>,
}

/// Result of [`AttemptTracker::sweep_expired`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Every record removed by this sweep.
    pub expired: Vec<IpAddr>,
    /// The subset of `expired` that left the block set.
    pub unblocked: Vec<IpAddr>,
    /// Present only when block set membership changed.
    pub publish: Option<BlockSnapshot>,
}

#[derive(Debug, Default)]
struct TrackerState {
    records: HashMap<IpAddr, AttemptRecord>,
    blocked: BTreeSet<IpAddr>,
    generation: u64,
}

impl TrackerState {
    fn snapshot(&self) -> BlockSnapshot {
        BlockSnapshot {
            generation: self.generation,
            ips: self.blocked.iter().copied().collect(),
        }
    }

    fn bump(&mut self) -> BlockSnapshot {
        self.generation += 1;
        self.snapshot()
    }
}

/// Shared attempt-tracking state for all decoy listeners.
#[derive(Debug)]
pub struct AttemptTracker {
    threshold: u32,
    timeout: TimeDelta,
    state: Mutex<TrackerState>,
}

impl AttemptTracker {
    /// Create an empty tracker. A threshold of 0 is treated as 1.
    pub fn new(threshold: u32, timeout: TimeDelta) -> Self {
        Self {
            threshold: threshold.max(1),
            timeout,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub const fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record one connection from `ip` at `now`.
    pub fn record_attempt(&self, ip: IpAddr, now: DateTime<Utc>) -> RecordOutcome {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let already_blocked = state.blocked.contains(&ip);

        let count = state
            .records
            .entry(ip)
            .and_modify(|record| {
                record.count = record.count.saturating_add(1);
                record.last_seen = now;
            })
            .or_insert(AttemptRecord {
                count: 1,
                last_seen: now,
            })
            .count;

        if already_blocked {
            return RecordOutcome {
                event: AttemptEvent::AlreadyBlocked,
                count,
                publish: None,
            };
        }

        if count >= self.threshold {
            state.blocked.insert(ip);
            let snapshot = state.bump();
            return RecordOutcome {
                event: AttemptEvent::NewBlock,
                count,
                publish: Some(snapshot),
            };
        }

        RecordOutcome {
            event: if count == 1 {
                AttemptEvent::New
            } else {
                AttemptEvent::Counted
            },
            count,
            publish: None,
        }
    }

    /// Remove every record idle for at least the timeout, unblocking as needed.
    ///
    /// Candidates are collected first and removed afterwards, all under one
    /// lock acquisition: an attempt that refreshes `last_seen` lands either
    /// before the sweep (and is not expired) or after it (and starts a new
    /// record).
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> SweepOutcome {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut expired: Vec<IpAddr> = state
            .records
            .iter()
            .filter(|(_, record)| now.signed_duration_since(record.last_seen) >= self.timeout)
            .map(|(ip, _)| *ip)
            .collect();

        if expired.is_empty() {
            return SweepOutcome::default();
        }
        expired.sort_unstable();

        let mut unblocked = Vec::new();
        for ip in &expired {
            state.records.remove(ip);
            if state.blocked.remove(ip) {
                unblocked.push(*ip);
            }
        }

        let publish = if unblocked.is_empty() {
            None
        } else {
            Some(state.bump())
        };

        SweepOutcome {
            expired,
            unblocked,
            publish,
        }
    }

    /// Seed previously published blocks as `Blocked` with count = threshold.
    ///
    /// Does not bump the generation: the zone already holds these entries.
    /// Returns how many addresses were newly tracked.
    pub fn rehydrate<I>(&self, ips: I, now: DateTime<Utc>) -> usize
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut added = 0;
        for ip in ips {
            if state.records.contains_key(&ip) {
                continue;
            }
            state.records.insert(
                ip,
                AttemptRecord {
                    count: self.threshold,
                    last_seen: now,
                },
            );
            state.blocked.insert(ip);
            added += 1;
        }
        added
    }

    /// Current state of one IP.
    pub fn state(&self, ip: IpAddr) -> AttemptState {
        let state = self.state.lock();
        match state.records.get(&ip) {
            None => AttemptState::Unseen,
            Some(record) if state.blocked.contains(&ip) => AttemptState::Blocked {
                count: record.count,
                last_seen: record.last_seen,
            },
            Some(record) => AttemptState::Observed {
                count: record.count,
                last_seen: record.last_seen,
            },
        }
    }

    /// Blocked addresses in ascending order.
    pub fn blocked(&self) -> Vec<IpAddr> {
        self.state.lock().blocked.iter().copied().collect()
    }

    /// Current block set with its generation.
    pub fn block_snapshot(&self) -> BlockSnapshot {
        self.state.lock().snapshot()
    }

    /// Number of tracked IPs (observed + blocked).
    pub fn tracked(&self) -> usize {
        self.state.lock().records.len()
    }
}
