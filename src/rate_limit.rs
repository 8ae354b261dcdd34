//! Global limiter for new task-progress connection attempts.
//!
//! Attempts are recorded in wall-clock minute buckets. Buckets older than the
//! previous minute are pruned on every check, and admission counts every
//! recorded attempt inside the trailing 60 seconds, so no sliding one-minute
//! window ever holds more than `max_per_minute` admissions.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

const WINDOW_SECS: i64 = 60;

pub struct AttemptLedger {
    max_per_minute: usize,
    buckets: BTreeMap<i64, Vec<DateTime<Utc>>>,
}

impl AttemptLedger {
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            max_per_minute,
            buckets: BTreeMap::new(),
        }
    }

    /// Admit and record an attempt now, or reject without recording.
    pub fn try_admit(&mut self) -> bool {
        self.try_admit_at(Utc::now())
    }

    pub fn try_admit_at(&mut self, now: DateTime<Utc>) -> bool {
        if !self.has_room_at(now) {
            return false;
        }
        self.record_at(now);
        true
    }

    /// Prune stale buckets and report whether an attempt at `now` would be
    /// admitted. Records nothing.
    pub fn has_room_at(&mut self, now: DateTime<Utc>) -> bool {
        self.prune(minute_bucket(now));
        self.count_within_window(now) < self.max_per_minute
    }

    pub fn record_at(&mut self, now: DateTime<Utc>) {
        self.buckets.entry(minute_bucket(now)).or_default().push(now);
    }

    /// Attempts recorded within the trailing window ending at `now`.
    pub fn count_within_window(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(WINDOW_SECS);
        self.buckets
            .values()
            .flatten()
            .filter(|&&ts| ts > cutoff && ts <= now)
            .count()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn prune(&mut self, current: i64) {
        self.buckets.retain(|&minute, _| minute >= current - 1);
    }
}

fn minute_bucket(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(WINDOW_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn eleventh_attempt_in_a_minute_is_rejected() {
        let mut ledger = AttemptLedger::new(10);
        for i in 0..10 {
            assert!(ledger.try_admit_at(at(i)), "attempt {i}");
        }
        assert!(!ledger.try_admit_at(at(10)));
        // Rejection leaves no trace.
        assert_eq!(ledger.count_within_window(at(10)), 10);
    }

    #[test]
    fn window_slides_across_minute_boundary() {
        let mut ledger = AttemptLedger::new(10);
        // 1_700_000_000 is 20s into its minute; fill 10 slots late in it.
        for i in 30..40 {
            assert!(ledger.try_admit_at(at(i)));
        }
        // New minute bucket, but still inside the trailing 60s.
        assert!(!ledger.try_admit_at(at(60)));
        // Once the first attempt ages out, one slot frees up.
        assert!(ledger.try_admit_at(at(90)));
        assert!(!ledger.try_admit_at(at(90)));
    }

    #[test]
    fn checking_room_records_nothing() {
        let mut ledger = AttemptLedger::new(1);
        assert!(ledger.has_room_at(at(0)));
        assert!(ledger.has_room_at(at(0)));
        ledger.record_at(at(0));
        assert!(!ledger.has_room_at(at(1)));
    }

    #[test]
    fn stale_buckets_are_pruned() {
        let mut ledger = AttemptLedger::new(10);
        ledger.try_admit_at(at(0));
        ledger.try_admit_at(at(60));
        ledger.try_admit_at(at(300));
        assert_eq!(ledger.bucket_count(), 1);
    }

    #[test]
    fn no_sliding_window_exceeds_cap() {
        let mut ledger = AttemptLedger::new(10);
        let mut admitted = Vec::new();
        for s in 0..600 {
            // Three tries per second.
            for _ in 0..3 {
                if ledger.try_admit_at(at(s)) {
                    admitted.push(s);
                }
            }
        }
        for (i, &start) in admitted.iter().enumerate() {
            let in_window = admitted[i..].iter().take_while(|&&t| t < start + 60).count();
            assert!(in_window <= 10, "window at {start} holds {in_window}");
        }
    }
}
