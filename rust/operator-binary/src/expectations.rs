//! Tracks asynchronous child-object creations per pool.
//!
//! Some actuators create ancillary objects (name leases) whose observation
//! must be awaited before the next reconcile may proceed, otherwise the
//! cached view would re-create them. A pool with unsatisfied expectations
//! returns from reconcile immediately; the watch on the child type
//! decrements the counter once the created objects land.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

/// Failsafe: a stuck expectation stops blocking after this long.
pub const EXPECTATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Expectation {
    pending: i64,
    recorded_at: Instant,
}

#[derive(Debug)]
pub struct Expectations {
    timeout: Duration,
    entries: Mutex<HashMap<String, Expectation>>,
}

impl Default for Expectations {
    fn default() -> Self {
        Self::with_timeout(EXPECTATION_TIMEOUT)
    }
}

impl Expectations {
    pub fn with_timeout(timeout: Duration) -> Self {
        Expectations {
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records `count` pending creations for the pool key, replacing any
    /// previous record.
    pub fn expect_creations(&self, key: &str, count: i64) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key.to_owned(),
            Expectation {
                pending: count,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Called from the child watch when a created object is observed.
    pub fn creation_observed(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(expectation) = entries.get_mut(key) {
            expectation.pending -= 1;
        }
    }

    /// True when the pool has no pending creations left to wait for.
    pub fn satisfied(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            None => true,
            Some(expectation) if expectation.pending <= 0 => true,
            Some(expectation) if expectation.recorded_at.elapsed() > self.timeout => {
                tracing::warn!(
                    pool = key,
                    pending = expectation.pending,
                    "expectations expired without being observed"
                );
                true
            }
            Some(_) => false,
        }
    }

    /// Drops all state for a pool, e.g. when it disappears.
    pub fn forget(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_satisfied() {
        let expectations = Expectations::default();
        assert!(expectations.satisfied("hive/prod-worker"));
    }

    #[test]
    fn pending_creations_block_until_observed() {
        let expectations = Expectations::default();
        expectations.expect_creations("hive/prod-worker", 2);
        assert!(!expectations.satisfied("hive/prod-worker"));

        expectations.creation_observed("hive/prod-worker");
        assert!(!expectations.satisfied("hive/prod-worker"));

        expectations.creation_observed("hive/prod-worker");
        assert!(expectations.satisfied("hive/prod-worker"));
    }

    #[test]
    fn expired_expectations_stop_blocking() {
        let expectations = Expectations::with_timeout(Duration::ZERO);
        expectations.expect_creations("hive/prod-worker", 1);
        assert!(expectations.satisfied("hive/prod-worker"));
    }

    #[test]
    fn forgetting_a_key_clears_pending_state() {
        let expectations = Expectations::default();
        expectations.expect_creations("hive/prod-worker", 1);
        expectations.forget("hive/prod-worker");
        assert!(expectations.satisfied("hive/prod-worker"));
    }

    #[test]
    fn keys_are_independent() {
        let expectations = Expectations::default();
        expectations.expect_creations("hive/prod-worker", 1);
        assert!(expectations.satisfied("hive/prod-infra"));
        assert!(!expectations.satisfied("hive/prod-worker"));
    }
}
