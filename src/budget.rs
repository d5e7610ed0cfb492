//! Per-credential token accounting over a rolling window.
//!
//! The tracker is the sole authority consulted before admitting a call. It
//! never blocks: callers decide whether to wait when the budget runs low.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A single usage sample: tokens consumed at a point in time.
#[derive(Debug, Clone, Copy)]
struct UsageSample {
    at: Instant,
    amount: u64,
}

/// Rolling-window token accounting, keyed by credential owner.
///
/// Samples older than the window are pruned on every read, so the window is
/// accurate at decision time. Constructed once per engine and shared by
/// `Arc`; owners never contend beyond the map lock because each read/write
/// is a short synchronous section.
pub struct TokenBudgetTracker {
    budget_per_window: u64,
    window: Duration,
    samples: Mutex<HashMap<String, Vec<UsageSample>>>,
}

impl TokenBudgetTracker {
    pub fn new(budget_per_window: u64, window: Duration) -> Self {
        Self {
            budget_per_window,
            window,
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn budget_per_window(&self) -> u64 {
        self.budget_per_window
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records `amount` tokens consumed by `owner` now.
    pub fn record(&self, owner: &str, amount: u64) {
        self.record_at(owner, amount, Instant::now());
    }

    /// Records a sample at an explicit instant. The queue uses this to charge
    /// a whole admission decision against a single sampled time.
    pub fn record_at(&self, owner: &str, amount: u64, at: Instant) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples
            .entry(owner.to_string())
            .or_default()
            .push(UsageSample { at, amount });
    }

    /// Remaining budget for `owner`: configured budget minus everything
    /// consumed within the trailing window.
    pub fn remaining(&self, owner: &str) -> u64 {
        self.remaining_at(owner, Instant::now())
    }

    pub fn remaining_at(&self, owner: &str, now: Instant) -> u64 {
        let used = self.used_in_window_at(owner, now);
        self.budget_per_window.saturating_sub(used)
    }

    /// Tokens consumed by `owner` within the trailing window. Stale samples
    /// are dropped as a side effect.
    pub fn used_in_window(&self, owner: &str) -> u64 {
        self.used_in_window_at(owner, Instant::now())
    }

    pub fn used_in_window_at(&self, owner: &str, now: Instant) -> u64 {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let Some(window) = samples.get_mut(owner) else {
            return 0;
        };
        let cutoff = now.checked_sub(self.window);
        match cutoff {
            Some(cutoff) => window.retain(|s| s.at > cutoff),
            // Process younger than the window: nothing can be stale.
            None => {}
        }
        window.iter().map(|s| s.amount).sum()
    }

    /// True when `owner` has at least `estimate` tokens of headroom.
    pub fn has_budget_for(&self, owner: &str, estimate: u64) -> bool {
        self.remaining(owner) >= estimate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> TokenBudgetTracker {
        TokenBudgetTracker::new(10_000, Duration::from_secs(60))
    }

    #[test]
    fn fresh_owner_has_full_budget() {
        let t = tracker();
        assert_eq!(t.remaining("alice"), 10_000);
        assert_eq!(t.used_in_window("alice"), 0);
    }

    #[test]
    fn recording_reduces_remaining() {
        let t = tracker();
        t.record("alice", 2_500);
        t.record("alice", 1_500);
        assert_eq!(t.remaining("alice"), 6_000);
        assert_eq!(t.used_in_window("alice"), 4_000);
    }

    #[test]
    fn owners_are_isolated() {
        let t = tracker();
        t.record("alice", 9_000);
        assert_eq!(t.remaining("bob"), 10_000);
    }

    #[test]
    fn samples_outside_window_do_not_count() {
        let t = tracker();
        let start = Instant::now();
        t.record_at("alice", 5_000, start);
        // Sampled at t, queried at t+61s: contributes zero.
        let later = start + Duration::from_secs(61);
        assert_eq!(t.used_in_window_at("alice", later), 0);
        assert_eq!(t.remaining_at("alice", later), 10_000);
    }

    #[test]
    fn sample_on_window_edge_still_counts() {
        let t = tracker();
        let start = Instant::now();
        t.record_at("alice", 5_000, start);
        let edge = start + Duration::from_secs(59);
        assert_eq!(t.used_in_window_at("alice", edge), 5_000);
    }

    #[test]
    fn stale_samples_are_pruned_on_read() {
        let t = tracker();
        let start = Instant::now();
        t.record_at("alice", 3_000, start);
        let later = start + Duration::from_secs(120);
        t.record_at("alice", 1_000, later);
        assert_eq!(t.used_in_window_at("alice", later), 1_000);

        // The stale sample was dropped, not just skipped.
        let samples = t.samples.lock().unwrap();
        assert_eq!(samples.get("alice").unwrap().len(), 1);
    }

    #[test]
    fn overspend_saturates_to_zero() {
        let t = tracker();
        t.record("alice", 25_000);
        assert_eq!(t.remaining("alice"), 0);
        assert!(!t.has_budget_for("alice", 1));
    }
}
