//! Detection of request patterns that defeat batching.
//!
//! A loader only batches requests that are registered before its dispatch
//! loop runs. Code that awaits each lookup before issuing the next one
//! still works, but every round then carries a single key: the N+1 pattern
//! again, one level up.
//!
//! ```ignore
//! // One round per item:
//! for key in keys {
//!     let item = loader.find::<Item>(key).await;
//! }
//!
//! // One round in total:
//! let items = loader.find_many::<Item>(keys).await;
//! ```

use std::collections::HashMap;

/// Counts single-key batch rounds per index.
#[derive(Debug)]
pub struct SingleKeyRoundTracker {
    counts: HashMap<&'static str, usize>,
    threshold: Option<usize>,
}

impl SingleKeyRoundTracker {
    /// Create a tracker warning at `threshold` rounds (`None` = never).
    pub fn new(threshold: Option<usize>) -> Self {
        Self {
            counts: HashMap::new(),
            threshold,
        }
    }

    pub fn threshold(&self) -> Option<usize> {
        self.threshold
    }

    /// Record a completed round. Returns true when it crossed the threshold.
    pub fn record_round(&mut self, index: &'static str, keys: usize) -> bool {
        if keys != 1 {
            return false;
        }
        let count = self.counts.entry(index).or_insert(0);
        *count += 1;

        if self.threshold == Some(*count) {
            tracing::warn!(
                target: "dbloader::n1",
                index,
                rounds = *count,
                "Repeated single-key batch rounds. Issue requests before awaiting them \
                 (find_many, join) so they share one round."
            );
            return true;
        }
        false
    }

    /// Single-key rounds recorded for `index`.
    pub fn count_for(&self, index: &str) -> usize {
        self.counts.get(index).copied().unwrap_or(0)
    }

    /// Indices that reached the threshold.
    pub fn flagged(&self) -> Vec<&'static str> {
        let Some(threshold) = self.threshold else {
            return Vec::new();
        };
        let mut flagged: Vec<_> = self
            .counts
            .iter()
            .filter(|(_, count)| **count >= threshold)
            .map(|(index, _)| *index)
            .collect();
        flagged.sort_unstable();
        flagged
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warns_exactly_once_at_threshold() {
        let mut tracker = SingleKeyRoundTracker::new(Some(3));
        assert!(!tracker.record_round("items", 1));
        assert!(!tracker.record_round("items", 1));
        assert!(tracker.record_round("items", 1));
        assert!(!tracker.record_round("items", 1));
        assert_eq!(tracker.count_for("items"), 4);
        assert_eq!(tracker.flagged(), vec!["items"]);
    }

    #[test]
    fn test_multi_key_rounds_ignored() {
        let mut tracker = SingleKeyRoundTracker::new(Some(1));
        assert!(!tracker.record_round("items", 5));
        assert_eq!(tracker.count_for("items"), 0);
        assert!(tracker.flagged().is_empty());
    }

    #[test]
    fn test_disabled_tracker_counts_silently() {
        let mut tracker = SingleKeyRoundTracker::new(None);
        for _ in 0..20 {
            assert!(!tracker.record_round("companies", 1));
        }
        assert_eq!(tracker.count_for("companies"), 20);
        assert!(tracker.flagged().is_empty());

        tracker.reset();
        assert_eq!(tracker.count_for("companies"), 0);
    }
}
