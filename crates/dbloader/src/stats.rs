//! Loader counters.

use serde::Serialize;

/// Running totals for one loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    /// Explicit operations (writes, ad-hoc queries) executed
    pub explicit_ops: usize,
    /// Explicit reads skipped because nobody was waiting any more
    pub skipped_ops: usize,
    /// Batch rounds executed
    pub batch_rounds: usize,
    /// Keys carried by those rounds
    pub keys_requested: usize,
    /// Rows (or loader values) those rounds returned
    pub rows_loaded: usize,
    /// Rounds whose statement or decoding failed
    pub failed_rounds: usize,
    /// Rounds discarded because their index was flushed mid-flight
    pub stale_rounds: usize,
    /// Rounds that carried exactly one key
    pub single_key_rounds: usize,
    /// Flushes performed (targeted or full)
    pub flushes: usize,
}

impl LoaderStats {
    /// Average keys per batch round.
    pub fn average_batch_size(&self) -> f64 {
        if self.batch_rounds == 0 {
            0.0
        } else {
            self.keys_requested as f64 / self.batch_rounds as f64
        }
    }
}
