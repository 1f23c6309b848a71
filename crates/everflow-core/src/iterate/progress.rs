//! Attempt history for the iteration loop.

use everflow_types::task::IterationProgress;

/// Records one entry per attempt and derives the observability numbers.
/// Control flow never consults it; it feeds events and the final report.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    entries: Vec<IterationProgress>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: IterationProgress) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[IterationProgress] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fraction of recorded attempts that succeeded, 0.0 when empty.
    pub fn success_rate(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        let successes = self.entries.iter().filter(|e| e.success).count();
        successes as f64 / self.entries.len() as f64
    }

    /// Mean attempt duration so far, in milliseconds.
    pub fn mean_duration_ms(&self) -> u64 {
        if self.entries.is_empty() {
            return 0;
        }
        let total: u64 = self.entries.iter().map(|e| e.duration_ms).sum();
        total / self.entries.len() as u64
    }

    /// Projected wall-clock time for `remaining` further attempts.
    pub fn eta_ms(&self, remaining: u32) -> u64 {
        self.mean_duration_ms() * remaining as u64
    }

    pub fn into_entries(self) -> Vec<IterationProgress> {
        self.entries
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
