//! Per-generation statistics history and run-segment aggregates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fitness summary of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    /// Extreme fitness under the configured direction.
    pub best: f32,
    /// Opposite extreme.
    pub worst: f32,
    /// Population mean.
    pub avg: f32,
}

/// Full statistics history of a run, keyed by generation index.
///
/// `avg_time_per_generation` is filled in once a run segment ends (by
/// termination or stop); it stays `None` while paused mid-run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatisticsReport {
    /// Generation index → fitness summary. Strictly increasing keys.
    pub generations: BTreeMap<u64, GenerationStats>,
    /// Average wall-clock seconds per generation over the whole history.
    pub avg_time_per_generation: Option<f64>,
}

impl StatisticsReport {
    /// Record one generation's summary.
    pub fn record(&mut self, generation: u64, stats: GenerationStats) {
        self.generations.insert(generation, stats);
    }

    /// Most recently recorded generation summary, if any.
    pub fn latest(&self) -> Option<(u64, GenerationStats)> {
        self.generations.iter().next_back().map(|(g, s)| (*g, *s))
    }

    /// Number of generations recorded.
    pub fn len(&self) -> usize {
        self.generations.len()
    }

    /// True when no generation has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_returns_highest_generation() {
        let mut report = StatisticsReport::default();
        assert!(report.latest().is_none());
        report.record(
            0,
            GenerationStats {
                best: 1.0,
                worst: 0.0,
                avg: 0.5,
            },
        );
        report.record(
            3,
            GenerationStats {
                best: 2.0,
                worst: 0.5,
                avg: 1.0,
            },
        );
        let (generation, stats) = report.latest().unwrap();
        assert_eq!(generation, 3);
        assert_eq!(stats.best, 2.0);
        assert_eq!(report.len(), 2);
    }
}
