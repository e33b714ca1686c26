//! # Stage: Run Configuration
//!
//! ## Responsibility
//! Define the parameters of an evolutionary run (population sizing,
//! termination, optimization direction, elitism, diversity guard) and
//! validate them at construction time so that misconfiguration surfaces
//! before any worker allocates device memory.
//!
//! ## Guarantees
//! - Validated: `GaConfig::validate` rejects every out-of-range field
//! - Serializable: the whole configuration travels in the `prepare` command
//! - Explicit: optimization direction is a two-variant enum, never a string
//!
//! ## NOT Responsible For
//! - Per-run mutation/crossover overrides (see: `engine`)
//! - Wire encoding (see: `protocol`)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by configuration validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A probability-like field is outside the exclusive (0, 1) range.
    #[error("{name} must be in (0, 1) exclusive, got {value}")]
    RateOutOfRange {
        /// Field name.
        name: &'static str,
        /// Offending value.
        value: f64,
    },

    /// The population must hold at least two individuals.
    #[error("population must be >= 2, got {0}")]
    PopulationTooSmall(usize),

    /// Genomes must have at least one gene.
    #[error("genome length must be >= 1")]
    EmptyGenome,

    /// A termination budget of zero would never run a generation.
    #[error("termination budget must be non-zero")]
    EmptyBudget,

    /// Elitism parameters must both be non-zero and K must fit the population.
    #[error("invalid elitism config: top={top}, every={every}")]
    InvalidElitism {
        /// Number of elites to keep.
        top: usize,
        /// Promotion interval in rounds.
        every: u32,
    },

    /// The diversity-guard repopulation ratio must be in (0, 1) exclusive.
    #[error("diversity guard ratio must be in (0, 1) exclusive, got {0}")]
    RatioOutOfRange(f64),
}

/// Whether a larger or a smaller fitness value is considered better.
///
/// Bound at construction; comparison logic lives here so no caller ever
/// branches on a string key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationDirection {
    /// Larger fitness wins.
    Maximize,
    /// Smaller fitness wins.
    Minimize,
}

impl OptimizationDirection {
    /// True if `a` is strictly better than `b` under this direction.
    pub fn is_better(self, a: f32, b: f32) -> bool {
        match self {
            Self::Maximize => a > b,
            Self::Minimize => a < b,
        }
    }

    /// Total ordering that sorts best-first under this direction.
    ///
    /// NaN sorts last regardless of direction.
    pub fn best_first(self, a: f32, b: f32) -> Ordering {
        match self {
            Self::Maximize => b.total_cmp(&a),
            Self::Minimize => a.total_cmp(&b),
        }
    }
}

/// When a run segment ends, checked once per generation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Stop once the generation index reaches this count.
    Count(u64),
    /// Stop once cumulative run time exceeds this budget.
    ///
    /// The budget is only inspected at generation boundaries, so an
    /// overlong generation can overrun it; there is no preemptive timeout.
    Time(Duration),
}

/// Cross-worker elitism parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElitismConfig {
    /// Number of best individuals tracked and migrated (top-K).
    pub top: usize,
    /// Promote the control node's accumulator after this many
    /// elite-bearing generation results (every-N rounds).
    pub every: u32,
}

/// Which fitness spread the diversity-collapse guard inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiversityMode {
    /// Compare |best − worst|.
    BestWorst,
    /// Compare |best − avg|.
    BestAvg,
}

/// Diversity-collapse guard: escape premature convergence by partially
/// repopulating instead of running crossover/mutation for one step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiversityGuard {
    /// Spread to inspect.
    pub mode: DiversityMode,
    /// Collapse threshold; a spread below this triggers the guard.
    pub threshold: f32,
    /// Fraction of the population to repopulate: `floor(population · ratio) + 1`
    /// individuals are regenerated.
    pub ratio: f64,
}

impl DiversityGuard {
    /// Number of individuals the guard regenerates for a given population.
    pub fn repopulate_count(&self, population: usize) -> usize {
        (population as f64 * self.ratio) as usize + 1
    }

    /// Whether the observed spread has collapsed below the threshold.
    pub fn tripped(&self, best: f32, worst: f32, avg: f32) -> bool {
        let spread = match self.mode {
            DiversityMode::BestWorst => (best - worst).abs(),
            DiversityMode::BestAvg => (best - avg).abs(),
        };
        spread < self.threshold
    }
}

/// Full configuration of an evolutionary run.
///
/// Travels to every worker inside the `prepare` command; the same value
/// configures the control node's elite aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaConfig {
    /// Number of individuals per worker population.
    pub population: usize,
    /// Genes per genome, in kernel encoding units.
    pub genome_len: usize,
    /// Whether fitness is maximized or minimized.
    pub direction: OptimizationDirection,
    /// When a run segment ends.
    pub termination: Termination,
    /// Default per-gene mutation probability, overridable per `run`.
    pub mutation_rate: f64,
    /// Default crossover probability, overridable per `run`.
    pub crossover_rate: f64,
    /// Cross-worker elitism, off when `None`.
    #[serde(default)]
    pub elitism: Option<ElitismConfig>,
    /// Diversity-collapse guard, off when `None`.
    #[serde(default)]
    pub diversity: Option<DiversityGuard>,
    /// Seed for the per-individual RNG buffers. `None` seeds from entropy;
    /// setting it makes a run reproducible end to end.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl GaConfig {
    /// Check every field, failing fast on the first violation.
    ///
    /// # Errors
    ///
    /// Returns the corresponding [`ConfigError`] variant for the first
    /// out-of-range field encountered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population < 2 {
            return Err(ConfigError::PopulationTooSmall(self.population));
        }
        if self.genome_len == 0 {
            return Err(ConfigError::EmptyGenome);
        }
        validate_rate("mutation_rate", self.mutation_rate)?;
        validate_rate("crossover_rate", self.crossover_rate)?;
        match self.termination {
            Termination::Count(0) => return Err(ConfigError::EmptyBudget),
            Termination::Time(t) if t.is_zero() => return Err(ConfigError::EmptyBudget),
            _ => {}
        }
        if let Some(e) = self.elitism {
            if e.top == 0 || e.every == 0 || e.top > self.population {
                return Err(ConfigError::InvalidElitism {
                    top: e.top,
                    every: e.every,
                });
            }
        }
        if let Some(d) = self.diversity {
            if !(d.ratio > 0.0 && d.ratio < 1.0) {
                return Err(ConfigError::RatioOutOfRange(d.ratio));
            }
        }
        Ok(())
    }
}

/// Validate a probability in (0, 1) exclusive.
pub(crate) fn validate_rate(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::RateOutOfRange { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> GaConfig {
        GaConfig {
            population: 50,
            genome_len: 8,
            direction: OptimizationDirection::Maximize,
            termination: Termination::Count(10),
            mutation_rate: 0.1,
            crossover_rate: 0.8,
            elitism: None,
            diversity: None,
            seed: Some(42),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rate_bounds_are_exclusive() {
        for bad in [0.0, 1.0, -0.1, 1.5] {
            let mut cfg = base();
            cfg.mutation_rate = bad;
            assert!(cfg.validate().is_err(), "mutation_rate {bad} accepted");

            let mut cfg = base();
            cfg.crossover_rate = bad;
            assert!(cfg.validate().is_err(), "crossover_rate {bad} accepted");
        }
    }

    #[test]
    fn rejects_tiny_population_and_empty_genome() {
        let mut cfg = base();
        cfg.population = 1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::PopulationTooSmall(1))
        ));

        let mut cfg = base();
        cfg.genome_len = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyGenome)));
    }

    #[test]
    fn rejects_zero_budget() {
        let mut cfg = base();
        cfg.termination = Termination::Count(0);
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyBudget)));

        cfg.termination = Termination::Time(Duration::ZERO);
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyBudget)));
    }

    #[test]
    fn rejects_bad_elitism() {
        let mut cfg = base();
        cfg.elitism = Some(ElitismConfig { top: 0, every: 2 });
        assert!(cfg.validate().is_err());

        cfg.elitism = Some(ElitismConfig { top: 3, every: 0 });
        assert!(cfg.validate().is_err());

        cfg.elitism = Some(ElitismConfig {
            top: 51,
            every: 2,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn direction_comparisons() {
        assert!(OptimizationDirection::Maximize.is_better(2.0, 1.0));
        assert!(OptimizationDirection::Minimize.is_better(1.0, 2.0));

        let mut v = vec![3.0f32, 1.0, 2.0];
        v.sort_by(|a, b| OptimizationDirection::Maximize.best_first(*a, *b));
        assert_eq!(v, vec![3.0, 2.0, 1.0]);
        v.sort_by(|a, b| OptimizationDirection::Minimize.best_first(*a, *b));
        assert_eq!(v, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn guard_repopulate_count_uses_floor_plus_one() {
        let g = DiversityGuard {
            mode: DiversityMode::BestWorst,
            threshold: 0.001,
            ratio: 0.9,
        };
        assert_eq!(g.repopulate_count(10), 10);
        assert_eq!(g.repopulate_count(50), 46);
    }

    #[test]
    fn guard_trip_modes() {
        let g = DiversityGuard {
            mode: DiversityMode::BestWorst,
            threshold: 0.001,
            ratio: 0.9,
        };
        assert!(g.tripped(10.0, 10.00005, 10.0));
        assert!(!g.tripped(10.0, 9.0, 9.5));

        let g = DiversityGuard {
            mode: DiversityMode::BestAvg,
            threshold: 0.5,
            ratio: 0.9,
        };
        assert!(g.tripped(10.0, 0.0, 9.9));
        assert!(!g.tripped(10.0, 0.0, 5.0));
    }
}
