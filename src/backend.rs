//! # Stage: Compute Backend Seam
//!
//! ## Responsibility
//! Define the trait boundary between the orchestration layer and the
//! numeric kernels that actually perform populate/crossover/mutation/
//! fitness evaluation on an accelerator, plus the host-visible population
//! buffers those kernels mirror. Ship a deterministic in-process stub for
//! tests and smoke runs.
//!
//! ## Guarantees
//! - Opaque: the engine depends only on [`ComputeBackend`], never on a
//!   concrete representation or device API
//! - Host-visible: [`PopulationBuffers`] is the flush target for pause,
//!   stop and checkpointing
//! - Deterministic stub: every random draw comes from the per-individual
//!   seed buffer, so a checkpoint fully determines future evolution
//!
//! ## NOT Responsible For
//! - Scheduling or lifecycle (see: `engine`)
//! - Genome semantics: genes are opaque `i32` kernel values here

use crate::config::OptimizationDirection;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by a compute backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Device/context creation or kernel compilation failed. Fatal to the
    /// owning worker.
    #[error("backend prepare failed: {0}")]
    Prepare(String),

    /// A single step failed but buffers remain valid; the generation loop
    /// logs this and continues.
    #[error("backend step failed: {0}")]
    Step(String),

    /// Required buffers are corrupted; the worker must self-terminate.
    #[error("backend buffers corrupted: {0}")]
    Corrupted(String),

    /// Auxiliary checkpoint state could not be encoded or decoded.
    #[error("backend aux state error: {0}")]
    Aux(String),
}

/// Host-visible population state shared between the generation step and
/// the elite splice, and captured verbatim by checkpoints.
///
/// Genomes are stored flat: individual `i` occupies
/// `genomes[i * genome_len .. (i + 1) * genome_len]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationBuffers {
    /// Number of individuals.
    pub population: usize,
    /// Genes per genome.
    pub genome_len: usize,
    /// Flat genome buffer, kernel encoding.
    pub genomes: Vec<i32>,
    /// Per-individual fitness, written by `evaluate_fitness`.
    pub fitnesses: Vec<f32>,
    /// Per-individual RNG state. Device kernels have no RNG of their own,
    /// so the host owns and checkpoints these seeds.
    pub rng_seeds: Vec<u32>,
}

impl PopulationBuffers {
    /// Allocate zeroed buffers with seeded per-individual RNG state.
    ///
    /// `seed` pins the seed buffer for reproducible runs; `None` draws
    /// from entropy.
    pub fn allocate(population: usize, genome_len: usize, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        // xorshift sticks at zero, so never hand out a zero seed.
        let rng_seeds = (0..population)
            .map(|_| rng.gen_range(1..=u32::MAX))
            .collect();
        Self {
            population,
            genome_len,
            genomes: vec![0; population * genome_len],
            fitnesses: vec![0.0; population],
            rng_seeds,
        }
    }

    /// Genome slice of individual `idx`.
    pub fn genome(&self, idx: usize) -> &[i32] {
        &self.genomes[idx * self.genome_len..(idx + 1) * self.genome_len]
    }

    /// Mutable genome slice of individual `idx`.
    pub fn genome_mut(&mut self, idx: usize) -> &mut [i32] {
        let len = self.genome_len;
        &mut self.genomes[idx * len..(idx + 1) * len]
    }

    /// Index of the extreme individual under `direction`, with its fitness.
    pub fn best_index(&self, direction: OptimizationDirection) -> (usize, f32) {
        let mut best = 0usize;
        for i in 1..self.population {
            if direction.is_better(self.fitnesses[i], self.fitnesses[best]) {
                best = i;
            }
        }
        (best, self.fitnesses[best])
    }

    /// Indices of the `k` worst individuals under `direction`, worst first.
    pub fn worst_indices(&self, k: usize, direction: OptimizationDirection) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.population).collect();
        idx.sort_by(|a, b| direction.best_first(self.fitnesses[*a], self.fitnesses[*b]));
        idx.reverse();
        idx.truncate(k);
        idx
    }

    /// Indices of the `k` best individuals under `direction`, best first.
    pub fn best_indices(&self, k: usize, direction: OptimizationDirection) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.population).collect();
        idx.sort_by(|a, b| direction.best_first(self.fitnesses[*a], self.fitnesses[*b]));
        idx.truncate(k);
        idx
    }
}

/// A packed elite: fitness plus encoded genome, as it travels between
/// engine and control node.
pub type PackedElite = (f32, Vec<i32>);

/// The accelerator seam. One instance per worker, owned by the engine.
///
/// All operations are synchronous: they are invoked from the dedicated
/// evolution thread, never from async context. Implementations that keep
/// device-side mirrors must write results back into the host buffers
/// in `flush` (called at pause/stop boundaries and before checkpoints).
pub trait ComputeBackend: Send {
    /// Create the device context, compile kernels, size device buffers.
    ///
    /// # Errors
    ///
    /// [`BackendError::Prepare`] is fatal to the worker.
    fn prepare(&mut self, buffers: &mut PopulationBuffers) -> Result<(), BackendError>;

    /// Fill the whole population with fresh individuals (generation 0).
    fn populate(&mut self, buffers: &mut PopulationBuffers) -> Result<(), BackendError>;

    /// Regenerate only the first `count` individuals; used by the
    /// diversity-collapse guard in place of crossover/mutation.
    fn populate_partial(
        &mut self,
        buffers: &mut PopulationBuffers,
        count: usize,
    ) -> Result<(), BackendError>;

    /// One crossover pass at the given rate.
    fn crossover(&mut self, buffers: &mut PopulationBuffers, rate: f64)
        -> Result<(), BackendError>;

    /// One mutation pass at the given rate.
    fn mutate(&mut self, buffers: &mut PopulationBuffers, rate: f64) -> Result<(), BackendError>;

    /// Evaluate fitness for every individual into `buffers.fitnesses`.
    fn evaluate_fitness(&mut self, buffers: &mut PopulationBuffers) -> Result<(), BackendError>;

    /// Write any device-side state back to the host buffers. Called at
    /// pause/stop boundaries and before checkpoints. Default: no-op for
    /// host-resident backends.
    fn flush(&mut self, _buffers: &mut PopulationBuffers) -> Result<(), BackendError> {
        Ok(())
    }

    /// Representation-specific early termination (e.g. converged).
    /// Checked once per generation boundary.
    fn early_terminated(&self, _buffers: &PopulationBuffers) -> bool {
        false
    }

    /// Pack the current `k` best individuals for migration. Default host
    /// implementation reads the fitness and genome buffers directly.
    fn pack_elites(
        &mut self,
        buffers: &PopulationBuffers,
        k: usize,
        direction: OptimizationDirection,
    ) -> Result<Vec<PackedElite>, BackendError> {
        Ok(buffers
            .best_indices(k, direction)
            .into_iter()
            .map(|i| (buffers.fitnesses[i], buffers.genome(i).to_vec()))
            .collect())
    }

    /// Splice externally supplied elites over the current worst
    /// individuals. Default host implementation replaces genome and
    /// fitness in place, all or nothing: a genome of the wrong length
    /// fails the whole batch before any buffer is touched.
    fn splice_elites(
        &mut self,
        buffers: &mut PopulationBuffers,
        elites: &[PackedElite],
        direction: OptimizationDirection,
    ) -> Result<(), BackendError> {
        for (_, genome) in elites {
            if genome.len() != buffers.genome_len {
                return Err(BackendError::Step(format!(
                    "elite genome length {} does not match {}",
                    genome.len(),
                    buffers.genome_len
                )));
            }
        }
        let targets = buffers.worst_indices(elites.len(), direction);
        for (slot, (fitness, genome)) in targets.into_iter().zip(elites) {
            buffers.genome_mut(slot).copy_from_slice(genome);
            buffers.fitnesses[slot] = *fitness;
        }
        Ok(())
    }

    /// Serialize representation-specific auxiliary buffers for the
    /// checkpoint. Default: none.
    fn save_aux(&mut self) -> Result<Vec<u8>, BackendError> {
        Ok(Vec::new())
    }

    /// Restore representation-specific auxiliary buffers from a
    /// checkpoint. Default: none expected.
    fn restore_aux(&mut self, _aux: &[u8]) -> Result<(), BackendError> {
        Ok(())
    }
}

// ── Deterministic stub ────────────────────────────────────────────────────

/// Advance one xorshift32 step. Mirrors the per-work-item RNG the device
/// kernels use, so host and device evolution agree bit for bit.
fn xorshift32(state: &mut u32) -> u32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    x
}

/// Uniform draw in [0, 1) from the per-individual seed.
fn next_unit(state: &mut u32) -> f64 {
    xorshift32(state) as f64 / (u32::MAX as f64 + 1.0)
}

/// In-process deterministic backend for tests and smoke runs.
///
/// Genes are integers in `[0, gene_range)`; fitness is the genome mean.
/// Every random draw comes from `PopulationBuffers::rng_seeds`, updated in
/// place, so evolution after a restore is identical to an uninterrupted
/// run — the property the checkpoint tests rely on.
#[derive(Debug, Clone)]
pub struct StubBackend {
    /// Exclusive upper bound for gene values.
    pub gene_range: i32,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self { gene_range: 100 }
    }
}

impl StubBackend {
    /// Stub with the default gene range.
    pub fn new() -> Self {
        Self::default()
    }

    fn fill_individual(&self, buffers: &mut PopulationBuffers, idx: usize) {
        let mut seed = buffers.rng_seeds[idx];
        let range = self.gene_range;
        for gene in buffers.genome_mut(idx) {
            *gene = (xorshift32(&mut seed) % range as u32) as i32;
        }
        buffers.rng_seeds[idx] = seed;
    }
}

impl ComputeBackend for StubBackend {
    fn prepare(&mut self, _buffers: &mut PopulationBuffers) -> Result<(), BackendError> {
        Ok(())
    }

    fn populate(&mut self, buffers: &mut PopulationBuffers) -> Result<(), BackendError> {
        for idx in 0..buffers.population {
            self.fill_individual(buffers, idx);
        }
        Ok(())
    }

    fn populate_partial(
        &mut self,
        buffers: &mut PopulationBuffers,
        count: usize,
    ) -> Result<(), BackendError> {
        for idx in 0..count.min(buffers.population) {
            self.fill_individual(buffers, idx);
        }
        Ok(())
    }

    fn crossover(
        &mut self,
        buffers: &mut PopulationBuffers,
        rate: f64,
    ) -> Result<(), BackendError> {
        let parents = buffers.genomes.clone();
        let population = buffers.population;
        let len = buffers.genome_len;
        for idx in 0..population {
            let mut seed = buffers.rng_seeds[idx];
            if next_unit(&mut seed) < rate {
                let partner = (xorshift32(&mut seed) as usize) % population;
                let cut = (xorshift32(&mut seed) as usize) % len;
                let src = &parents[partner * len..(partner + 1) * len];
                buffers.genome_mut(idx)[cut..].copy_from_slice(&src[cut..]);
            }
            buffers.rng_seeds[idx] = seed;
        }
        Ok(())
    }

    fn mutate(&mut self, buffers: &mut PopulationBuffers, rate: f64) -> Result<(), BackendError> {
        let range = self.gene_range;
        for idx in 0..buffers.population {
            let mut seed = buffers.rng_seeds[idx];
            let genome = {
                let len = buffers.genome_len;
                &mut buffers.genomes[idx * len..(idx + 1) * len]
            };
            for gene in genome {
                if next_unit(&mut seed) < rate {
                    *gene = (xorshift32(&mut seed) % range as u32) as i32;
                }
            }
            buffers.rng_seeds[idx] = seed;
        }
        Ok(())
    }

    fn evaluate_fitness(&mut self, buffers: &mut PopulationBuffers) -> Result<(), BackendError> {
        for idx in 0..buffers.population {
            let sum: i64 = buffers.genome(idx).iter().map(|g| *g as i64).sum();
            buffers.fitnesses[idx] = sum as f32 / buffers.genome_len as f32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers() -> PopulationBuffers {
        PopulationBuffers::allocate(10, 4, Some(7))
    }

    #[test]
    fn seeded_allocation_is_reproducible() {
        let a = PopulationBuffers::allocate(10, 4, Some(7));
        let b = PopulationBuffers::allocate(10, 4, Some(7));
        assert_eq!(a.rng_seeds, b.rng_seeds);

        let c = PopulationBuffers::allocate(10, 4, Some(8));
        assert_ne!(a.rng_seeds, c.rng_seeds);
    }

    #[test]
    fn stub_evolution_is_deterministic_from_buffer_state() {
        let mut backend = StubBackend::new();
        let mut a = buffers();
        let mut b = buffers();
        for buf in [&mut a, &mut b] {
            backend.populate(buf).ok();
            backend.crossover(buf, 0.8).ok();
            backend.mutate(buf, 0.1).ok();
            backend.evaluate_fitness(buf).ok();
        }
        assert_eq!(a, b);
    }

    #[test]
    fn partial_populate_touches_only_prefix() {
        let mut backend = StubBackend::new();
        let mut buf = buffers();
        backend.populate(&mut buf).ok();
        let before = buf.clone();
        backend.populate_partial(&mut buf, 3).ok();

        for idx in 3..buf.population {
            assert_eq!(buf.genome(idx), before.genome(idx));
            assert_eq!(buf.rng_seeds[idx], before.rng_seeds[idx]);
        }
        assert_ne!(buf.genome(0), before.genome(0));
    }

    #[test]
    fn best_index_respects_direction() {
        let mut buf = buffers();
        buf.fitnesses = vec![5.0, 1.0, 9.0, 3.0, 2.0, 4.0, 6.0, 0.5, 8.0, 7.0];
        assert_eq!(buf.best_index(OptimizationDirection::Maximize), (2, 9.0));
        assert_eq!(buf.best_index(OptimizationDirection::Minimize), (7, 0.5));
    }

    #[test]
    fn default_splice_replaces_the_worst() {
        let mut backend = StubBackend::new();
        let mut buf = PopulationBuffers::allocate(4, 2, Some(1));
        buf.fitnesses = vec![4.0, 1.0, 3.0, 2.0];
        let elites = vec![(9.0, vec![7, 7]), (8.0, vec![6, 6])];

        backend
            .splice_elites(&mut buf, &elites, OptimizationDirection::Maximize)
            .ok();

        // Worst (1.0 at idx 1) and next worst (2.0 at idx 3) replaced.
        assert_eq!(buf.genome(1), &[7, 7]);
        assert_eq!(buf.fitnesses[1], 9.0);
        assert_eq!(buf.genome(3), &[6, 6]);
        assert_eq!(buf.fitnesses[3], 8.0);
        assert_eq!(buf.fitnesses[0], 4.0);
    }

    #[test]
    fn splice_rejects_wrong_genome_length() {
        let mut backend = StubBackend::new();
        let mut buf = PopulationBuffers::allocate(4, 2, Some(1));
        let err = backend
            .splice_elites(&mut buf, &[(1.0, vec![1, 2, 3])], OptimizationDirection::Maximize)
            .unwrap_err();
        assert!(matches!(err, BackendError::Step(_)));
    }

    #[test]
    fn rejected_splice_leaves_buffers_untouched() {
        let mut backend = StubBackend::new();
        let mut buf = PopulationBuffers::allocate(4, 2, Some(1));
        buf.fitnesses = vec![4.0, 1.0, 3.0, 2.0];
        let genomes_before = buf.genomes.clone();
        let fitnesses_before = buf.fitnesses.clone();

        // First elite is valid; the short second one fails the batch.
        let elites = vec![(9.0, vec![7, 7]), (8.0, vec![6])];
        assert!(backend
            .splice_elites(&mut buf, &elites, OptimizationDirection::Maximize)
            .is_err());

        assert_eq!(buf.genomes, genomes_before);
        assert_eq!(buf.fitnesses, fitnesses_before);
    }
}
