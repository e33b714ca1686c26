//! # Stage: Checkpoint Schema
//!
//! ## Responsibility
//! Define the explicit, versioned snapshot of an evolution run — every
//! field enumerated, nothing implicit — and its binary encoding. A
//! checkpoint captured while paused is sufficient to resume identically
//! on a fresh engine.
//!
//! ## Guarantees
//! - Versioned: decoding rejects unknown schema versions up front
//! - Complete: generation index, statistics, elapsed offset, population
//!   buffers, RNG seeds, probabilities, and backend auxiliary bytes
//! - Binary: `bincode` on the wire and on disk, never an object graph
//!
//! ## NOT Responsible For
//! - Deciding when checkpointing is legal (see: `engine` — paused only)
//! - Auxiliary buffer contents (delegated to the `ComputeBackend`)

use crate::backend::PopulationBuffers;
use crate::engine::statistics::StatisticsReport;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Current checkpoint schema version.
pub const CHECKPOINT_VERSION: u16 = 1;

/// Errors raised while encoding, decoding, or storing checkpoints.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The snapshot could not be serialized.
    #[error("checkpoint encode failed: {0}")]
    Encode(String),

    /// The bytes are not a valid checkpoint.
    #[error("checkpoint decode failed: {0}")]
    Decode(String),

    /// The checkpoint was written by an incompatible schema version.
    #[error("unsupported checkpoint version {found}, expected {expected}")]
    UnsupportedVersion {
        /// Version found in the data.
        found: u16,
        /// Version this build understands.
        expected: u16,
    },

    /// Filesystem error while reading or writing a checkpoint file.
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serializable snapshot of one worker's evolution state.
///
/// Producible only while the engine is paused; read back verbatim by
/// restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version, always [`CHECKPOINT_VERSION`] for snapshots made
    /// by this build.
    pub version: u16,
    /// Next generation index to execute.
    pub generation_index: u64,
    /// Full statistics history up to the pause point.
    pub statistics: StatisticsReport,
    /// Cumulative run time before the pause, in milliseconds.
    pub elapsed_ms: u64,
    /// Number of individuals.
    pub population: usize,
    /// Genes per genome.
    pub genome_len: usize,
    /// Per-individual RNG state.
    pub rng_seeds: Vec<u32>,
    /// Per-individual fitness at the pause point.
    pub fitnesses: Vec<f32>,
    /// Flat genome buffer.
    pub genomes: Vec<i32>,
    /// Mutation probability of the paused run segment.
    pub mutation_rate: f64,
    /// Crossover probability of the paused run segment.
    pub crossover_rate: f64,
    /// Representation-specific auxiliary buffers, opaque to this layer.
    pub aux: Vec<u8>,
}

impl Checkpoint {
    /// Rebuild the host population buffers this checkpoint captured.
    pub fn to_buffers(&self) -> PopulationBuffers {
        PopulationBuffers {
            population: self.population,
            genome_len: self.genome_len,
            genomes: self.genomes.clone(),
            fitnesses: self.fitnesses.clone(),
            rng_seeds: self.rng_seeds.clone(),
        }
    }

    /// Encode to the binary schema.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        bincode::serialize(self).map_err(|e| CheckpointError::Encode(e.to_string()))
    }

    /// Decode from the binary schema, rejecting unknown versions.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::Decode`] for malformed bytes,
    /// [`CheckpointError::UnsupportedVersion`] for a version mismatch.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let checkpoint: Checkpoint =
            bincode::deserialize(bytes).map_err(|e| CheckpointError::Decode(e.to_string()))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: checkpoint.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        Ok(checkpoint)
    }

    /// Write the encoded checkpoint to a file.
    ///
    /// # Errors
    ///
    /// Encoding and filesystem errors.
    pub fn write_to(&self, path: &Path) -> Result<(), CheckpointError> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Read and decode a checkpoint file.
    ///
    /// # Errors
    ///
    /// Filesystem, decode, and version errors.
    pub fn read_from(path: &Path) -> Result<Self, CheckpointError> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::statistics::GenerationStats;

    fn sample() -> Checkpoint {
        let mut statistics = StatisticsReport::default();
        statistics.record(
            0,
            GenerationStats {
                best: 9.0,
                worst: 1.0,
                avg: 4.5,
            },
        );
        Checkpoint {
            version: CHECKPOINT_VERSION,
            generation_index: 1,
            statistics,
            elapsed_ms: 1234,
            population: 3,
            genome_len: 2,
            rng_seeds: vec![1, 2, 3],
            fitnesses: vec![9.0, 1.0, 3.5],
            genomes: vec![1, 2, 3, 4, 5, 6],
            mutation_rate: 0.1,
            crossover_rate: 0.8,
            aux: vec![0xAB, 0xCD],
        }
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let checkpoint = sample();
        let bytes = checkpoint.to_bytes().unwrap();
        let back = Checkpoint::from_bytes(&bytes).unwrap();
        assert_eq!(back, checkpoint);
    }

    #[test]
    fn unknown_version_rejected() {
        let mut checkpoint = sample();
        checkpoint.version = 99;
        let bytes = bincode::serialize(&checkpoint).unwrap();
        assert!(matches!(
            Checkpoint::from_bytes(&bytes),
            Err(CheckpointError::UnsupportedVersion {
                found: 99,
                expected: CHECKPOINT_VERSION
            })
        ));
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        assert!(matches!(
            Checkpoint::from_bytes(&[0xFF; 7]),
            Err(CheckpointError::Decode(_) | CheckpointError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let checkpoint = sample();
        checkpoint.write_to(&path).unwrap();
        assert_eq!(Checkpoint::read_from(&path).unwrap(), checkpoint);
    }
}
