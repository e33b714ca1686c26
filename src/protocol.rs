//! # Stage: Wire Protocol
//!
//! ## Responsibility
//! The command/event vocabulary exchanged between the control node and
//! workers, and its JSON encoding. Commands fan out node → workers;
//! events flow back worker → node.
//!
//! ## Guarantees
//! - Tagged: every message is a `{"type": ..., ...}` JSON object, so an
//!   unknown type fails decoding instead of being misread
//! - Self-identifying: every event carries the sending worker's id
//!
//! ## NOT Responsible For
//! - Byte framing (see: `transport::framing`)
//! - Deciding which commands are legal in which state (see: `worker`)

use crate::backend::PackedElite;
use crate::config::GaConfig;
use crate::engine::statistics::StatisticsReport;
use crate::lifecycle::State;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable identity of one worker process, minted at connect time.
pub type WorkerId = Uuid;

/// Errors raised while encoding or decoding wire messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The message could not be serialized.
    #[error("message encode failed: {0}")]
    Encode(String),

    /// The payload is not a valid message.
    #[error("message decode failed: {0}")]
    Decode(String),
}

/// One migrated elite as it travels on the wire: fitness, encoded
/// genome, and the worker it came from. The origin id survives
/// aggregation and rebroadcast so receivers can tell whose individual
/// they are splicing in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EliteRecord {
    /// Fitness at packing time, used for cross-worker ranking.
    pub fitness: f32,
    /// Encoded genome.
    pub genome: Vec<i32>,
    /// Worker whose population produced this individual.
    pub worker: WorkerId,
}

impl EliteRecord {
    /// Stamp a backend-packed elite with its origin worker.
    pub fn from_packed((fitness, genome): PackedElite, worker: WorkerId) -> Self {
        Self {
            fitness,
            genome,
            worker,
        }
    }

    /// Strip the attribution back down to what the backend splices.
    pub fn into_packed(self) -> PackedElite {
        (self.fitness, self.genome)
    }
}

/// Control-node → worker commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Allocate buffers and prepare the compute backend.
    Prepare {
        /// Full run configuration.
        config: GaConfig,
    },
    /// Start (or resume) a run segment. `None` rates fall back to the
    /// configuration defaults.
    Run {
        /// Per-gene mutation probability override.
        mutation_rate: Option<f64>,
        /// Crossover probability override.
        crossover_rate: Option<f64>,
    },
    /// Pause at the next generation boundary.
    Pause,
    /// Stop irreversibly at the next generation boundary.
    Stop,
    /// Checkpoint to a worker-local file. Legal only while paused.
    Save {
        /// Destination path on the worker's filesystem.
        path: String,
    },
    /// Load a worker-local checkpoint so the next run resumes from it.
    Restore {
        /// Source path on the worker's filesystem.
        path: String,
    },
    /// Request the statistics history.
    GetStatistics,
    /// Request the current best individual.
    GetBest,
    /// Splice migrated elites into the worker's population.
    Elites {
        /// Elites to splice, best first.
        elites: Vec<EliteRecord>,
    },
    /// Shut the worker down.
    Exit,
}

/// Worker → control-node events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// First message after connecting: the worker announces itself and
    /// its device.
    WorkerOnline {
        /// Sending worker.
        worker: WorkerId,
        /// Human-readable device name.
        device: String,
        /// Device platform or driver.
        platform: String,
    },
    /// The worker's lifecycle state machine transitioned.
    StateChanged {
        /// Sending worker.
        worker: WorkerId,
        /// State before the transition.
        from: State,
        /// State after the transition.
        to: State,
    },
    /// One generation finished. `elites` is empty unless elitism is
    /// configured.
    GenerationResult {
        /// Sending worker.
        worker: WorkerId,
        /// Generation index.
        generation: u64,
        /// Extreme fitness under the configured direction.
        best: f32,
        /// Opposite extreme.
        worst: f32,
        /// Population mean.
        avg: f32,
        /// Packed elites for migration.
        elites: Vec<EliteRecord>,
    },
    /// Reply to `GetStatistics`.
    Statistics {
        /// Sending worker.
        worker: WorkerId,
        /// Full history.
        report: StatisticsReport,
    },
    /// Reply to `GetBest`.
    Best {
        /// Sending worker.
        worker: WorkerId,
        /// Fitness of the best individual.
        fitness: f32,
        /// Its encoded genome.
        genome: Vec<i32>,
    },
    /// Reply to `Save`: the checkpoint was written.
    Saved {
        /// Sending worker.
        worker: WorkerId,
        /// Path written.
        path: String,
    },
    /// A command failed; the worker is still alive.
    CommandFailed {
        /// Sending worker.
        worker: WorkerId,
        /// Rejected command type.
        command: String,
        /// Failure description.
        reason: String,
    },
    /// The worker is gone (fatal backend fault or disconnect).
    WorkerLost {
        /// Lost worker.
        worker: WorkerId,
        /// What took it down.
        reason: String,
    },
}

impl Command {
    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Decode`] for malformed or unknown messages.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Wire name of this command, for logs and failure events.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Prepare { .. } => "prepare",
            Command::Run { .. } => "run",
            Command::Pause => "pause",
            Command::Stop => "stop",
            Command::Save { .. } => "save",
            Command::Restore { .. } => "restore",
            Command::GetStatistics => "get_statistics",
            Command::GetBest => "get_best",
            Command::Elites { .. } => "elites",
            Command::Exit => "exit",
        }
    }
}

impl Event {
    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Decode`] for malformed or unknown messages.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OptimizationDirection, Termination};

    #[test]
    fn command_roundtrip() {
        let command = Command::Prepare {
            config: GaConfig {
                population: 50,
                genome_len: 8,
                direction: OptimizationDirection::Maximize,
                termination: Termination::Count(10),
                mutation_rate: 0.1,
                crossover_rate: 0.8,
                elitism: None,
                diversity: None,
                seed: Some(42),
            },
        };
        let bytes = command.to_bytes().unwrap();
        assert_eq!(Command::from_bytes(&bytes).unwrap(), command);
    }

    #[test]
    fn event_roundtrip_with_elites() {
        let origin = Uuid::new_v4();
        let event = Event::GenerationResult {
            worker: origin,
            generation: 7,
            best: 9.5,
            worst: 1.0,
            avg: 4.2,
            elites: vec![EliteRecord {
                fitness: 9.5,
                genome: vec![1, 2, 3],
                worker: origin,
            }],
        };
        let bytes = event.to_bytes().unwrap();
        assert_eq!(Event::from_bytes(&bytes).unwrap(), event);
    }

    #[test]
    fn elite_records_keep_their_origin_through_packing() {
        let origin = Uuid::new_v4();
        let record = EliteRecord::from_packed((3.5, vec![4, 5]), origin);
        assert_eq!(record.worker, origin);
        assert_eq!(record.clone().into_packed(), (3.5, vec![4, 5]));
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        assert!(Command::from_bytes(br#"{"type":"reboot"}"#).is_err());
        assert!(Event::from_bytes(b"not json").is_err());
    }

    #[test]
    fn command_names_match_wire_tags() {
        let bytes = Command::Pause.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], Command::Pause.name());
    }
}
