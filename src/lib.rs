//! # evogrid
//!
//! Distributed orchestration for population-based evolutionary search.
//!
//! A single control node drives many workers, each owning one compute
//! accelerator, over a sentinel-framed TCP transport:
//!
//! ```text
//! ControlNode ──fan-out Commands──▶ Worker(engine, device 0)
//!      ▲                           Worker(engine, device 1)
//!      └────aggregated Events────── Worker(engine, device N)
//! ```
//!
//! Each worker couples one [`engine::EvolutionEngine`] (generation loop on a
//! dedicated thread, governed by the [`lifecycle`] state machine) with one
//! [`transport::TransportClient`]. The control node fans commands to all
//! workers, republishes their events to observers, and runs the cross-worker
//! elite-migration protocol.
//!
//! The numeric kernels that perform crossover/mutation/fitness evaluation
//! are an external collaborator behind [`backend::ComputeBackend`]; this
//! crate only schedules, checkpoints, and synchronizes that computation.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod backend;
pub mod config;
pub mod control;
pub mod engine;
pub mod lifecycle;
pub mod protocol;
pub mod transport;
pub mod worker;

// Re-exports for convenience
pub use backend::{BackendError, ComputeBackend, PopulationBuffers, StubBackend};
pub use config::{GaConfig, OptimizationDirection, Termination};
pub use control::ControlNode;
pub use engine::EvolutionEngine;
pub use lifecycle::{Action, State, StateMachine};
pub use protocol::{Command, Event, WorkerId};
pub use worker::Worker;

/// Top-level crate errors not owned by a specific module.
#[derive(Error, Debug)]
pub enum EvoGridError {
    /// The global tracing subscriber could not be installed.
    #[error("tracing init failed: {0}")]
    TracingInit(String),
}

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`EvoGridError::TracingInit`] if the global subscriber has
/// already been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), EvoGridError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| EvoGridError::TracingInit(e.to_string()))
}
