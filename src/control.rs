//! # Stage: Control Node
//!
//! ## Responsibility
//! The single coordinator of a worker fleet: accept worker connections,
//! fan commands out to all of them, republish their events to local
//! observers, and run the cross-worker elite-migration protocol.
//!
//! ## Guarantees
//! - Every elite-bearing generation result from any worker advances the
//!   aggregation round; promotion happens once the configured round
//!   count is reached, then the accumulator is cleared and the round
//!   counter reset
//! - Promoted elites are globally ranked under the configured direction
//!   and truncated to top-K before broadcast
//! - A worker disconnect surfaces as a `worker_lost` event to observers
//!
//! ## NOT Responsible For
//! - Splicing elites into populations (workers do that locally)
//! - Scheduling generations (see: `engine`)

use crate::config::{ConfigError, ElitismConfig, GaConfig, OptimizationDirection};
use crate::protocol::{Command, EliteRecord, Event, ProtocolError, WorkerId};
use crate::transport::{TransportError, TransportEvent, TransportServer};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the observer event channel; slow observers lag, never
/// block the pump.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors raised by the control node.
#[derive(Error, Debug)]
pub enum ControlError {
    /// The fleet configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The listening transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A command could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Cross-worker elite accumulator.
///
/// Each elite-bearing generation result — from any worker — counts as one
/// round. After `every` rounds the pool is ranked, truncated to `top`,
/// returned for broadcast, and the accumulator starts over.
#[derive(Debug)]
pub struct EliteAggregator {
    direction: OptimizationDirection,
    top: usize,
    every: u32,
    round: u32,
    pool: Vec<EliteRecord>,
}

impl EliteAggregator {
    /// Aggregator for the given elitism parameters.
    pub fn new(direction: OptimizationDirection, elitism: ElitismConfig) -> Self {
        Self {
            direction,
            top: elitism.top,
            every: elitism.every,
            round: 0,
            pool: Vec::new(),
        }
    }

    /// Fold one worker's elites into the pool. Returns the promoted
    /// top-K when this ingest completes a promotion interval; empty
    /// batches do not advance the round.
    pub fn ingest(&mut self, elites: Vec<EliteRecord>) -> Option<Vec<EliteRecord>> {
        if elites.is_empty() {
            return None;
        }
        self.pool.extend(elites);
        self.round += 1;
        if self.round < self.every {
            return None;
        }
        let direction = self.direction;
        self.pool
            .sort_by(|a, b| direction.best_first(a.fitness, b.fitness));
        self.pool.truncate(self.top);
        self.round = 0;
        Some(std::mem::take(&mut self.pool))
    }

    /// Elites currently accumulated, for introspection.
    pub fn pending(&self) -> usize {
        self.pool.len()
    }
}

/// The fleet coordinator. Bind once, then drive every connected worker
/// through the command surface.
pub struct ControlNode {
    config: GaConfig,
    server: Arc<TransportServer>,
    workers: Arc<DashMap<SocketAddr, WorkerId>>,
    events: broadcast::Sender<Event>,
    pump_task: JoinHandle<()>,
}

impl ControlNode {
    /// Bind the listening transport and start the event pump.
    ///
    /// # Errors
    ///
    /// Configuration validation and bind errors.
    pub async fn bind(addr: SocketAddr, config: GaConfig) -> Result<Self, ControlError> {
        config.validate()?;
        let (server, mut inbound) = TransportServer::bind(addr).await?;
        let server = Arc::new(server);
        let workers: Arc<DashMap<SocketAddr, WorkerId>> = Arc::new(DashMap::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut aggregator = config
            .elitism
            .map(|elitism| EliteAggregator::new(config.direction, elitism));

        let pump_server = server.clone();
        let pump_workers = workers.clone();
        let pump_events = events.clone();
        let pump_task = tokio::spawn(async move {
            while let Some(transport_event) = inbound.recv().await {
                match transport_event {
                    TransportEvent::Connected(peer) => {
                        debug!(%peer, "worker transport connected");
                    }
                    TransportEvent::Message { peer, payload } => {
                        let event = match Event::from_bytes(&payload) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(%peer, error = %e, "undecodable worker event");
                                continue;
                            }
                        };
                        handle_worker_event(
                            &event,
                            peer,
                            &pump_server,
                            &pump_workers,
                            aggregator.as_mut(),
                        );
                        let _ = pump_events.send(event);
                    }
                    TransportEvent::Disconnected(peer) => {
                        if let Some((_, worker)) = pump_workers.remove(&peer) {
                            warn!(%peer, %worker, "worker disconnected");
                            let _ = pump_events.send(Event::WorkerLost {
                                worker,
                                reason: "transport disconnected".into(),
                            });
                        }
                    }
                }
            }
        });

        Ok(Self {
            config,
            server,
            workers,
            events,
            pump_task,
        })
    }

    /// Address workers should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Number of workers that have announced themselves.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Subscribe to the fleet's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Tell every worker to prepare with the fleet configuration.
    ///
    /// # Errors
    ///
    /// Encoding errors only; delivery failures surface as disconnects.
    pub fn prepare(&self) -> Result<(), ControlError> {
        self.broadcast(&Command::Prepare {
            config: self.config.clone(),
        })
    }

    /// Start (or resume) every worker's run segment.
    ///
    /// # Errors
    ///
    /// Encoding errors only.
    pub fn run(
        &self,
        mutation_rate: Option<f64>,
        crossover_rate: Option<f64>,
    ) -> Result<(), ControlError> {
        self.broadcast(&Command::Run {
            mutation_rate,
            crossover_rate,
        })
    }

    /// Pause every worker at its next generation boundary.
    ///
    /// # Errors
    ///
    /// Encoding errors only.
    pub fn pause(&self) -> Result<(), ControlError> {
        self.broadcast(&Command::Pause)
    }

    /// Stop every worker irreversibly.
    ///
    /// # Errors
    ///
    /// Encoding errors only.
    pub fn stop(&self) -> Result<(), ControlError> {
        self.broadcast(&Command::Stop)
    }

    /// Checkpoint every paused worker to the given worker-local path.
    ///
    /// # Errors
    ///
    /// Encoding errors only.
    pub fn save(&self, path: &str) -> Result<(), ControlError> {
        self.broadcast(&Command::Save { path: path.into() })
    }

    /// Restore every worker from the given worker-local checkpoint path.
    ///
    /// # Errors
    ///
    /// Encoding errors only.
    pub fn restore(&self, path: &str) -> Result<(), ControlError> {
        self.broadcast(&Command::Restore { path: path.into() })
    }

    /// Ask every worker for its statistics history.
    ///
    /// # Errors
    ///
    /// Encoding errors only.
    pub fn request_statistics(&self) -> Result<(), ControlError> {
        self.broadcast(&Command::GetStatistics)
    }

    /// Ask every worker for its current best individual.
    ///
    /// # Errors
    ///
    /// Encoding errors only.
    pub fn request_best(&self) -> Result<(), ControlError> {
        self.broadcast(&Command::GetBest)
    }

    /// Shut every worker down.
    ///
    /// # Errors
    ///
    /// Encoding errors only.
    pub fn exit(&self) -> Result<(), ControlError> {
        self.broadcast(&Command::Exit)
    }

    fn broadcast(&self, command: &Command) -> Result<(), ControlError> {
        debug!(command = command.name(), "broadcasting to fleet");
        self.server.broadcast(&command.to_bytes()?);
        Ok(())
    }
}

fn handle_worker_event(
    event: &Event,
    peer: SocketAddr,
    server: &TransportServer,
    workers: &DashMap<SocketAddr, WorkerId>,
    aggregator: Option<&mut EliteAggregator>,
) {
    match event {
        Event::WorkerOnline {
            worker,
            device,
            platform,
        } => {
            info!(%peer, %worker, device, platform, "worker online");
            workers.insert(peer, *worker);
        }
        Event::GenerationResult { elites, .. } => {
            if let Some(aggregator) = aggregator {
                if let Some(promoted) = aggregator.ingest(elites.clone()) {
                    info!(count = promoted.len(), "promoting migrated elites");
                    match (Command::Elites { elites: promoted }).to_bytes() {
                        Ok(bytes) => server.broadcast(&bytes),
                        Err(e) => warn!(error = %e, "elites command encode failed"),
                    }
                }
            }
        }
        Event::WorkerLost { worker, .. } => {
            workers.retain(|_, id| id != worker);
        }
        _ => {}
    }
}

impl Drop for ControlNode {
    fn drop(&mut self) {
        self.pump_task.abort();
    }
}

impl std::fmt::Debug for ControlNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlNode")
            .field("local_addr", &self.server.local_addr())
            .field("workers", &self.workers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(fitness: f32, worker: WorkerId) -> EliteRecord {
        EliteRecord {
            fitness,
            genome: vec![fitness as i32],
            worker,
        }
    }

    #[test]
    fn promotes_global_top_k_after_every_n_rounds() {
        let mut agg = EliteAggregator::new(
            OptimizationDirection::Maximize,
            ElitismConfig { top: 3, every: 2 },
        );
        let worker_a = Uuid::new_v4();
        let worker_b = Uuid::new_v4();

        // Round 1: worker A's batch accumulates.
        assert!(agg
            .ingest(vec![
                record(5.0, worker_a),
                record(4.0, worker_a),
                record(3.0, worker_a),
            ])
            .is_none());
        assert_eq!(agg.pending(), 3);

        // Round 2: worker B's batch completes the interval.
        let promoted = agg
            .ingest(vec![
                record(6.0, worker_b),
                record(2.0, worker_b),
                record(1.0, worker_b),
            ])
            .unwrap();
        let fitnesses: Vec<f32> = promoted.iter().map(|e| e.fitness).collect();
        assert_eq!(fitnesses, vec![6.0, 5.0, 4.0]);

        // Each promoted elite still names the worker that produced it.
        let origins: Vec<WorkerId> = promoted.iter().map(|e| e.worker).collect();
        assert_eq!(origins, vec![worker_b, worker_a, worker_a]);

        // Accumulator cleared, counter reset.
        assert_eq!(agg.pending(), 0);
        assert!(agg.ingest(vec![record(9.0, worker_a)]).is_none());
    }

    #[test]
    fn rounds_count_messages_not_workers() {
        let mut agg = EliteAggregator::new(
            OptimizationDirection::Maximize,
            ElitismConfig { top: 2, every: 2 },
        );
        // Two batches from the same worker still complete the interval.
        let worker = Uuid::new_v4();
        assert!(agg.ingest(vec![record(1.0, worker)]).is_none());
        assert!(agg.ingest(vec![record(2.0, worker)]).is_some());
    }

    #[test]
    fn empty_batches_do_not_advance_the_round() {
        let mut agg = EliteAggregator::new(
            OptimizationDirection::Maximize,
            ElitismConfig { top: 2, every: 1 },
        );
        assert!(agg.ingest(Vec::new()).is_none());
        assert_eq!(agg.pending(), 0);
    }

    #[test]
    fn minimize_ranks_smallest_first() {
        let mut agg = EliteAggregator::new(
            OptimizationDirection::Minimize,
            ElitismConfig { top: 2, every: 1 },
        );
        let worker = Uuid::new_v4();
        let promoted = agg
            .ingest(vec![
                record(5.0, worker),
                record(1.0, worker),
                record(3.0, worker),
            ])
            .unwrap();
        let fitnesses: Vec<f32> = promoted.iter().map(|e| e.fitness).collect();
        assert_eq!(fitnesses, vec![1.0, 3.0]);
    }
}
