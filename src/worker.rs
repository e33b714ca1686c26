//! # Stage: Worker
//!
//! ## Responsibility
//! Couple one evolution engine to one transport client: decode commands,
//! drive the engine, and stream lifecycle transitions and generation
//! results back to the control node. One worker owns exactly one compute
//! device.
//!
//! ## Guarantees
//! - Gated: every command except `prepare` and `exit` is rejected with a
//!   `command_failed` event until the engine exists
//! - Non-fatal errors answer with `command_failed`; the worker stays up
//! - Fatal faults (backend prepare failure, corrupted buffers) emit
//!   `worker_lost` and shut the worker down
//!
//! ## NOT Responsible For
//! - Generation scheduling (see: `engine`)
//! - Elite aggregation across workers (see: `control`)

use crate::backend::{BackendError, ComputeBackend, StubBackend};
use crate::config::GaConfig;
use crate::engine::checkpoint::Checkpoint;
use crate::engine::{EngineError, EvolutionEngine};
use crate::protocol::{Command, EliteRecord, Event, ProtocolError, WorkerId};
use crate::transport::{Connection, TransportClient, TransportError, TransportEvent};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Errors that take a worker down.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Connection to the control node failed or died.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An outbound event could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The engine failed fatally.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The compute backend could not be created.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The backend factory reported no usable devices.
    #[error("no compute devices available")]
    NoDevice,

    /// A blocking engine call panicked or was cancelled.
    #[error("engine task failed: {0}")]
    Task(String),
}

/// One enumerable compute device, as reported by a backend factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Factory-local device index.
    pub index: usize,
    /// Human-readable device name.
    pub name: String,
    /// Platform or driver identifier.
    pub platform: String,
}

/// Enumerates devices and builds one backend per device. Device
/// enumeration happens here, before any engine exists, so a device probe
/// crash cannot take down a running engine.
pub trait BackendFactory: Send + Sync {
    /// List usable devices, one worker per entry.
    fn devices(&self) -> Vec<DeviceDescriptor>;

    /// Build a backend bound to `device`.
    ///
    /// # Errors
    ///
    /// [`BackendError::Prepare`] when the device cannot be opened.
    fn create(&self, device: &DeviceDescriptor) -> Result<Box<dyn ComputeBackend>, BackendError>;
}

/// Factory for the in-process deterministic stub: a single pseudo-device.
#[derive(Debug, Default)]
pub struct StubBackendFactory;

impl BackendFactory for StubBackendFactory {
    fn devices(&self) -> Vec<DeviceDescriptor> {
        vec![DeviceDescriptor {
            index: 0,
            name: "stub-cpu".into(),
            platform: "host".into(),
        }]
    }

    fn create(&self, _device: &DeviceDescriptor) -> Result<Box<dyn ComputeBackend>, BackendError> {
        Ok(Box::new(StubBackend::new()))
    }
}

enum Flow {
    Continue,
    Exit,
}

/// Everything the dispatch handlers touch; kept apart from the inbound
/// receivers so the select loop can poll and dispatch without borrow
/// contention.
struct WorkerCore {
    id: WorkerId,
    device: DeviceDescriptor,
    factory: Arc<dyn BackendFactory>,
    client: TransportClient,
    fault_tx: mpsc::UnboundedSender<String>,
    engine: Option<Arc<EvolutionEngine>>,
    config: Option<GaConfig>,
}

/// One worker process: engine + transport client + dispatch loop.
pub struct Worker {
    core: WorkerCore,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    faults: mpsc::UnboundedReceiver<String>,
}

impl Worker {
    /// Connect to the control node on the factory's first device.
    ///
    /// # Errors
    ///
    /// [`WorkerError::NoDevice`] with an empty device list; connect
    /// refusal is fatal and propagates as a transport error.
    pub async fn connect(
        addr: SocketAddr,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<Self, WorkerError> {
        let device = factory
            .devices()
            .into_iter()
            .next()
            .ok_or(WorkerError::NoDevice)?;
        Self::connect_device(addr, device, factory).await
    }

    /// Connect to the control node bound to a specific device.
    ///
    /// # Errors
    ///
    /// Transport and protocol errors; connect refusal is fatal.
    pub async fn connect_device(
        addr: SocketAddr,
        device: DeviceDescriptor,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<Self, WorkerError> {
        let (client, inbound) = TransportClient::connect(addr).await?;
        let id = Uuid::new_v4();
        let online = Event::WorkerOnline {
            worker: id,
            device: device.name.clone(),
            platform: device.platform.clone(),
        };
        client.send(&online.to_bytes()?)?;
        info!(worker = %id, device = %device.name, "worker online");

        let (fault_tx, faults) = mpsc::unbounded_channel();
        Ok(Self {
            core: WorkerCore {
                id,
                device,
                factory,
                client,
                fault_tx,
                engine: None,
                config: None,
            },
            inbound,
            faults,
        })
    }

    /// This worker's identity.
    pub fn id(&self) -> WorkerId {
        self.core.id
    }

    /// Dispatch commands until `exit`, disconnect, or a fatal fault.
    ///
    /// # Errors
    ///
    /// Only fatal conditions; command-level failures are answered with
    /// `command_failed` events instead.
    pub async fn run(self) -> Result<(), WorkerError> {
        let Worker {
            mut core,
            mut inbound,
            mut faults,
        } = self;

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(TransportEvent::Message { payload, .. }) => {
                        match Command::from_bytes(&payload) {
                            Ok(command) => {
                                if let Flow::Exit = core.dispatch(command).await? {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(worker = %core.id, error = %e, "undecodable command");
                                core.reject("unknown", &e.to_string())?;
                            }
                        }
                    }
                    Some(TransportEvent::Disconnected(_)) | None => {
                        info!(worker = %core.id, "control node connection closed");
                        break;
                    }
                    Some(TransportEvent::Connected(_)) => {}
                },
                fault = faults.recv() => {
                    let reason = fault.unwrap_or_else(|| "fault channel closed".into());
                    error!(worker = %core.id, reason, "fatal fault; worker self-terminates");
                    core.send(Event::WorkerLost {
                        worker: core.id,
                        reason,
                    })?;
                    break;
                }
            }
        }
        Ok(())
    }
}

impl WorkerCore {
    async fn dispatch(&mut self, command: Command) -> Result<Flow, WorkerError> {
        match command {
            Command::Exit => {
                info!(worker = %self.id, "exit requested");
                Ok(Flow::Exit)
            }
            Command::Prepare { config } => self.handle_prepare(config).await,
            other if self.engine.is_none() => {
                self.reject(other.name(), "worker is not prepared")?;
                Ok(Flow::Continue)
            }
            Command::Run {
                mutation_rate,
                crossover_rate,
            } => {
                let (default_m, default_c) = self
                    .config
                    .as_ref()
                    .map(|c| (c.mutation_rate, c.crossover_rate))
                    .unwrap_or((0.0, 0.0));
                let engine = self.engine_handle()?;
                let result = engine.run(
                    mutation_rate.unwrap_or(default_m),
                    crossover_rate.unwrap_or(default_c),
                );
                self.answer("run", result)
            }
            Command::Pause => {
                let engine = self.engine_handle()?;
                let result = blocking(move || engine.pause()).await?;
                self.answer("pause", result)
            }
            Command::Stop => {
                let engine = self.engine_handle()?;
                let result = blocking(move || engine.stop()).await?;
                self.answer("stop", result)
            }
            Command::Save { path } => {
                let engine = self.engine_handle()?;
                let target = path.clone();
                let result = blocking(move || {
                    let checkpoint = engine.save()?;
                    checkpoint.write_to(Path::new(&target))?;
                    Ok::<(), EngineError>(())
                })
                .await?;
                match result {
                    Ok(()) => {
                        self.send(Event::Saved {
                            worker: self.id,
                            path,
                        })?;
                    }
                    Err(e) => self.reject("save", &e.to_string())?,
                }
                Ok(Flow::Continue)
            }
            Command::Restore { path } => {
                let engine = self.engine_handle()?;
                let result = blocking(move || {
                    let checkpoint = Checkpoint::read_from(Path::new(&path))?;
                    engine.restore(&checkpoint)
                })
                .await?;
                self.answer("restore", result)
            }
            Command::GetStatistics => {
                let engine = self.engine_handle()?;
                self.send(Event::Statistics {
                    worker: self.id,
                    report: engine.statistics(),
                })?;
                Ok(Flow::Continue)
            }
            Command::GetBest => {
                let engine = self.engine_handle()?;
                match engine.best() {
                    Ok((genome, fitness)) => self.send(Event::Best {
                        worker: self.id,
                        fitness,
                        genome,
                    })?,
                    Err(e) => self.reject("get_best", &e.to_string())?,
                }
                Ok(Flow::Continue)
            }
            Command::Elites { elites } => {
                let engine = self.engine_handle()?;
                let packed: Vec<_> = elites.into_iter().map(EliteRecord::into_packed).collect();
                self.answer("elites", engine.splice_elites(&packed))
            }
        }
    }

    async fn handle_prepare(&mut self, config: GaConfig) -> Result<Flow, WorkerError> {
        if self.engine.is_some() {
            self.reject("prepare", "worker is already prepared")?;
            return Ok(Flow::Continue);
        }
        let backend = match self.factory.create(&self.device) {
            Ok(backend) => backend,
            Err(e) => {
                // Device cannot be opened; nothing this worker can do.
                error!(worker = %self.id, error = %e, "backend creation failed");
                self.send(Event::WorkerLost {
                    worker: self.id,
                    reason: e.to_string(),
                })?;
                return Ok(Flow::Exit);
            }
        };
        let engine = match EvolutionEngine::new(config.clone(), backend) {
            Ok(engine) => Arc::new(engine),
            Err(e) => {
                self.reject("prepare", &e.to_string())?;
                return Ok(Flow::Continue);
            }
        };
        self.install_hooks(&engine);

        let prepare_engine = engine.clone();
        let result = blocking(move || prepare_engine.prepare()).await?;
        if let Err(e) = result {
            error!(worker = %self.id, error = %e, "prepare failed; worker is lost");
            self.send(Event::WorkerLost {
                worker: self.id,
                reason: e.to_string(),
            })?;
            return Ok(Flow::Exit);
        }
        self.engine = Some(engine);
        self.config = Some(config);
        Ok(Flow::Continue)
    }

    /// Wire the engine's hooks to the outbound connection. Hooks run on
    /// the evolution thread; `Connection::send` only queues, so they
    /// never block a generation.
    fn install_hooks(&self, engine: &Arc<EvolutionEngine>) {
        let id = self.id;

        let sender = self.client.sender();
        engine.set_state_observer(Box::new(move |from, to| {
            send_event(
                &sender,
                Event::StateChanged {
                    worker: id,
                    from,
                    to,
                },
            );
        }));

        let sender = self.client.sender();
        engine.set_generation_hook(Arc::new(move |generation, stats, elites| {
            send_event(
                &sender,
                Event::GenerationResult {
                    worker: id,
                    generation,
                    best: stats.best,
                    worst: stats.worst,
                    avg: stats.avg,
                    elites: elites
                        .unwrap_or_default()
                        .into_iter()
                        .map(|packed| EliteRecord::from_packed(packed, id))
                        .collect(),
                },
            );
        }));

        let fault_tx = self.fault_tx.clone();
        engine.set_fault_hook(Arc::new(move |error| {
            let _ = fault_tx.send(error.to_string());
        }));
    }

    fn engine_handle(&self) -> Result<Arc<EvolutionEngine>, WorkerError> {
        // Callers only reach this after the pre-prepare gate.
        self.engine
            .clone()
            .ok_or_else(|| WorkerError::Task("engine missing after gate".into()))
    }

    fn answer(&self, command: &str, result: Result<(), EngineError>) -> Result<Flow, WorkerError> {
        if let Err(e) = result {
            self.reject(command, &e.to_string())?;
        }
        Ok(Flow::Continue)
    }

    fn reject(&self, command: &str, reason: &str) -> Result<(), WorkerError> {
        warn!(worker = %self.id, command, reason, "command rejected");
        self.send(Event::CommandFailed {
            worker: self.id,
            command: command.into(),
            reason: reason.into(),
        })
    }

    fn send(&self, event: Event) -> Result<(), WorkerError> {
        self.client.send(&event.to_bytes()?)?;
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> Result<T, WorkerError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WorkerError::Task(e.to_string()))
}

fn send_event(sender: &Connection, event: Event) {
    match event.to_bytes() {
        Ok(bytes) => {
            if let Err(e) = sender.send(&bytes) {
                warn!(error = %e, "event send failed");
            }
        }
        Err(e) => warn!(error = %e, "event encode failed"),
    }
}

/// Spawn one worker per device the factory enumerates, all connected to
/// the same control node. Returns the join handles.
pub fn spawn_fleet(
    addr: SocketAddr,
    factory: Arc<dyn BackendFactory>,
) -> Vec<JoinHandle<Result<(), WorkerError>>> {
    factory
        .devices()
        .into_iter()
        .map(|device| {
            let factory = factory.clone();
            tokio::spawn(async move {
                Worker::connect_device(addr, device, factory)
                    .await?
                    .run()
                    .await
            })
        })
        .collect()
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.core.id)
            .field("device", &self.core.device.name)
            .field("prepared", &self.core.engine.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_factory_reports_one_device() {
        let factory = StubBackendFactory;
        let devices = factory.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "stub-cpu");
        assert!(factory.create(&devices[0]).is_ok());
    }
}
