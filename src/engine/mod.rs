//! # Stage: Evolution Engine
//!
//! ## Responsibility
//! Drive one worker's generation loop on a dedicated long-lived thread:
//! prepare/run/pause/stop/save/restore, per-generation statistics, the
//! diversity-collapse guard, and the elite splice. Every public lifecycle
//! call issues its named action to the state machine on entry and `Done`
//! on completion.
//!
//! ## Guarantees
//! - One generation at a time: the population buffer mutex serializes the
//!   generation step against the elite splice
//! - Monotonic: the generation index strictly increases within a run
//! - Synchronous pause: `pause()` returns only after the loop has observed
//!   the flag at a boundary and flushed state to host-visible memory
//! - Cooperative cancellation: a generation already in flight runs to
//!   completion even after `stop()` is requested
//!
//! ## NOT Responsible For
//! - Numeric kernels (see: `backend`)
//! - Wire encoding of results (see: `worker`, `protocol`)

pub mod checkpoint;
pub mod statistics;

use crate::backend::{BackendError, ComputeBackend, PackedElite, PopulationBuffers};
use crate::config::{validate_rate, ConfigError, GaConfig, Termination};
use crate::lifecycle::{Action, State, StateMachine, TransitionObserver};
use checkpoint::{Checkpoint, CheckpointError, CHECKPOINT_VERSION};
use statistics::{GenerationStats, StatisticsReport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors raised by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Run configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The operation is not legal in the current lifecycle state.
    #[error("cannot {op} while {state:?}")]
    WrongState {
        /// Attempted operation.
        op: &'static str,
        /// State the engine was in.
        state: State,
    },

    /// Checkpoints can only be produced while paused.
    #[error("save is only available while paused")]
    NotPaused,

    /// Buffers have not been allocated yet.
    #[error("engine has not been prepared")]
    NotPrepared,

    /// The compute backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Checkpoint encode/decode/storage failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// The evolution thread could not be spawned.
    #[error("failed to spawn evolution thread: {0}")]
    Thread(String),
}

/// Hook invoked at every generation boundary with the generation index,
/// its statistics, and the packed elites when elitism is configured.
pub type GenerationHook = Arc<dyn Fn(u64, GenerationStats, Option<Vec<PackedElite>>) + Send + Sync>;

/// Hook invoked when the loop self-terminates on corrupted buffers.
pub type FaultHook = Arc<dyn Fn(&BackendError) + Send + Sync>;

/// Work handed to the evolution thread through the single-slot queue.
struct RunTask {
    mutation_rate: f64,
    crossover_rate: f64,
}

/// State owned by the population-buffer mutex: everything the generation
/// step and the elite splice contend for.
struct Core {
    backend: Box<dyn ComputeBackend>,
    buffers: Option<PopulationBuffers>,
    statistics: StatisticsReport,
    generation_index: u64,
    /// Run time carried across pauses (the checkpoint's elapsed offset).
    carried: Duration,
    /// Cumulative wall-clock time over all run segments.
    elapsed: Duration,
    mutation_rate: f64,
    crossover_rate: f64,
    /// Set by pause/restore so the next `run` skips gen-0 population.
    resume_pending: bool,
    /// Diversity-guard latch: repopulate instead of crossover next step.
    repopulate_next: bool,
    corrupted: bool,
}

/// Cross-thread handshake flags, kept outside the core mutex so the
/// caller side never blocks on an in-flight generation just to signal.
struct Signals {
    task: Mutex<Option<RunTask>>,
    task_cv: Condvar,
    shutdown: AtomicBool,
    pause_requested: AtomicBool,
    force_stop: AtomicBool,
    loop_state: Mutex<LoopState>,
    loop_cv: Condvar,
}

#[derive(Default)]
struct LoopState {
    segment_active: bool,
    pause_acked: bool,
}

struct Shared {
    config: GaConfig,
    state: Mutex<StateMachine>,
    core: Mutex<Core>,
    signals: Signals,
    generation_hook: Mutex<Option<GenerationHook>>,
    fault_hook: Mutex<Option<FaultHook>>,
}

/// Recover a poisoned lock; the loop holds no invariants a panic could
/// half-apply that the state machine does not already gate.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-worker evolution engine. One accelerator context, one lifecycle
/// state machine, one generation loop thread.
pub struct EvolutionEngine {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl EvolutionEngine {
    /// Create an engine over a compute backend and spawn its evolution
    /// thread. The engine starts in [`State::Waiting`].
    ///
    /// # Errors
    ///
    /// Configuration validation errors, or [`EngineError::Thread`] if the
    /// loop thread cannot be spawned.
    pub fn new(config: GaConfig, backend: Box<dyn ComputeBackend>) -> Result<Self, EngineError> {
        config.validate()?;
        let mutation_rate = config.mutation_rate;
        let crossover_rate = config.crossover_rate;
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(StateMachine::new()),
            core: Mutex::new(Core {
                backend,
                buffers: None,
                statistics: StatisticsReport::default(),
                generation_index: 0,
                carried: Duration::ZERO,
                elapsed: Duration::ZERO,
                mutation_rate,
                crossover_rate,
                resume_pending: false,
                repopulate_next: false,
                corrupted: false,
            }),
            signals: Signals {
                task: Mutex::new(None),
                task_cv: Condvar::new(),
                shutdown: AtomicBool::new(false),
                pause_requested: AtomicBool::new(false),
                force_stop: AtomicBool::new(false),
                loop_state: Mutex::new(LoopState::default()),
                loop_cv: Condvar::new(),
            },
            generation_hook: Mutex::new(None),
            fault_hook: Mutex::new(None),
        });

        let loop_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("evolution-loop".into())
            .spawn(move || evolution_loop(loop_shared))
            .map_err(|e| EngineError::Thread(e.to_string()))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Register the observer notified on every lifecycle transition.
    pub fn set_state_observer(&self, observer: TransitionObserver) {
        lock(&self.shared.state).set_observer(observer);
    }

    /// Register the per-generation hook (statistics + elites payload).
    pub fn set_generation_hook(&self, hook: GenerationHook) {
        *lock(&self.shared.generation_hook) = Some(hook);
    }

    /// Register the hook invoked when the loop self-terminates on
    /// corrupted buffers.
    pub fn set_fault_hook(&self, hook: FaultHook) {
        *lock(&self.shared.fault_hook) = Some(hook);
    }

    /// Current lifecycle state.
    pub fn current_state(&self) -> State {
        lock(&self.shared.state).current()
    }

    /// Cumulative wall-clock time spent in run segments.
    pub fn elapsed(&self) -> Duration {
        lock(&self.shared.core).elapsed
    }

    /// Whether the loop self-terminated on corrupted buffers.
    pub fn is_corrupted(&self) -> bool {
        lock(&self.shared.core).corrupted
    }

    /// Allocate population buffers and prepare the backend. Callable
    /// once, from [`State::Waiting`].
    ///
    /// # Errors
    ///
    /// [`EngineError::WrongState`] outside `Waiting`; backend prepare
    /// failures are fatal to the owning worker.
    pub fn prepare(&self) -> Result<(), EngineError> {
        self.enter("prepare", Action::Prepare)?;
        let result = {
            let mut core = lock(&self.shared.core);
            let mut buffers = PopulationBuffers::allocate(
                self.shared.config.population,
                self.shared.config.genome_len,
                self.shared.config.seed,
            );
            core.backend
                .prepare(&mut buffers)
                .map(|()| core.buffers = Some(buffers))
        };
        match result {
            Ok(()) => {
                lock(&self.shared.state).transition(Action::Done);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "prepare failed; worker is lost");
                Err(e.into())
            }
        }
    }

    /// Queue a run segment with the given rates, both required in (0, 1)
    /// exclusive. If the engine is not resuming from a pause or restore,
    /// generation 0 is populated and evaluated first. Returns once the
    /// task is queued; the loop runs on the evolution thread.
    ///
    /// # Errors
    ///
    /// Parameter errors for out-of-range rates; [`EngineError::WrongState`]
    /// unless the engine is `Prepared` or `Paused`.
    pub fn run(&self, mutation_rate: f64, crossover_rate: f64) -> Result<(), EngineError> {
        validate_rate("mutation_rate", mutation_rate)?;
        validate_rate("crossover_rate", crossover_rate)?;
        self.enter("run", Action::Run)?;

        self.shared
            .signals
            .pause_requested
            .store(false, Ordering::SeqCst);
        {
            let mut core = lock(&self.shared.core);
            core.mutation_rate = mutation_rate;
            core.crossover_rate = crossover_rate;
        }
        // Marked active before the slot is filled: the moment the loop
        // can pick the task up, a pause or stop issued right after run()
        // already has a segment to wait on. The other order leaves a
        // window where the segment starts and finishes first, then the
        // stale flag strands pause and stop forever.
        {
            let mut loop_state = lock(&self.shared.signals.loop_state);
            loop_state.segment_active = true;
            loop_state.pause_acked = false;
        }
        {
            let mut slot = lock(&self.shared.signals.task);
            *slot = Some(RunTask {
                mutation_rate,
                crossover_rate,
            });
        }
        self.shared.signals.task_cv.notify_one();

        // Implicit `done`; (Running, Done) has no row and is tolerated.
        lock(&self.shared.state).transition(Action::Done);
        Ok(())
    }

    /// Request a pause and block until the loop acknowledges it at a
    /// generation boundary with state flushed to host memory.
    ///
    /// # Errors
    ///
    /// [`EngineError::WrongState`] unless the engine is `Running`.
    pub fn pause(&self) -> Result<(), EngineError> {
        self.enter("pause", Action::Pause)?;

        let mut loop_state = lock(&self.shared.signals.loop_state);
        if loop_state.segment_active {
            // The flag is set while holding the loop-state lock, so the
            // segment either observes it at a boundary (and acks) or winds
            // down on its own (and clears segment_active); wait for either.
            self.shared
                .signals
                .pause_requested
                .store(true, Ordering::SeqCst);
            while loop_state.segment_active && !loop_state.pause_acked {
                loop_state = self
                    .shared
                    .signals
                    .loop_cv
                    .wait(loop_state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            let acked = loop_state.pause_acked;
            loop_state.pause_acked = false;
            drop(loop_state);
            self.shared
                .signals
                .pause_requested
                .store(false, Ordering::SeqCst);
            if !acked {
                // Segment ended by itself before reaching the pause check.
                lock(&self.shared.core).resume_pending = true;
            }
        } else {
            // Segment already wound down (e.g. budget exhausted); there is
            // no in-flight generation to wait for.
            drop(loop_state);
            lock(&self.shared.core).resume_pending = true;
        }

        lock(&self.shared.state).transition(Action::Done);
        Ok(())
    }

    /// Set the irreversible force-stop flag and block until the in-flight
    /// run segment winds down at its next boundary. No resume afterwards.
    ///
    /// # Errors
    ///
    /// [`EngineError::WrongState`] unless the engine is `Running` or
    /// `Paused`.
    pub fn stop(&self) -> Result<(), EngineError> {
        self.enter("stop", Action::Stop)?;
        self.shared.signals.force_stop.store(true, Ordering::SeqCst);
        // A queued-but-unstarted segment still runs, sees the flag at its
        // first boundary check, and winds down immediately.
        self.shared.signals.task_cv.notify_all();

        let mut loop_state = lock(&self.shared.signals.loop_state);
        while loop_state.segment_active {
            loop_state = self
                .shared
                .signals
                .loop_cv
                .wait(loop_state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(loop_state);

        lock(&self.shared.state).transition(Action::Done);
        Ok(())
    }

    /// Capture a checkpoint. Available only while paused.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotPaused`] outside `Paused`; backend flush/aux
    /// errors otherwise.
    pub fn save(&self) -> Result<Checkpoint, EngineError> {
        if !lock(&self.shared.state).transition(Action::Save) {
            return Err(EngineError::NotPaused);
        }
        let snapshot = {
            let mut core = lock(&self.shared.core);
            let Core {
                backend, buffers, ..
            } = &mut *core;
            let buffers = buffers.as_mut().ok_or(EngineError::NotPrepared)?;
            backend.flush(buffers)?;
            let aux = backend.save_aux()?;
            Checkpoint {
                version: CHECKPOINT_VERSION,
                generation_index: core.generation_index,
                statistics: core.statistics.clone(),
                elapsed_ms: core.carried.as_millis() as u64,
                population: core.buffers.as_ref().map(|b| b.population).unwrap_or(0),
                genome_len: self.shared.config.genome_len,
                rng_seeds: core.buffers.as_ref().map(|b| b.rng_seeds.clone()).unwrap_or_default(),
                fitnesses: core.buffers.as_ref().map(|b| b.fitnesses.clone()).unwrap_or_default(),
                genomes: core.buffers.as_ref().map(|b| b.genomes.clone()).unwrap_or_default(),
                mutation_rate: core.mutation_rate,
                crossover_rate: core.crossover_rate,
                aux,
            }
        };
        lock(&self.shared.state).transition(Action::Done);
        Ok(snapshot)
    }

    /// Restore a checkpoint so the next `run` resumes identically.
    ///
    /// Legal from `Waiting` (the table row), and tolerated from
    /// `Prepared`/`Paused` where the restore body runs with the state
    /// left unchanged, mirroring how unmatched actions are no-ops.
    ///
    /// # Errors
    ///
    /// [`EngineError::WrongState`] from any other state; backend aux
    /// restore errors otherwise.
    pub fn restore(&self, snapshot: &Checkpoint) -> Result<(), EngineError> {
        {
            let mut sm = lock(&self.shared.state);
            match sm.current() {
                State::Waiting | State::Prepared | State::Paused => {
                    sm.transition(Action::Restore);
                }
                state => {
                    return Err(EngineError::WrongState {
                        op: "restore",
                        state,
                    })
                }
            }
        }
        {
            let mut core = lock(&self.shared.core);
            core.backend.restore_aux(&snapshot.aux)?;
            core.buffers = Some(snapshot.to_buffers());
            core.statistics = snapshot.statistics.clone();
            core.generation_index = snapshot.generation_index;
            core.carried = Duration::from_millis(snapshot.elapsed_ms);
            core.mutation_rate = snapshot.mutation_rate;
            core.crossover_rate = snapshot.crossover_rate;
            core.resume_pending = true;
            core.repopulate_next = false;
        }
        lock(&self.shared.state).transition(Action::Done);
        Ok(())
    }

    /// Snapshot of the statistics history.
    pub fn statistics(&self) -> StatisticsReport {
        lock(&self.shared.core).statistics.clone()
    }

    /// Genome and fitness of the extreme individual under the configured
    /// optimization direction.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotPrepared`] before buffers exist.
    pub fn best(&self) -> Result<(Vec<i32>, f32), EngineError> {
        let core = lock(&self.shared.core);
        let buffers = core.buffers.as_ref().ok_or(EngineError::NotPrepared)?;
        let (idx, fitness) = buffers.best_index(self.shared.config.direction);
        Ok((buffers.genome(idx).to_vec(), fitness))
    }

    /// Splice externally supplied elites over the current worst
    /// individuals. Serialized against the generation step by the
    /// population-buffer mutex: the splice waits for an in-flight
    /// generation and vice versa, so the buffer is never torn.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotPrepared`] before buffers exist; backend splice
    /// errors otherwise.
    pub fn splice_elites(&self, elites: &[PackedElite]) -> Result<(), EngineError> {
        let mut core = lock(&self.shared.core);
        let Core {
            backend, buffers, ..
        } = &mut *core;
        let buffers = buffers.as_mut().ok_or(EngineError::NotPrepared)?;
        backend.splice_elites(buffers, elites, self.shared.config.direction)?;
        Ok(())
    }

    /// Issue the named entry action, failing when it matches no row.
    fn enter(&self, op: &'static str, action: Action) -> Result<(), EngineError> {
        let mut sm = lock(&self.shared.state);
        if sm.transition(action) {
            Ok(())
        } else {
            Err(EngineError::WrongState {
                op,
                state: sm.current(),
            })
        }
    }
}

impl Drop for EvolutionEngine {
    fn drop(&mut self) {
        self.shared.signals.shutdown.store(true, Ordering::SeqCst);
        self.shared.signals.force_stop.store(true, Ordering::SeqCst);
        self.shared.signals.task_cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for EvolutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvolutionEngine")
            .field("state", &self.current_state())
            .finish()
    }
}

// ── Evolution thread ──────────────────────────────────────────────────────

/// Thread main: wait on the single-slot queue, run segments until the
/// engine shuts down.
fn evolution_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut slot = lock(&shared.signals.task);
            loop {
                if shared.signals.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(task) = slot.take() {
                    break task;
                }
                slot = shared
                    .signals
                    .task_cv
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        run_segment(&shared, &task);
    }
}

/// Why a run segment left its boundary loop.
enum SegmentEnd {
    Terminated,
    Paused,
    Stopped,
    Corrupted,
}

fn run_segment(shared: &Shared, task: &RunTask) {
    set_segment_active(shared, true);
    let segment_start = Instant::now();

    // Stop may already be in force for a segment queued just before it.
    if shared.signals.force_stop.load(Ordering::SeqCst) {
        finish_segment(shared, segment_start, SegmentEnd::Stopped);
        return;
    }

    // Generation 0, unless resuming from a pause or restore.
    let init = {
        let mut core = lock(&shared.core);
        if core.resume_pending {
            core.resume_pending = false;
            Ok(())
        } else {
            initial_population(&mut core)
        }
    };
    if let Err(e) = init {
        error!(error = %e, "initial population failed; abandoning run segment");
        finish_segment(shared, segment_start, SegmentEnd::Corrupted);
        notify_fault(shared, &e);
        return;
    }

    let end = boundary_loop(shared, task, segment_start);
    if let SegmentEnd::Corrupted = end {
        let err = BackendError::Corrupted("generation step".into());
        finish_segment(shared, segment_start, end);
        notify_fault(shared, &err);
        return;
    }
    finish_segment(shared, segment_start, end);
}

/// The per-generation boundary loop: check flags and budget, then run one
/// generation while holding the population-buffer mutex.
fn boundary_loop(shared: &Shared, task: &RunTask, segment_start: Instant) -> SegmentEnd {
    loop {
        if shared.signals.force_stop.load(Ordering::SeqCst) {
            flush_to_host(shared);
            return SegmentEnd::Stopped;
        }
        if shared.signals.pause_requested.load(Ordering::SeqCst) {
            flush_to_host(shared);
            {
                let mut core = lock(&shared.core);
                core.carried += segment_start.elapsed();
                core.resume_pending = true;
            }
            return SegmentEnd::Paused;
        }

        let exhausted = {
            let core = lock(&shared.core);
            match shared.config.termination {
                Termination::Count(n) => core.generation_index >= n,
                Termination::Time(budget) => segment_start.elapsed() + core.carried >= budget,
            }
        };
        if exhausted {
            flush_to_host(shared);
            return SegmentEnd::Terminated;
        }

        // One generation, serialized against the elite splice.
        let outcome = {
            let mut core = lock(&shared.core);
            step_generation(shared, &mut core, task)
        };
        match outcome {
            Ok((generation, stats, elites, early)) => {
                let hook = lock(&shared.generation_hook).clone();
                if let Some(hook) = hook {
                    hook(generation, stats, elites);
                }
                if early {
                    info!(generation, "backend reported early termination");
                    flush_to_host(shared);
                    return SegmentEnd::Terminated;
                }
            }
            Err(e @ BackendError::Corrupted(_)) => {
                error!(error = %e, "buffers corrupted; worker self-terminates");
                lock(&shared.core).corrupted = true;
                return SegmentEnd::Corrupted;
            }
            Err(e) => {
                // Buffers are still valid; log and keep evolving.
                warn!(error = %e, "generation step failed; continuing");
            }
        }
    }
}

/// One generation: crossover/mutation (or guard repopulation), fitness
/// evaluation, statistics, diversity check, elite packing.
#[allow(clippy::type_complexity)]
fn step_generation(
    shared: &Shared,
    core: &mut Core,
    task: &RunTask,
) -> Result<(u64, GenerationStats, Option<Vec<PackedElite>>, bool), BackendError> {
    let direction = shared.config.direction;
    let repopulate = core.repopulate_next;
    let Core {
        backend, buffers, ..
    } = core;
    let buffers = buffers
        .as_mut()
        .ok_or_else(|| BackendError::Corrupted("population buffers missing".into()))?;

    if repopulate {
        let guard_count = shared
            .config
            .diversity
            .map(|g| g.repopulate_count(buffers.population))
            .unwrap_or(0);
        info!(count = guard_count, "diversity collapse: partial repopulation");
        backend.populate_partial(buffers, guard_count)?;
    } else {
        backend.crossover(buffers, task.crossover_rate)?;
        backend.mutate(buffers, task.mutation_rate)?;
    }
    backend.evaluate_fitness(buffers)?;

    let stats = summarize(buffers, direction);
    let elites = match shared.config.elitism {
        Some(elitism) => Some(backend.pack_elites(buffers, elitism.top, direction)?),
        None => None,
    };
    let early = backend.early_terminated(buffers);

    let generation = core.generation_index;
    core.statistics.record(generation, stats);
    core.generation_index += 1;
    core.repopulate_next = shared
        .config
        .diversity
        .map(|g| g.tripped(stats.best, stats.worst, stats.avg))
        .unwrap_or(false);

    Ok((generation, stats, elites, early))
}

/// Compute best/worst/avg under the configured direction.
fn summarize(
    buffers: &PopulationBuffers,
    direction: crate::config::OptimizationDirection,
) -> GenerationStats {
    let mut best = buffers.fitnesses[0];
    let mut worst = buffers.fitnesses[0];
    let mut sum = 0.0f64;
    for &fitness in &buffers.fitnesses {
        if direction.is_better(fitness, best) {
            best = fitness;
        }
        if direction.is_better(worst, fitness) {
            worst = fitness;
        }
        sum += fitness as f64;
    }
    GenerationStats {
        best,
        worst,
        avg: (sum / buffers.population as f64) as f32,
    }
}

fn initial_population(core: &mut Core) -> Result<(), BackendError> {
    let Core {
        backend, buffers, ..
    } = core;
    let buffers = buffers
        .as_mut()
        .ok_or_else(|| BackendError::Corrupted("population buffers missing".into()))?;
    backend.populate(buffers)?;
    backend.evaluate_fitness(buffers)?;
    Ok(())
}

fn flush_to_host(shared: &Shared) {
    let mut core = lock(&shared.core);
    let Core {
        backend, buffers, ..
    } = &mut *core;
    if let Some(buffers) = buffers.as_mut() {
        if let Err(e) = backend.flush(buffers) {
            warn!(error = %e, "flush to host memory failed");
        }
    }
}

fn finish_segment(shared: &Shared, segment_start: Instant, end: SegmentEnd) {
    {
        let mut core = lock(&shared.core);
        core.elapsed += segment_start.elapsed();
        match end {
            SegmentEnd::Paused => {}
            _ => {
                // Segment really ended: publish the aggregate.
                let total = core.carried + segment_start.elapsed();
                let generations = core.statistics.len();
                if generations > 0 {
                    core.statistics.avg_time_per_generation =
                        Some(total.as_secs_f64() / generations as f64);
                }
                core.carried = Duration::ZERO;
            }
        }
    }

    let mut loop_state = lock(&shared.signals.loop_state);
    loop_state.segment_active = false;
    if matches!(end, SegmentEnd::Paused) {
        loop_state.pause_acked = true;
    }
    drop(loop_state);
    shared.signals.loop_cv.notify_all();
}

fn set_segment_active(shared: &Shared, active: bool) {
    let mut loop_state = lock(&shared.signals.loop_state);
    loop_state.segment_active = active;
    drop(loop_state);
    shared.signals.loop_cv.notify_all();
}

fn notify_fault(shared: &Shared, error: &BackendError) {
    let hook = lock(&shared.fault_hook).clone();
    if let Some(hook) = hook {
        hook(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;
    use crate::config::{GaConfig, OptimizationDirection, Termination};
    use std::time::Duration;

    fn config(generations: u64) -> GaConfig {
        GaConfig {
            population: 20,
            genome_len: 6,
            direction: OptimizationDirection::Maximize,
            termination: Termination::Count(generations),
            mutation_rate: 0.1,
            crossover_rate: 0.8,
            elitism: None,
            diversity: None,
            seed: Some(99),
        }
    }

    fn engine(generations: u64) -> EvolutionEngine {
        EvolutionEngine::new(config(generations), Box::new(StubBackend::new())).unwrap()
    }

    fn run_to_completion(engine: &EvolutionEngine, generations: u64) {
        engine.run(0.1, 0.8).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.statistics().len() < generations as usize {
            assert!(Instant::now() < deadline, "run did not finish in time");
            std::thread::sleep(Duration::from_millis(5));
        }
        // The aggregate appears once the segment winds down.
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.statistics().avg_time_per_generation.is_none() {
            assert!(Instant::now() < deadline, "aggregate never published");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn run_rejects_out_of_range_rates() {
        let engine = engine(5);
        engine.prepare().unwrap();
        assert!(engine.run(0.0, 0.8).is_err());
        assert!(engine.run(0.1, 1.0).is_err());
        assert!(engine.run(-0.5, 0.8).is_err());
        // Engine is still runnable after parameter errors.
        assert_eq!(engine.current_state(), State::Prepared);
    }

    #[test]
    fn prepare_is_callable_once_from_waiting() {
        let engine = engine(5);
        engine.prepare().unwrap();
        assert_eq!(engine.current_state(), State::Prepared);
        assert!(matches!(
            engine.prepare(),
            Err(EngineError::WrongState { op: "prepare", .. })
        ));
    }

    #[test]
    fn count_termination_records_exact_history() {
        let engine = engine(10);
        engine.prepare().unwrap();
        run_to_completion(&engine, 10);

        let report = engine.statistics();
        assert_eq!(report.len(), 10);
        let keys: Vec<u64> = report.generations.keys().copied().collect();
        assert_eq!(keys, (0..10).collect::<Vec<u64>>());
        assert!(report.avg_time_per_generation.is_some());
    }

    #[test]
    fn save_requires_paused() {
        let engine = engine(5);
        engine.prepare().unwrap();
        assert!(matches!(engine.save(), Err(EngineError::NotPaused)));
    }

    #[test]
    fn stop_is_irreversible() {
        let engine = engine(1000);
        engine.prepare().unwrap();
        engine.run(0.1, 0.8).unwrap();
        engine.stop().unwrap();
        assert_eq!(engine.current_state(), State::Stopped);
        assert!(matches!(
            engine.run(0.1, 0.8),
            Err(EngineError::WrongState { op: "run", .. })
        ));
    }

    #[test]
    fn pause_straight_after_run_always_returns() {
        // A one-generation segment can start and finish in the gap
        // between run() returning and pause() arriving; pause must still
        // come back instead of waiting on a segment that already ended.
        for _ in 0..20 {
            let engine = Arc::new(engine(1));
            engine.prepare().unwrap();
            engine.run(0.1, 0.8).unwrap();

            let done = Arc::new(AtomicBool::new(false));
            let pauser = {
                let engine = engine.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    engine.pause().unwrap();
                    done.store(true, Ordering::SeqCst);
                })
            };
            let deadline = Instant::now() + Duration::from_secs(5);
            while !done.load(Ordering::SeqCst) {
                assert!(Instant::now() < deadline, "pause hung after run");
                std::thread::sleep(Duration::from_millis(2));
            }
            pauser.join().unwrap();
            assert_eq!(engine.current_state(), State::Paused);
        }
    }

    #[test]
    fn best_respects_direction() {
        let cfg = GaConfig {
            direction: OptimizationDirection::Minimize,
            ..config(3)
        };
        let engine = EvolutionEngine::new(cfg, Box::new(StubBackend::new())).unwrap();
        engine.prepare().unwrap();
        run_to_completion(&engine, 3);
        let (_genome, fitness) = engine.best().unwrap();
        let report = engine.statistics();
        let (_, last) = report.latest().unwrap();
        assert!(fitness <= last.avg);
    }
}
