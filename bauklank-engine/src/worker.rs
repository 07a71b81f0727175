//! Engine worker thread.
//!
//! One thread per slot owns the active engine. The scheduler pushes
//! configure and schedule commands through a bounded channel and never waits
//! on the engine; a full queue drops the command. Loads, unloads and shutdown
//! travel on a separate unbounded lifecycle channel so they are never lost,
//! and the worker drains it before every queued command. The worker publishes
//! the engine's output clock after every message and on an idle tick, so lead
//! times are computed from a recent reading without a round trip.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, Receiver, Sender, TrySendError};
use log::{debug, info, trace, warn};

use bauklank_types::SlotId;

use crate::controls::ConfigValues;
use crate::engine::{EngineParam, ParamValue, Schedule, TimeStretchEngine};
use crate::error::EngineResult;

/// Queue capacity between a scheduler and its worker.
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// How often an idle worker republishes the output clock.
const CLOCK_TICK: Duration = Duration::from_millis(5);

/// Work for the engine of one generation.
pub enum EngineCommand {
    /// Retire the current engine and install this one, primed with the full
    /// slot state.
    Load {
        engine: Box<dyn TimeStretchEngine>,
        config: ConfigValues,
        state: Vec<(EngineParam, ParamValue)>,
    },
    /// Retire the current engine without a replacement.
    Unload,
    Configure(ConfigValues),
    Schedule(Schedule),
}

impl EngineCommand {
    fn name(&self) -> &'static str {
        match self {
            EngineCommand::Load { .. } => "load",
            EngineCommand::Unload => "unload",
            EngineCommand::Configure(_) => "configure",
            EngineCommand::Schedule(_) => "schedule",
        }
    }

    fn is_lifecycle(&self) -> bool {
        matches!(self, EngineCommand::Load { .. } | EngineCommand::Unload)
    }
}

enum WorkerMessage {
    Command { generation: u64, command: EngineCommand },
    Barrier(Sender<()>),
    Shutdown,
}

#[derive(Default)]
struct WorkerCounters {
    dropped: AtomicU64,
    stale: AtomicU64,
}

/// Handle to a slot's engine thread.
pub struct EngineWorker {
    slot: SlotId,
    tx: Sender<WorkerMessage>,
    lifecycle_tx: Sender<WorkerMessage>,
    clock: Arc<AtomicU64>,
    counters: Arc<WorkerCounters>,
    handle: Option<JoinHandle<()>>,
}

impl EngineWorker {
    pub fn spawn(slot: SlotId) -> EngineResult<Self> {
        Self::with_capacity(slot, COMMAND_QUEUE_CAPACITY)
    }

    pub fn with_capacity(slot: SlotId, capacity: usize) -> EngineResult<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<WorkerMessage>(capacity.max(1));
        let (lifecycle_tx, lifecycle_rx) = crossbeam_channel::unbounded::<WorkerMessage>();
        let clock = Arc::new(AtomicU64::new(0f64.to_bits()));
        let counters = Arc::new(WorkerCounters::default());

        let thread_clock = Arc::clone(&clock);
        let thread_counters = Arc::clone(&counters);
        let handle = thread::Builder::new()
            .name(format!("engine-{}", slot))
            .spawn(move || worker_loop(slot, rx, lifecycle_rx, thread_clock, thread_counters))?;

        Ok(Self {
            slot,
            tx,
            lifecycle_tx,
            clock,
            counters,
            handle: Some(handle),
        })
    }

    /// Queue a command for `generation`. Returns `false` if it was dropped.
    /// Loads and unloads are only refused once the worker has exited.
    pub fn submit(&self, generation: u64, command: EngineCommand) -> bool {
        let name = command.name();
        let lifecycle = command.is_lifecycle();
        let message = WorkerMessage::Command { generation, command };
        if lifecycle {
            if self.lifecycle_tx.send(message).is_err() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target: "engine", "Slot {}: engine worker gone, dropped {}", self.slot, name);
                return false;
            }
            return true;
        }
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target: "engine", "Slot {}: engine queue full, dropped {}", self.slot, name);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Last published output time of the active engine, in seconds.
    pub fn output_time(&self) -> f64 {
        f64::from_bits(self.clock.load(Ordering::Acquire))
    }

    /// Wait until every command queued before this call has been handled.
    pub fn barrier(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.tx.send_timeout(WorkerMessage::Barrier(ack_tx), timeout).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }

    /// Commands dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Commands discarded for belonging to a retired generation.
    pub fn stale(&self) -> u64 {
        self.counters.stale.load(Ordering::Relaxed)
    }

    /// Retire the active engine and stop the thread.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.lifecycle_tx.send(WorkerMessage::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn retire(slot: SlotId, engine: Option<Box<dyn TimeStretchEngine>>) {
    if let Some(mut engine) = engine {
        engine.stop();
        engine.disconnect();
        debug!(target: "engine", "Slot {}: engine retired", slot);
    }
}

/// What the worker thread owns.
struct WorkerState {
    slot: SlotId,
    engine: Option<Box<dyn TimeStretchEngine>>,
    current: u64,
    counters: Arc<WorkerCounters>,
    clock: Arc<AtomicU64>,
}

impl WorkerState {
    /// Handle one message. Returns `false` once the worker should exit.
    fn handle(&mut self, message: WorkerMessage) -> bool {
        let slot = self.slot;
        match message {
            WorkerMessage::Command { generation, command } => self.command(generation, command),
            WorkerMessage::Barrier(ack) => {
                self.publish();
                let _ = ack.send(());
            }
            WorkerMessage::Shutdown => {
                retire(slot, self.engine.take());
                return false;
            }
        }
        true
    }

    fn publish(&self) {
        let time = self.engine.as_ref().map(|e| e.current_time()).unwrap_or(0.0);
        self.clock.store(time.to_bits(), Ordering::Release);
    }

    fn command(&mut self, generation: u64, command: EngineCommand) {
        let slot = self.slot;
        match command {
            EngineCommand::Load { .. } | EngineCommand::Unload if generation <= self.current => {
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
                debug!(target: "engine", "Slot {}: ignored {} for generation {}", slot, command.name(), generation);
            }
            EngineCommand::Load {
                engine: mut next,
                config,
                state,
            } => {
                retire(slot, self.engine.take());
                self.current = generation;
                if let Err(e) = next.configure(&config) {
                    warn!(target: "engine", "Slot {}: configure failed: {}", slot, e);
                }
                let time = next.current_time();
                for (param, value) in state {
                    if let Err(e) = next.schedule(&Schedule::At { param, value, time }) {
                        warn!(target: "engine", "Slot {}: initial {:?} failed: {}", slot, param, e);
                    }
                }
                info!(target: "engine", "Slot {}: engine generation {} active", slot, generation);
                self.engine = Some(next);
            }
            EngineCommand::Unload => {
                retire(slot, self.engine.take());
                self.current = generation;
            }
            command if generation != self.current => {
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
                trace!(target: "engine", "Slot {}: stale {} from generation {}", slot, command.name(), generation);
            }
            EngineCommand::Configure(config) => {
                if let Some(engine) = self.engine.as_mut() {
                    if let Err(e) = engine.configure(&config) {
                        warn!(target: "engine", "Slot {}: configure failed: {}", slot, e);
                    }
                }
            }
            EngineCommand::Schedule(schedule) => {
                if let Some(engine) = self.engine.as_mut() {
                    if let Err(e) = engine.schedule(&schedule) {
                        warn!(target: "engine", "Slot {}: schedule {:?} failed: {}", slot, schedule.param(), e);
                    }
                }
            }
        }
    }
}

fn worker_loop(
    slot: SlotId,
    rx: Receiver<WorkerMessage>,
    lifecycle: Receiver<WorkerMessage>,
    clock: Arc<AtomicU64>,
    counters: Arc<WorkerCounters>,
) {
    let mut state = WorkerState {
        slot,
        engine: None,
        current: 0,
        counters,
        clock,
    };

    loop {
        let running = select! {
            recv(lifecycle) -> message => match message {
                Ok(message) => state.handle(message),
                Err(_) => false,
            },
            recv(rx) -> message => match message {
                // A load or unload sent before this command must land first.
                Ok(message) => drain_lifecycle(&mut state, &lifecycle) && state.handle(message),
                Err(_) => false,
            },
            default(CLOCK_TICK) => true,
        };
        if !running {
            retire(slot, state.engine.take());
            return;
        }
        state.publish();
    }
}

fn drain_lifecycle(state: &mut WorkerState, lifecycle: &Receiver<WorkerMessage>) -> bool {
    while let Ok(message) = lifecycle.try_recv() {
        if !state.handle(message) {
            return false;
        }
    }
    true
}
