//! Time-stretch engine contract.
//!
//! `TimeStretchEngine` is what the scheduler needs from an audio engine: a
//! clock, a pipeline configuration call, and future-timestamped parameter
//! changes. The rendering algorithm lives behind it. `NullEngine` keeps time
//! and does nothing else; `TestEngine` records every call for assertions.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::trace;

use crate::controls::ConfigValues;
use crate::error::{EngineError, EngineResult};

/// Parameters the engine accepts schedules for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineParam {
    Volume,
    Pan,
    Active,
    Rate,
    Semitones,
    TonalityHz,
    FormantSemitones,
    FormantCompensation,
    FormantBaseHz,
    Loop,
}

impl EngineParam {
    pub const ALL: [EngineParam; 10] = [
        EngineParam::Volume,
        EngineParam::Pan,
        EngineParam::Active,
        EngineParam::Rate,
        EngineParam::Semitones,
        EngineParam::TonalityHz,
        EngineParam::FormantSemitones,
        EngineParam::FormantCompensation,
        EngineParam::FormantBaseHz,
        EngineParam::Loop,
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Scalar(f64),
    Flag(bool),
    Region { start: f64, end: f64 },
}

/// A parameter change on the engine's output timeline (seconds).
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// Linear ramp of a scalar parameter.
    Ramp {
        param: EngineParam,
        from: f64,
        to: f64,
        start_time: f64,
        end_time: f64,
    },
    /// Step change at `time`.
    At {
        param: EngineParam,
        value: ParamValue,
        time: f64,
    },
}

impl Schedule {
    pub fn param(&self) -> EngineParam {
        match self {
            Schedule::Ramp { param, .. } | Schedule::At { param, .. } => *param,
        }
    }
}

/// An audio engine driven by timestamped schedules.
///
/// Calls never block on audio processing. Times are on the engine's own
/// output clock as reported by `current_time`.
pub trait TimeStretchEngine: Send {
    /// Output clock in seconds.
    fn current_time(&self) -> f64;

    /// Rebuild the block pipeline.
    fn configure(&mut self, config: &ConfigValues) -> EngineResult;

    fn schedule(&mut self, schedule: &Schedule) -> EngineResult;

    /// Stop rendering. Further schedules are ignored.
    fn stop(&mut self);

    /// Release the output. The engine is not used again.
    fn disconnect(&mut self);
}

/// An engine that only keeps time.
pub struct NullEngine {
    started: Instant,
    stopped: bool,
    disconnected: bool,
}

impl NullEngine {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            stopped: false,
            disconnected: false,
        }
    }
}

impl Default for NullEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeStretchEngine for NullEngine {
    fn current_time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn configure(&mut self, config: &ConfigValues) -> EngineResult {
        if self.disconnected {
            return Err(EngineError::Disconnected);
        }
        trace!(target: "engine", "null engine configure {:?}", config);
        Ok(())
    }

    fn schedule(&mut self, schedule: &Schedule) -> EngineResult {
        if self.disconnected {
            return Err(EngineError::Disconnected);
        }
        if !self.stopped {
            trace!(target: "engine", "null engine schedule {:?}", schedule);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn disconnect(&mut self) {
        self.disconnected = true;
    }
}

/// An operation recorded by `TestEngine` for assertion in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOp {
    Configure(ConfigValues),
    Schedule(Schedule),
    Stop,
    Disconnect,
}

#[derive(Default)]
struct TestEngineState {
    ops: Vec<EngineOp>,
    time: f64,
    delay: Duration,
}

/// Recording engine for testing scheduling without audio output.
///
/// Clones share their state, so a test keeps one handle while the engine
/// worker owns another.
#[derive(Clone, Default)]
pub struct TestEngine {
    state: Arc<Mutex<TestEngineState>>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TestEngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return all recorded operations.
    pub fn operations(&self) -> Vec<EngineOp> {
        self.lock().ops.clone()
    }

    pub fn clear(&self) {
        self.lock().ops.clear();
    }

    /// Count operations matching a predicate.
    pub fn count<F: Fn(&EngineOp) -> bool>(&self, f: F) -> usize {
        self.lock().ops.iter().filter(|op| f(op)).count()
    }

    /// All recorded schedules, in call order.
    pub fn schedules(&self) -> Vec<Schedule> {
        self.lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                EngineOp::Schedule(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn configures(&self) -> Vec<ConfigValues> {
        self.lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                EngineOp::Configure(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Set the reported output clock.
    pub fn set_time(&self, time: f64) {
        self.lock().time = time;
    }

    /// Make every schedule call take this long.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }
}

impl TimeStretchEngine for TestEngine {
    fn current_time(&self) -> f64 {
        self.lock().time
    }

    fn configure(&mut self, config: &ConfigValues) -> EngineResult {
        self.lock().ops.push(EngineOp::Configure(config.clone()));
        Ok(())
    }

    fn schedule(&mut self, schedule: &Schedule) -> EngineResult {
        let delay = {
            let mut state = self.lock();
            state.ops.push(EngineOp::Schedule(schedule.clone()));
            state.delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.lock().ops.push(EngineOp::Stop);
    }

    fn disconnect(&mut self) {
        self.lock().ops.push(EngineOp::Disconnect);
    }
}
