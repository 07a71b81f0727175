//! Per-slot engine scheduler.
//!
//! Turns hub `set` messages into engine schedules. Volume and pan glide over
//! a short ramp from whatever is sounding; every other control lands a fixed
//! lead time ahead of the engine's output clock. Pipeline config changes are
//! coalesced and pushed once the burst settles.

use std::time::{Duration, Instant};

use log::{debug, info, trace};
use serde_json::Value;

use bauklank_types::SlotId;

use crate::controls::{ConfigValues, ControlCommand, ControlValues};
use crate::engine::{EngineParam, ParamValue, Schedule, TimeStretchEngine};
use crate::error::{ControlError, EngineResult};
use crate::persistence::{ControlStore, NoopStore, StoredControls};
use crate::worker::{EngineCommand, EngineWorker};

/// Length of the volume and pan ramps, in seconds.
pub const RAMP_SECS: f64 = 0.030;

/// How far ahead of the output clock step changes are scheduled, in seconds.
pub const LEAD_SECS: f64 = 0.100;

/// Quiet period before accumulated config changes are pushed.
pub const CONFIG_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq)]
struct Ramp {
    from: f64,
    to: f64,
    start: f64,
    end: f64,
}

impl Ramp {
    fn over(from: f64, to: f64, t: f64) -> Self {
        Self {
            from,
            to,
            start: t,
            end: t + RAMP_SECS,
        }
    }

    fn hold(value: f64, t: f64) -> Self {
        Self {
            from: value,
            to: value,
            start: t,
            end: t,
        }
    }

    fn schedule(&self, param: EngineParam) -> Schedule {
        Schedule::Ramp {
            param,
            from: self.from,
            to: self.to,
            start_time: self.start,
            end_time: self.end,
        }
    }

    fn value_at(&self, t: f64) -> f64 {
        if t >= self.end {
            self.to
        } else if t <= self.start {
            self.from
        } else {
            self.from + (self.to - self.from) * (t - self.start) / (self.end - self.start)
        }
    }
}

pub struct EngineScheduler {
    slot: SlotId,
    controls: ControlValues,
    config: ConfigValues,
    /// Loaded source length in seconds.
    duration: f64,
    /// Bumped on every load and unload.
    generation: u64,
    loaded: bool,
    volume_ramp: Option<Ramp>,
    pan_ramp: Option<Ramp>,
    config_due: Option<Instant>,
    worker: EngineWorker,
    store: Box<dyn ControlStore>,
}

impl EngineScheduler {
    pub fn new(slot: SlotId) -> EngineResult<Self> {
        Self::with_store(slot, Box::new(NoopStore))
    }

    pub fn with_store(slot: SlotId, store: Box<dyn ControlStore>) -> EngineResult<Self> {
        Self::with_worker(slot, EngineWorker::spawn(slot)?, store)
    }

    pub fn with_worker(slot: SlotId, worker: EngineWorker, store: Box<dyn ControlStore>) -> EngineResult<Self> {
        let stored = store.load(slot).unwrap_or_default();
        Ok(Self {
            slot,
            controls: stored.controls.sanitized(),
            config: stored.config.sanitized(),
            duration: 0.0,
            generation: 0,
            loaded: false,
            volume_ramp: None,
            pan_ramp: None,
            config_due: None,
            worker,
            store,
        })
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn controls(&self) -> &ControlValues {
        &self.controls
    }

    pub fn config(&self) -> &ConfigValues {
        &self.config
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn worker(&self) -> &EngineWorker {
        &self.worker
    }

    /// Whether a config push is waiting out its debounce.
    pub fn config_pending(&self) -> bool {
        self.config_due.is_some()
    }

    /// Apply one incoming `set`. Returns whether state changed. Errors leave
    /// state untouched; callers log and move on.
    pub fn apply_incoming_set(&mut self, key: &str, value: &Value, now: Instant) -> Result<bool, ControlError> {
        let command = ControlCommand::parse(key, value)?;

        if command.is_config() {
            if !self.config.apply(&command) {
                return Ok(false);
            }
            // Trailing debounce: every change pushes the deadline out.
            self.config_due = Some(now + CONFIG_DEBOUNCE);
            self.persist();
            return Ok(true);
        }

        let t = self.worker.output_time();
        let sounding_volume = self.sounding(EngineParam::Volume, t);
        let sounding_pan = self.sounding(EngineParam::Pan, t);

        let Some(param) = self.controls.apply(&command, self.duration) else {
            return Ok(false);
        };
        let ramp = match param {
            EngineParam::Volume => Some(Ramp::over(sounding_volume, self.controls.volume, t)),
            EngineParam::Pan => Some(Ramp::over(sounding_pan, self.controls.pan, t)),
            _ => None,
        };
        let schedule = match ramp {
            Some(ramp) => ramp.schedule(param),
            None => Schedule::At {
                param,
                value: self.controls.param_value(param),
                time: t + LEAD_SECS,
            },
        };
        trace!(target: "engine", "Slot {}: {} -> {:?}", self.slot, key, schedule);
        let accepted = self.submit(EngineCommand::Schedule(schedule));
        if let Some(ramp) = ramp {
            self.track_ramp(param, ramp, accepted);
        }
        self.persist();
        Ok(true)
    }

    /// Value of a ramped parameter at output time `t`.
    fn sounding(&self, param: EngineParam, t: f64) -> f64 {
        let (ramp, stored) = match param {
            EngineParam::Volume => (self.volume_ramp, self.controls.volume),
            _ => (self.pan_ramp, self.controls.pan),
        };
        ramp.map(|r| r.value_at(t)).unwrap_or(stored)
    }

    /// Remember what the engine is doing with a ramped parameter. A dropped
    /// ramp leaves the engine where it was, so the previous ramp (or the
    /// value it started from) keeps describing what sounds.
    fn track_ramp(&mut self, param: EngineParam, ramp: Ramp, accepted: bool) {
        let tracked = match param {
            EngineParam::Volume => &mut self.volume_ramp,
            _ => &mut self.pan_ramp,
        };
        if accepted {
            *tracked = Some(ramp);
        } else if self.loaded && tracked.is_none() {
            *tracked = Some(Ramp::hold(ramp.from, ramp.start));
        }
    }

    /// Push the coalesced config once its debounce has elapsed. Returns
    /// whether a configure was sent.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.config_due {
            Some(due) if now >= due => {
                self.config_due = None;
                debug!(target: "engine", "Slot {}: reconfigure {:?}", self.slot, self.config);
                self.submit(EngineCommand::Configure(self.config.clone()))
            }
            _ => false,
        }
    }

    /// Replace the engine with one playing a new source of `duration`
    /// seconds. The previous engine is stopped and disconnected by the worker
    /// before the new one receives the full slot state.
    pub fn load_source(&mut self, engine: Box<dyn TimeStretchEngine>, duration: f64) -> bool {
        self.generation += 1;
        self.loaded = true;
        self.duration = if duration.is_finite() { duration.max(0.0) } else { 0.0 };
        // A collapsed loop covers the whole source.
        if self.controls.loop_end <= self.controls.loop_start {
            self.controls.loop_start = 0.0;
            self.controls.loop_end = self.duration;
        }
        self.controls.clamp_loop(self.duration);
        self.volume_ramp = None;
        self.pan_ramp = None;
        self.config_due = None;

        info!(
            target: "engine",
            "Slot {}: loading source ({:.2}s) as generation {}",
            self.slot,
            self.duration,
            self.generation
        );
        self.worker.submit(
            self.generation,
            EngineCommand::Load {
                engine,
                config: self.config.clone(),
                state: self.controls.engine_state(),
            },
        )
    }

    /// Retire the engine without a replacement.
    pub fn unload(&mut self) -> bool {
        if !self.loaded {
            return false;
        }
        self.generation += 1;
        self.loaded = false;
        self.worker.submit(self.generation, EngineCommand::Unload)
    }

    /// The source length changed; keep the loop inside it.
    pub fn set_duration(&mut self, duration: f64) {
        self.duration = if duration.is_finite() { duration.max(0.0) } else { 0.0 };
        if self.controls.clamp_loop(self.duration) {
            let schedule = Schedule::At {
                param: EngineParam::Loop,
                value: ParamValue::Region {
                    start: self.controls.loop_start,
                    end: self.controls.loop_end,
                },
                time: self.worker.output_time() + LEAD_SECS,
            };
            self.submit(EngineCommand::Schedule(schedule));
            self.persist();
        }
    }

    fn submit(&self, command: EngineCommand) -> bool {
        if !self.loaded {
            return false;
        }
        self.worker.submit(self.generation, command)
    }

    fn persist(&self) {
        self.store.save(
            self.slot,
            &StoredControls {
                controls: self.controls.clone(),
                config: self.config.clone(),
            },
        );
    }
}
