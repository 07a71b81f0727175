//! Per-slot control and config values, and the closed set of keys a hub
//! `set` may carry.
//!
//! Every accepted key is a [`ControlCommand`] variant. Parsing converts units
//! and clamps into range, so a command that parses is always storable.
//! Loop bounds are the exception: they depend on the loaded source's duration
//! and are clamped when stored.

use serde_json::Value;

use crate::engine::{EngineParam, ParamValue};
use crate::error::ControlError;

pub const VOLUME_RANGE: (f64, f64) = (0.0, 1.0);
pub const PAN_RANGE: (f64, f64) = (-1.0, 1.0);
pub const RATE_RANGE: (f64, f64) = (0.00001, 2.0);
pub const TONE_RANGE: (f64, f64) = (-24.0, 24.0);
pub const SEMITONES_RANGE: (f64, f64) = (-48.0, 48.0);
pub const TONALITY_HZ_RANGE: (f64, f64) = (20.0, 22050.0);
pub const FORMANT_SEMITONES_RANGE: (f64, f64) = (-48.0, 48.0);
pub const FORMANT_BASE_HZ_RANGE: (f64, f64) = (20.0, 2000.0);
pub const BLOCK_MS_RANGE: (f64, f64) = (10.0, 500.0);
pub const OVERLAP_RANGE: (f64, f64) = (1.0, 8.0);

fn clamp(v: f64, range: (f64, f64)) -> f64 {
    v.clamp(range.0, range.1)
}

/// Live parameters of one engine slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlValues {
    pub volume: f64,
    pub pan: f64,
    pub active: bool,
    pub rate: f64,
    pub semitones: i32,
    pub tonality_hz: f64,
    pub formant_semitones: f64,
    pub formant_compensation: bool,
    pub formant_base_hz: f64,
    /// Seconds into the source. Always `0 <= loop_start <= loop_end <= duration`.
    pub loop_start: f64,
    pub loop_end: f64,
}

impl Default for ControlValues {
    fn default() -> Self {
        Self {
            volume: 1.0,
            pan: 0.0,
            active: true,
            rate: 1.0,
            semitones: 0,
            tonality_hz: 8000.0,
            formant_semitones: 0.0,
            formant_compensation: false,
            formant_base_hz: 100.0,
            loop_start: 0.0,
            loop_end: 0.0,
        }
    }
}

/// Settings that force the engine to rebuild its block pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValues {
    pub block_ms: u32,
    pub overlap: u32,
    pub split_computation: bool,
}

impl Default for ConfigValues {
    fn default() -> Self {
        Self {
            block_ms: 120,
            overlap: 4,
            split_computation: false,
        }
    }
}

/// A validated control change.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Volume(f64),
    Pan(f64),
    Active(bool),
    Rate(f64),
    Semitones(i32),
    TonalityHz(f64),
    FormantSemitones(f64),
    FormantCompensation(bool),
    FormantBaseHz(f64),
    LoopStart(f64),
    LoopEnd(f64),
    BlockMs(u32),
    Overlap(u32),
    SplitComputation(bool),
}

impl ControlCommand {
    /// Interpret a hub `set`. Unknown keys and values that are not finite
    /// numbers are errors; out of range numbers are clamped.
    pub fn parse(key: &str, value: &Value) -> Result<Self, ControlError> {
        let number = || {
            as_number(value)
                .filter(|v| v.is_finite())
                .ok_or_else(|| ControlError::NotFinite {
                    key: key.to_string(),
                    value: value.clone(),
                })
        };
        use ControlCommand::*;
        let command = match key {
            "volumePercent" => Volume(clamp(number()? / 100.0, VOLUME_RANGE)),
            "volume" => {
                let v = number()?;
                if (VOLUME_RANGE.0..=VOLUME_RANGE.1).contains(&v) {
                    Volume(v)
                } else {
                    Volume(clamp(v / 100.0, VOLUME_RANGE))
                }
            }
            "pan" => {
                let v = number()?;
                if v > 1.0 && v <= 100.0 {
                    Pan(v / 50.0 - 1.0)
                } else {
                    Pan(clamp(v, PAN_RANGE))
                }
            }
            "panPercent" => Pan(clamp(number()? / 50.0 - 1.0, PAN_RANGE)),
            "tone" => Semitones(clamp(number()?.round(), TONE_RANGE) as i32),
            "semitones" => Semitones(clamp(number()?.round(), SEMITONES_RANGE) as i32),
            "rate" => Rate(clamp(number()?, RATE_RANGE)),
            "tonalityHz" => TonalityHz(clamp(number()?, TONALITY_HZ_RANGE)),
            "formantSemitones" => FormantSemitones(clamp(number()?, FORMANT_SEMITONES_RANGE)),
            "formantBaseHz" => FormantBaseHz(clamp(number()?, FORMANT_BASE_HZ_RANGE)),
            "formantCompensation" => FormantCompensation(truthy(value)),
            "active" => Active(truthy(value)),
            "loopStart" => LoopStart(number()?),
            "loopEnd" => LoopEnd(number()?),
            "blockMs" => BlockMs(clamp(number()?.round(), BLOCK_MS_RANGE) as u32),
            "overlap" => Overlap(clamp(number()?.round(), OVERLAP_RANGE) as u32),
            "splitComputation" => SplitComputation(truthy(value)),
            _ => return Err(ControlError::UnknownKey(key.to_string())),
        };
        Ok(command)
    }

    /// Config commands are debounced instead of scheduled.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ControlCommand::BlockMs(_) | ControlCommand::Overlap(_) | ControlCommand::SplitComputation(_)
        )
    }
}

/// Numeric reading of a JSON value. Strings are parsed, booleans count as 0/1.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// JavaScript truthiness.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0 && !v.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn update<T: PartialEq>(field: &mut T, value: T) -> bool {
    if *field == value {
        false
    } else {
        *field = value;
        true
    }
}

impl ControlValues {
    /// Store a control command. Returns the engine parameter that changed,
    /// `None` when the value was already current or the command is config.
    pub fn apply(&mut self, command: &ControlCommand, duration: f64) -> Option<EngineParam> {
        use ControlCommand::*;
        let (changed, param) = match *command {
            Volume(v) => (update(&mut self.volume, v), EngineParam::Volume),
            Pan(v) => (update(&mut self.pan, v), EngineParam::Pan),
            Active(v) => (update(&mut self.active, v), EngineParam::Active),
            Rate(v) => (update(&mut self.rate, v), EngineParam::Rate),
            Semitones(v) => (update(&mut self.semitones, v), EngineParam::Semitones),
            TonalityHz(v) => (update(&mut self.tonality_hz, v), EngineParam::TonalityHz),
            FormantSemitones(v) => (
                update(&mut self.formant_semitones, v),
                EngineParam::FormantSemitones,
            ),
            FormantCompensation(v) => (
                update(&mut self.formant_compensation, v),
                EngineParam::FormantCompensation,
            ),
            FormantBaseHz(v) => (update(&mut self.formant_base_hz, v), EngineParam::FormantBaseHz),
            LoopStart(v) => (self.set_loop(v, self.loop_end, duration), EngineParam::Loop),
            LoopEnd(v) => (self.set_loop(self.loop_start, v, duration), EngineParam::Loop),
            BlockMs(_) | Overlap(_) | SplitComputation(_) => return None,
        };
        changed.then_some(param)
    }

    /// Re-fit the loop into `[0, duration]`. Returns whether it moved.
    pub fn clamp_loop(&mut self, duration: f64) -> bool {
        self.set_loop(self.loop_start, self.loop_end, duration)
    }

    fn set_loop(&mut self, start: f64, end: f64, duration: f64) -> bool {
        let limit = if duration.is_finite() { duration.max(0.0) } else { 0.0 };
        let mut start = start.clamp(0.0, limit);
        let mut end = end.clamp(0.0, limit);
        if start > end {
            std::mem::swap(&mut start, &mut end);
        }
        let changed = start != self.loop_start || end != self.loop_end;
        self.loop_start = start;
        self.loop_end = end;
        changed
    }

    /// Force every value into its range, e.g. after loading stored state.
    pub fn sanitized(mut self) -> Self {
        let finite_or = |v: f64, d: f64| if v.is_finite() { v } else { d };
        let d = ControlValues::default();
        self.volume = clamp(finite_or(self.volume, d.volume), VOLUME_RANGE);
        self.pan = clamp(finite_or(self.pan, d.pan), PAN_RANGE);
        self.rate = clamp(finite_or(self.rate, d.rate), RATE_RANGE);
        self.semitones = self
            .semitones
            .clamp(SEMITONES_RANGE.0 as i32, SEMITONES_RANGE.1 as i32);
        self.tonality_hz = clamp(finite_or(self.tonality_hz, d.tonality_hz), TONALITY_HZ_RANGE);
        self.formant_semitones = clamp(
            finite_or(self.formant_semitones, d.formant_semitones),
            FORMANT_SEMITONES_RANGE,
        );
        self.formant_base_hz = clamp(
            finite_or(self.formant_base_hz, d.formant_base_hz),
            FORMANT_BASE_HZ_RANGE,
        );
        self.loop_start = finite_or(self.loop_start, 0.0).max(0.0);
        self.loop_end = finite_or(self.loop_end, 0.0).max(0.0);
        if self.loop_start > self.loop_end {
            std::mem::swap(&mut self.loop_start, &mut self.loop_end);
        }
        self
    }

    pub fn param_value(&self, param: EngineParam) -> ParamValue {
        match param {
            EngineParam::Volume => ParamValue::Scalar(self.volume),
            EngineParam::Pan => ParamValue::Scalar(self.pan),
            EngineParam::Active => ParamValue::Flag(self.active),
            EngineParam::Rate => ParamValue::Scalar(self.rate),
            EngineParam::Semitones => ParamValue::Scalar(self.semitones as f64),
            EngineParam::TonalityHz => ParamValue::Scalar(self.tonality_hz),
            EngineParam::FormantSemitones => ParamValue::Scalar(self.formant_semitones),
            EngineParam::FormantCompensation => ParamValue::Flag(self.formant_compensation),
            EngineParam::FormantBaseHz => ParamValue::Scalar(self.formant_base_hz),
            EngineParam::Loop => ParamValue::Region {
                start: self.loop_start,
                end: self.loop_end,
            },
        }
    }

    /// Every parameter with its current value, for a freshly loaded engine.
    pub fn engine_state(&self) -> Vec<(EngineParam, ParamValue)> {
        EngineParam::ALL
            .iter()
            .map(|p| (*p, self.param_value(*p)))
            .collect()
    }
}

impl ConfigValues {
    /// Store a config command. Returns whether anything changed.
    pub fn apply(&mut self, command: &ControlCommand) -> bool {
        match *command {
            ControlCommand::BlockMs(v) => update(&mut self.block_ms, v),
            ControlCommand::Overlap(v) => update(&mut self.overlap, v),
            ControlCommand::SplitComputation(v) => update(&mut self.split_computation, v),
            _ => false,
        }
    }

    pub fn sanitized(mut self) -> Self {
        self.block_ms = self
            .block_ms
            .clamp(BLOCK_MS_RANGE.0 as u32, BLOCK_MS_RANGE.1 as u32);
        self.overlap = self.overlap.clamp(OVERLAP_RANGE.0 as u32, OVERLAP_RANGE.1 as u32);
        self
    }
}
