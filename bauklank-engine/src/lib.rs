//! Client-side engine control for Bauklank display clients.
//!
//! Each subscribed engine slot gets an [`EngineScheduler`] that validates
//! incoming hub `set`s and turns them into future-timestamped schedules for a
//! [`TimeStretchEngine`] running on its own worker thread.

pub mod bank;
pub mod controls;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod scheduler;
pub mod worker;

pub use bank::SlotBank;
pub use controls::{ConfigValues, ControlCommand, ControlValues};
pub use engine::{EngineOp, EngineParam, NullEngine, ParamValue, Schedule, TestEngine, TimeStretchEngine};
pub use error::{ControlError, EngineError, EngineResult};
pub use persistence::{ControlStore, NoopStore, StoredControls};
pub use scheduler::EngineScheduler;
pub use worker::{EngineCommand, EngineWorker};
