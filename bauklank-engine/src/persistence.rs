//! Optional persistence of slot state.
//!
//! The scheduler loads from its store once at construction and saves after
//! each mutation. Saving is best-effort; a store reports its own failures.

use bauklank_types::SlotId;

use crate::controls::{ConfigValues, ControlValues};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredControls {
    pub controls: ControlValues,
    pub config: ConfigValues,
}

pub trait ControlStore: Send {
    fn load(&self, slot: SlotId) -> Option<StoredControls>;
    fn save(&self, slot: SlotId, stored: &StoredControls);
}

/// Keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

impl ControlStore for NoopStore {
    fn load(&self, _slot: SlotId) -> Option<StoredControls> {
        None
    }

    fn save(&self, _slot: SlotId, _stored: &StoredControls) {}
}
