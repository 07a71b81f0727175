//! The engine slots one display client renders.
//!
//! The hub broadcasts every slot's traffic to every client; the bank keeps
//! the `set`s addressed to its own slots and drops the rest.

use std::collections::BTreeMap;
use std::time::Instant;

use log::{debug, trace};

use bauklank_net::protocol::HubMessage;
use bauklank_types::SlotId;

use crate::scheduler::EngineScheduler;

#[derive(Default)]
pub struct SlotBank {
    schedulers: BTreeMap<SlotId, EngineScheduler>,
    filtered: u64,
    rejected: u64,
}

impl SlotBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the scheduler's slot, replacing any previous scheduler.
    pub fn insert(&mut self, scheduler: EngineScheduler) {
        self.schedulers.insert(scheduler.slot(), scheduler);
    }

    pub fn slots(&self) -> Vec<SlotId> {
        self.schedulers.keys().copied().collect()
    }

    pub fn get(&self, slot: &SlotId) -> Option<&EngineScheduler> {
        self.schedulers.get(slot)
    }

    pub fn get_mut(&mut self, slot: &SlotId) -> Option<&mut EngineScheduler> {
        self.schedulers.get_mut(slot)
    }

    /// Sets addressed to slots this bank does not render.
    pub fn filtered(&self) -> u64 {
        self.filtered
    }

    /// Sets whose key or value was not accepted.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Apply a hub message. Returns whether a slot's state changed.
    pub fn handle(&mut self, msg: &HubMessage, now: Instant) -> bool {
        let HubMessage::Set { engine, key, value } = msg else {
            return false;
        };
        let Some(scheduler) = self.schedulers.get_mut(engine) else {
            self.filtered += 1;
            trace!(target: "engine", "Ignoring set for unsubscribed slot {}", engine);
            return false;
        };
        match scheduler.apply_incoming_set(key, value, now) {
            Ok(changed) => changed,
            Err(e) => {
                self.rejected += 1;
                debug!(target: "engine", "Slot {}: {}", engine, e);
                false
            }
        }
    }

    /// Flush due config pushes on every slot.
    pub fn poll(&mut self, now: Instant) {
        for scheduler in self.schedulers.values_mut() {
            scheduler.poll(now);
        }
    }
}
