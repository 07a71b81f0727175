#![allow(dead_code)]
//! Test harness utilities for bauklank-engine integration tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bauklank_engine::{ControlStore, EngineScheduler, EngineWorker, NoopStore, StoredControls, TestEngine};
use bauklank_types::SlotId;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn slot(name: &str) -> SlotId {
    SlotId::parse(name).unwrap()
}

/// A scheduler with a recording engine loaded, its start-up traffic cleared.
pub fn loaded_scheduler(name: &str, time: f64, duration: f64) -> (EngineScheduler, TestEngine) {
    let mut scheduler = EngineScheduler::new(slot(name)).unwrap();
    let engine = TestEngine::new();
    engine.set_time(time);
    assert!(scheduler.load_source(Box::new(engine.clone()), duration));
    settle(&scheduler);
    engine.clear();
    (scheduler, engine)
}

/// Like `loaded_scheduler`, with a worker queue of `capacity` commands.
pub fn loaded_scheduler_with_capacity(
    name: &str,
    capacity: usize,
    time: f64,
    duration: f64,
) -> (EngineScheduler, TestEngine) {
    let worker = EngineWorker::with_capacity(slot(name), capacity).unwrap();
    let mut scheduler = EngineScheduler::with_worker(slot(name), worker, Box::new(NoopStore)).unwrap();
    let engine = TestEngine::new();
    engine.set_time(time);
    assert!(scheduler.load_source(Box::new(engine.clone()), duration));
    settle(&scheduler);
    engine.clear();
    (scheduler, engine)
}

/// Wait for the worker to handle everything queued so far.
pub fn settle(scheduler: &EngineScheduler) {
    assert!(scheduler.worker().barrier(WAIT), "engine worker did not settle");
}

/// Store that keeps slot state in memory and counts saves.
#[derive(Clone, Default)]
pub struct MemoryStore {
    slots: Arc<Mutex<BTreeMap<SlotId, StoredControls>>>,
    saves: Arc<Mutex<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(slot: SlotId, stored: StoredControls) -> Self {
        let store = Self::default();
        store.slots.lock().unwrap().insert(slot, stored);
        store
    }

    pub fn get(&self, slot: SlotId) -> Option<StoredControls> {
        self.slots.lock().unwrap().get(&slot).cloned()
    }

    pub fn saves(&self) -> usize {
        *self.saves.lock().unwrap()
    }
}

impl ControlStore for MemoryStore {
    fn load(&self, slot: SlotId) -> Option<StoredControls> {
        self.get(slot)
    }

    fn save(&self, slot: SlotId, stored: &StoredControls) {
        self.slots.lock().unwrap().insert(slot, stored.clone());
        *self.saves.lock().unwrap() += 1;
    }
}
