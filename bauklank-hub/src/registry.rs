//! Controller registry and engine slot assignment.
//!
//! Only the control loop mutates the registry, so every snapshot taken from
//! it is consistent.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use log::{info, warn};

use bauklank_net::protocol::EngineControllerStatus;
use bauklank_types::{ControllerInfo, SlotId};

/// An attached controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Controller {
    pub info: ControllerInfo,
    pub slot: Option<SlotId>,
    pub attached_at: Instant,
    pub last_seen: Instant,
    /// Attach order; earlier claimants win slot conflicts.
    seq: u64,
}

pub struct Registry {
    slots: Vec<SlotId>,
    identity: BTreeMap<String, SlotId>,
    /// Keyed by port path.
    controllers: BTreeMap<String, Controller>,
    /// Slot -> owning port.
    owners: BTreeMap<SlotId, String>,
    next_seq: u64,
}

impl Registry {
    pub fn new(slots: Vec<SlotId>, identity: BTreeMap<String, SlotId>) -> Self {
        for (device_id, slot) in &identity {
            if !slots.contains(slot) {
                warn!(
                    target: "registry",
                    "Identity {} maps to slot {} which is not served",
                    device_id,
                    slot
                );
            }
        }
        Self {
            slots,
            identity,
            controllers: BTreeMap::new(),
            owners: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn engine_slots(&self) -> &[SlotId] {
        &self.slots
    }

    /// Register a controller found on `info.port`. Returns its slot, or
    /// `None` when it is tracked as discovered but unassigned.
    pub fn attach(&mut self, info: ControllerInfo, now: Instant) -> Option<SlotId> {
        let port = info.port.clone();
        if self.controllers.contains_key(&port) {
            self.detach(&port);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.controllers.insert(
            port.clone(),
            Controller {
                info,
                slot: None,
                attached_at: now,
                last_seen: now,
                seq,
            },
        );

        let slot = self.assign(&port);
        if let Some(controller) = self.controllers.get(&port) {
            match slot {
                Some(slot) => info!(
                    target: "registry",
                    "Controller {} on {} assigned to engine {}",
                    controller.info.device_id,
                    port,
                    slot
                ),
                None => warn!(
                    target: "registry",
                    "Controller {} on {} discovered but unassigned",
                    controller.info.device_id,
                    port
                ),
            }
        }
        slot
    }

    /// Remove the controller on `port`, free its slot, and let waiting
    /// controllers claim freed slots in attach order.
    pub fn detach(&mut self, port: &str) -> Option<Controller> {
        let controller = self.controllers.remove(port)?;
        if let Some(slot) = controller.slot {
            self.owners.remove(&slot);
            info!(
                target: "registry",
                "Controller {} detached, engine {} is free",
                controller.info.device_id,
                slot
            );
        }

        let mut waiting: Vec<(u64, String)> = self
            .controllers
            .iter()
            .filter(|(_, c)| c.slot.is_none())
            .map(|(p, c)| (c.seq, p.clone()))
            .collect();
        waiting.sort();
        for (_, port) in waiting {
            if let Some(slot) = self.assign(&port) {
                info!(target: "registry", "Controller on {} promoted to engine {}", port, slot);
            }
        }
        Some(controller)
    }

    fn assign(&mut self, port: &str) -> Option<SlotId> {
        let device_id = self.controllers.get(port)?.info.device_id.clone();
        let slot = match self.identity.get(&device_id) {
            Some(mapped) => {
                if !self.slots.contains(mapped) {
                    return None;
                }
                match self.owners.get(mapped) {
                    None => Some(*mapped),
                    Some(owner) => {
                        warn!(
                            target: "registry",
                            "Engine {} already owned by {}; {} stays unassigned",
                            mapped,
                            owner,
                            device_id
                        );
                        None
                    }
                }
            }
            None => {
                let reserved: BTreeSet<&SlotId> = self.identity.values().collect();
                self.slots
                    .iter()
                    .find(|s| !self.owners.contains_key(*s) && !reserved.contains(s))
                    .copied()
            }
        }?;

        self.owners.insert(slot, port.to_string());
        if let Some(controller) = self.controllers.get_mut(port) {
            controller.slot = Some(slot);
        }
        Some(slot)
    }

    /// Apply a mid-stream `hello`. Slot ownership is unchanged.
    pub fn update_identity(&mut self, port: &str, device_type: String, device_id: String, fw: String) {
        if let Some(controller) = self.controllers.get_mut(port) {
            if controller.info.device_id != device_id && !device_id.is_empty() {
                info!(
                    target: "registry",
                    "Controller on {} now reports deviceId={}",
                    port,
                    device_id
                );
                controller.info.device_id = device_id;
            }
            if !device_type.is_empty() {
                controller.info.device_type = device_type;
            }
            if !fw.is_empty() {
                controller.info.fw = fw;
            }
        }
    }

    pub fn touch(&mut self, port: &str, now: Instant) {
        if let Some(controller) = self.controllers.get_mut(port) {
            controller.last_seen = now;
        }
    }

    pub fn get(&self, port: &str) -> Option<&Controller> {
        self.controllers.get(port)
    }

    pub fn owner(&self, slot: &SlotId) -> Option<&Controller> {
        self.owners.get(slot).and_then(|port| self.controllers.get(port))
    }

    /// Engine tag for a `set` from `port`. A `channel` naming a served slot
    /// that the sender owns or nobody owns wins; otherwise the sender's own
    /// slot. Unassigned controllers are never routed.
    pub fn route(&self, port: &str, channel: Option<&str>) -> Option<SlotId> {
        let own = self.controllers.get(port)?.slot?;
        let requested = channel.and_then(SlotId::parse);
        match requested {
            Some(slot) if self.slots.contains(&slot) => match self.owners.get(&slot) {
                None => Some(slot),
                Some(owner) if owner == port => Some(slot),
                Some(_) => Some(own),
            },
            _ => Some(own),
        }
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Assigned controllers in slot order.
    pub fn assigned(&self) -> impl Iterator<Item = (&SlotId, &Controller)> {
        self.slots
            .iter()
            .filter_map(move |slot| self.owner(slot).map(|c| (slot, c)))
    }

    /// Discovered controllers without a slot, in attach order.
    pub fn unassigned(&self) -> Vec<&Controller> {
        let mut waiting: Vec<&Controller> =
            self.controllers.values().filter(|c| c.slot.is_none()).collect();
        waiting.sort_by_key(|c| c.seq);
        waiting
    }

    /// Per-slot attachment block of `controllerStatus`.
    pub fn engine_status(&self) -> BTreeMap<SlotId, EngineControllerStatus> {
        self.slots
            .iter()
            .map(|slot| {
                let status = match self.owner(slot) {
                    Some(c) => EngineControllerStatus {
                        connected: true,
                        device_id: Some(c.info.device_id.clone()),
                        fw: Some(c.info.fw.clone()),
                        port: Some(c.info.port.clone()),
                    },
                    None => EngineControllerStatus::default(),
                };
                (*slot, status)
            })
            .collect()
    }
}
