//! The hub's single control loop state.
//!
//! `Hub::step` is called once per loop cycle. It drains every pending serial
//! event, routes device lines, and runs the status timers, returning the
//! messages to broadcast in production order. Network I/O stays outside so
//! the same state machine runs under the fan-out server and in tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use bauklank_net::protocol::{ControllerStatus, HubMessage, MachineStatus};
use bauklank_types::{ControllerInfo, SlotId};

use crate::config::HubConfig;
use crate::health::{format_channels, ChannelHealthTracker};
use crate::machine::HostFacts;
use crate::registry::Registry;
use crate::router::{Router, RouterStats};
use crate::serial::{Prober, SerialBackend, SerialEvent};

/// Fires every `period`, starting on the first check.
#[derive(Debug)]
struct Interval {
    period: Duration,
    last: Option<Instant>,
}

impl Interval {
    fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.period => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

pub struct Hub {
    prober: Prober,
    registry: Registry,
    health: ChannelHealthTracker,
    router: Router,
    facts: Box<dyn HostFacts>,

    version: String,
    machine: MachineStatus,

    scan: Interval,
    status_poll: Interval,
    machine_poll: Interval,
    heartbeat: Interval,
    refresh_every: Duration,
    last_status_at: Option<Instant>,
    last_online: Option<BTreeMap<SlotId, bool>>,
    controllers_changed: bool,
}

impl Hub {
    pub fn new(config: HubConfig, backend: Arc<dyn SerialBackend>, facts: Box<dyn HostFacts>) -> Self {
        let stale_after = config.stale_threshold();
        let version = facts.server_version();
        let machine = facts.machine_status();
        Self {
            prober: Prober::new(backend, config.serial.clone()),
            health: ChannelHealthTracker::new(&config.engine_slots, stale_after),
            registry: Registry::new(config.engine_slots.clone(), config.identity.clone()),
            router: Router::new(config.serial_log.clone()),
            facts,
            version,
            machine,
            scan: Interval::new(config.serial.scan_interval),
            status_poll: Interval::new(config.status.poll),
            machine_poll: Interval::new(config.status.machine_poll),
            heartbeat: Interval::new(config.status.heartbeat),
            refresh_every: config.status.refresh,
            last_status_at: None,
            last_online: None,
            controllers_changed: false,
        }
    }

    /// Messages a newly connected client receives before any broadcast.
    pub fn greeting(&self, now: Instant) -> Vec<HubMessage> {
        vec![
            HubMessage::ServerVersion {
                version: self.version.clone(),
            },
            HubMessage::MachineStatus(self.machine.clone()),
            HubMessage::ControllerStatus(self.controller_status(now)),
        ]
    }

    /// Run one control loop cycle.
    pub fn step(&mut self, now: Instant) -> Vec<HubMessage> {
        let mut out = Vec::new();

        if self.scan.due(now) {
            self.prober.scan();
        }

        for event in self.prober.drain() {
            self.handle_serial(event, now, &mut out);
        }
        self.router.flush_digests(now, false);

        self.update_status(now, &mut out);

        if self.machine_poll.due(now) {
            self.refresh_host_facts(&mut out);
        }

        if self.heartbeat.due(now) {
            info!(target: "hub", "Controller alive: {}", self.heartbeat_line());
        }
        out
    }

    fn handle_serial(&mut self, event: SerialEvent, now: Instant, out: &mut Vec<HubMessage>) {
        match event {
            SerialEvent::Attached { port, info } => {
                info!(
                    target: "hub",
                    "Controller connected on {} (deviceId={})",
                    port,
                    info.device_id
                );
                self.registry.attach(info, now);
                self.controllers_changed = true;
            }
            SerialEvent::Line { port, line } => {
                if let Some(msg) =
                    self.router
                        .route_line(&mut self.registry, &mut self.health, &port, &line, now)
                {
                    out.push(msg);
                }
            }
            SerialEvent::Closed { port, .. } => {
                self.router.finish_port(&port, now);
                if let Some(controller) = self.registry.detach(&port) {
                    self.health.clear_device(&controller.info.device_id);
                    self.controllers_changed = true;
                }
            }
            SerialEvent::ProbeFailed { port, reason } => {
                debug!(target: "hub", "Probe of {} ended: {:?}", port, reason);
            }
        }
    }

    /// Broadcast `controllerStatus` when the controller set changed, when a
    /// channel's online flag flipped, or when the refresh interval elapsed.
    fn update_status(&mut self, now: Instant, out: &mut Vec<HubMessage>) {
        let changed = std::mem::take(&mut self.controllers_changed);
        if !changed && !self.status_poll.due(now) {
            return;
        }

        let status = self.controller_status(now);
        let online: BTreeMap<SlotId, bool> = status
            .encoders
            .channels
            .iter()
            .map(|(slot, h)| (*slot, h.online))
            .collect();
        let flipped = self.last_online.as_ref() != Some(&online);
        let refresh_due = match self.last_status_at {
            Some(at) => now.saturating_duration_since(at) >= self.refresh_every,
            None => true,
        };

        if changed || flipped || refresh_due {
            debug!(
                target: "hub",
                "controllerStatus: connected={} | encoders: {}",
                if status.connected { "YES" } else { "NO" },
                format_channels(&status.encoders.channels)
            );
            out.push(HubMessage::ControllerStatus(status));
            self.last_online = Some(online);
            self.last_status_at = Some(now);
        }
    }

    fn refresh_host_facts(&mut self, out: &mut Vec<HubMessage>) {
        let machine = self.facts.machine_status();
        if machine != self.machine {
            info!(target: "hub", "Machine status changed: {:?}", machine);
            self.machine = machine.clone();
            out.push(HubMessage::MachineStatus(machine));
        }
        let version = self.facts.server_version();
        if version != self.version {
            info!(target: "hub", "Server version changed: {} -> {}", self.version, version);
            self.version = version.clone();
            out.push(HubMessage::ServerVersion { version });
        }
    }

    /// Consistent snapshot of every controller and channel.
    pub fn controller_status(&self, now: Instant) -> ControllerStatus {
        let primary: Option<&ControllerInfo> = self.registry.assigned().next().map(|(_, c)| &c.info);
        ControllerStatus {
            connected: !self.registry.is_empty(),
            device_id: primary.map(|i| i.device_id.clone()),
            fw: primary.map(|i| i.fw.clone()),
            port: primary.map(|i| i.port.clone()),
            engine_slots: self.registry.engine_slots().to_vec(),
            engines: self.registry.engine_status(),
            unassigned: self
                .registry
                .unassigned()
                .into_iter()
                .map(|c| c.info.clone())
                .collect(),
            encoders: self.health.encoder_status(now),
        }
    }

    fn heartbeat_line(&self) -> String {
        let attached: Vec<String> = self
            .registry
            .assigned()
            .map(|(slot, c)| {
                let port = c.info.port.rsplit('/').next().unwrap_or(c.info.port.as_str());
                format!("{}={}@{} fw={}", slot, c.info.device_id, port, c.info.fw)
            })
            .collect();
        let controllers = if attached.is_empty() {
            "—".to_string()
        } else {
            attached.join(", ")
        };
        format!(
            "{} unassigned={} engines={:?} {}",
            controllers,
            self.registry.unassigned().len(),
            self.registry
                .engine_slots()
                .iter()
                .map(|s| s.as_char())
                .collect::<String>(),
            self.router.stats()
        )
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn prober(&self) -> &Prober {
        &self.prober
    }

    pub fn stats(&self) -> &RouterStats {
        self.router.stats()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Stop serial threads. Attached controllers are detached.
    pub fn shutdown(&mut self) {
        self.prober.shutdown();
        let ports: Vec<String> = self
            .registry
            .assigned()
            .map(|(_, c)| c.info.port.clone())
            .chain(self.registry.unassigned().into_iter().map(|c| c.info.port.clone()))
            .collect();
        for port in ports {
            self.registry.detach(&port);
        }
    }
}
