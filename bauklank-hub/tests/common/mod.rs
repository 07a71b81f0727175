#![allow(dead_code)]
//! Test harness utilities for bauklank-hub integration tests.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bauklank_hub::serial::{SerialBackend, SerialLink};
use bauklank_hub::{HostFacts, Hub, HubConfig};
use bauklank_net::protocol::{HubMessage, MachineStatus};
use bauklank_types::SlotId;

pub fn slot(name: &str) -> SlotId {
    SlotId::parse(name).unwrap()
}

/// How a scripted device answers the probe.
#[derive(Debug, Clone)]
pub enum Script {
    /// Never answers.
    Silent,
    /// Prints a boot banner, then answers as a controller.
    Controller { device_id: String, fw: String },
    /// Answers with a hello from some other kind of device.
    Other { device_type: String },
}

impl Script {
    pub fn controller(device_id: &str) -> Self {
        Script::Controller {
            device_id: device_id.to_string(),
            fw: "1.4.0".to_string(),
        }
    }
}

#[derive(Default)]
struct Wire {
    incoming: VecDeque<u8>,
    closed: bool,
}

struct FakeDevice {
    script: Script,
    wire: Arc<Mutex<Wire>>,
}

/// In-memory serial ports with scripted devices.
#[derive(Clone, Default)]
pub struct FakeSerial {
    devices: Arc<Mutex<BTreeMap<String, FakeDevice>>>,
    open_links: Arc<AtomicUsize>,
    total_opens: Arc<AtomicUsize>,
}

impl FakeSerial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plug(&self, port: &str, script: Script) {
        self.devices.lock().unwrap().insert(
            port.to_string(),
            FakeDevice {
                script,
                wire: Arc::new(Mutex::new(Wire::default())),
            },
        );
    }

    /// Remove the port and end its stream.
    pub fn unplug(&self, port: &str) {
        if let Some(device) = self.devices.lock().unwrap().remove(port) {
            device.wire.lock().unwrap().closed = true;
        }
    }

    /// Queue lines as if the device had sent them.
    pub fn send_lines<I, S>(&self, port: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let devices = self.devices.lock().unwrap();
        let device = devices.get(port).unwrap();
        let mut wire = device.wire.lock().unwrap();
        for line in lines {
            wire.incoming.extend(line.as_ref().as_bytes());
            wire.incoming.push_back(b'\n');
        }
    }

    /// Handles currently open.
    pub fn open_links(&self) -> usize {
        self.open_links.load(Ordering::SeqCst)
    }

    pub fn total_opens(&self) -> usize {
        self.total_opens.load(Ordering::SeqCst)
    }
}

impl SerialBackend for FakeSerial {
    fn list_ports(&self) -> io::Result<Vec<String>> {
        Ok(self.devices.lock().unwrap().keys().cloned().collect())
    }

    fn open(&self, path: &str, _baud: u32, _read_timeout: Duration) -> io::Result<Box<dyn SerialLink>> {
        let devices = self.devices.lock().unwrap();
        let device = devices
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such port"))?;
        self.open_links.fetch_add(1, Ordering::SeqCst);
        self.total_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeLink {
            script: device.script.clone(),
            wire: Arc::clone(&device.wire),
            open_links: Arc::clone(&self.open_links),
        }))
    }
}

struct FakeLink {
    script: Script,
    wire: Arc<Mutex<Wire>>,
    open_links: Arc<AtomicUsize>,
}

impl Read for FakeLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut wire = self.wire.lock().unwrap();
            if !wire.incoming.is_empty() {
                let n = buf.len().min(wire.incoming.len());
                for (slot, byte) in buf.iter_mut().zip(wire.incoming.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if wire.closed {
                return Ok(0);
            }
        }
        std::thread::sleep(Duration::from_millis(2));
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

impl Write for FakeLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        if text.contains("whoareyou") {
            let reply = match &self.script {
                Script::Silent => None,
                Script::Controller { device_id, fw } => Some(format!(
                    "BOOT bauklank\n{{\"type\":\"hello\",\"deviceType\":\"bauklank-controller\",\"deviceId\":\"{}\",\"fw\":\"{}\"}}\n",
                    device_id, fw
                )),
                Script::Other { device_type } => Some(format!(
                    "{{\"type\":\"hello\",\"deviceType\":\"{}\",\"deviceId\":\"X\",\"fw\":\"0\"}}\n",
                    device_type
                )),
            };
            if let Some(reply) = reply {
                self.wire.lock().unwrap().incoming.extend(reply.as_bytes());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for FakeLink {
    fn drop(&mut self) {
        self.open_links.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fixed host facts.
pub struct FixedFacts;

impl HostFacts for FixedFacts {
    fn machine_status(&self) -> MachineStatus {
        MachineStatus {
            hostname: "kiosk".into(),
            user: "bauklank".into(),
            platform: "linux".into(),
            arch: "aarch64".into(),
            ip: "10.0.0.2".into(),
            ips: vec!["10.0.0.2".into()],
        }
    }

    fn server_version(&self) -> String {
        "2.15.1".into()
    }
}

/// Short timers so tests run in well under a second per scenario.
pub fn test_config() -> HubConfig {
    let mut config = HubConfig::default();
    config.serial.scan_interval = Duration::from_millis(50);
    config.serial.probe_timeout = Duration::from_millis(100);
    config.status.poll = Duration::from_millis(20);
    config
}

pub fn make_hub(config: HubConfig, serial: &FakeSerial) -> Hub {
    Hub::new(config, Arc::new(serial.clone()), Box::new(FixedFacts))
}

/// Step the hub until `pred` holds, collecting every broadcast.
pub fn drive_until<F>(hub: &mut Hub, timeout: Duration, pred: F) -> Vec<HubMessage>
where
    F: Fn(&Hub) -> bool,
{
    let start = Instant::now();
    let mut out = Vec::new();
    while start.elapsed() < timeout {
        out.extend(hub.step(Instant::now()));
        if pred(hub) {
            return out;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("Timed out driving hub, broadcasts so far: {:?}", out);
}

/// Step the hub for a fixed time, collecting every broadcast.
pub fn drive_for(hub: &mut Hub, duration: Duration) -> Vec<HubMessage> {
    let start = Instant::now();
    let mut out = Vec::new();
    while start.elapsed() < duration {
        out.extend(hub.step(Instant::now()));
        std::thread::sleep(Duration::from_millis(2));
    }
    out
}
