use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};

use super::link::run_port;
use super::{SerialBackend, SerialEvent};
use crate::config::SerialSettings;

/// Discovers controllers on serial ports.
///
/// Each candidate port is probed on its own thread; a successful probe turns
/// that thread into the controller's reader. The prober tracks which ports
/// are busy so a port is never probed twice at once, and it joins each
/// thread once its terminal event has been drained.
pub struct Prober {
    backend: Arc<dyn SerialBackend>,
    settings: SerialSettings,
    events_tx: Sender<SerialEvent>,
    events_rx: Receiver<SerialEvent>,
    probing: BTreeSet<String>,
    attached: BTreeSet<String>,
    threads: BTreeMap<String, JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Prober {
    pub fn new(backend: Arc<dyn SerialBackend>, settings: SerialSettings) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            backend,
            settings,
            events_tx,
            events_rx,
            probing: BTreeSet::new(),
            attached: BTreeSet::new(),
            threads: BTreeMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ports that are present and neither excluded, attached, nor mid-probe.
    pub fn candidates(&self) -> Vec<String> {
        let ports = match self.backend.list_ports() {
            Ok(ports) => ports,
            Err(e) => {
                debug!(target: "serial", "Port enumeration failed: {}", e);
                return Vec::new();
            }
        };
        ports
            .into_iter()
            .filter(|p| !self.settings.exclude.contains(p))
            .filter(|p| !self.attached.contains(p) && !self.probing.contains(p))
            .collect()
    }

    /// Start a probe on every candidate port. Returns the ports probed.
    pub fn scan(&mut self) -> Vec<String> {
        let candidates = self.candidates();
        if !candidates.is_empty() {
            debug!(target: "serial", "Serial scan: {:?}", candidates);
        }

        let mut started = Vec::new();
        for port in candidates {
            let backend = Arc::clone(&self.backend);
            let settings = self.settings.clone();
            let events = self.events_tx.clone();
            let shutdown = Arc::clone(&self.shutdown);
            let thread_port = port.clone();

            let spawned = thread::Builder::new()
                .name(format!("serial-{}", short_name(&port)))
                .spawn(move || run_port(thread_port, backend, settings, events, shutdown));
            match spawned {
                Ok(handle) => {
                    self.probing.insert(port.clone());
                    self.threads.insert(port.clone(), handle);
                    started.push(port);
                }
                Err(e) => error!(target: "serial", "Failed to spawn probe for {}: {}", port, e),
            }
        }
        started
    }

    /// Drain pending serial events, updating port bookkeeping.
    pub fn drain(&mut self) -> Vec<SerialEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            match &event {
                SerialEvent::Attached { port, .. } => {
                    self.probing.remove(port);
                    self.attached.insert(port.clone());
                }
                SerialEvent::Line { .. } => {}
                SerialEvent::Closed { port, reason } => {
                    self.attached.remove(port);
                    self.reap(port);
                    warn!(target: "serial", "Controller disconnected on {}: {}", port, reason);
                }
                SerialEvent::ProbeFailed { port, .. } => {
                    self.probing.remove(port);
                    self.reap(port);
                }
            }
            events.push(event);
        }
        events
    }

    fn reap(&mut self, port: &str) {
        if let Some(handle) = self.threads.remove(port) {
            if handle.join().is_err() {
                error!(target: "serial", "Serial thread for {} panicked", port);
            }
        }
    }

    pub fn probing_count(&self) -> usize {
        self.probing.len()
    }

    pub fn attached_ports(&self) -> impl Iterator<Item = &String> {
        self.attached.iter()
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Stop every probe and reader and wait for their threads.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let threads = std::mem::take(&mut self.threads);
        if !threads.is_empty() {
            info!(target: "serial", "Stopping {} serial threads", threads.len());
        }
        for (port, handle) in threads {
            if handle.join().is_err() {
                error!(target: "serial", "Serial thread for {} panicked", port);
            }
        }
        while self.events_rx.try_recv().is_ok() {}
        self.probing.clear();
        self.attached.clear();
    }
}

impl Drop for Prober {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn short_name(port: &str) -> &str {
    port.rsplit('/').next().unwrap_or(port)
}
