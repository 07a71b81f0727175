use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, info, warn};

use bauklank_net::framing::{parse_device_line, write_line, LineReader};
use bauklank_net::protocol::{DeviceMessage, CONTROLLER_DEVICE_TYPE};
use bauklank_types::ControllerInfo;

use super::{ProbeFailure, SerialBackend, SerialEvent, SerialLink, READ_POLL};
use crate::config::SerialSettings;

/// Probe one port and, if it hosts a controller, keep reading it until it
/// goes away. Runs on its own thread so a hung port only stalls itself.
pub(super) fn run_port(
    port: String,
    backend: Arc<dyn SerialBackend>,
    settings: SerialSettings,
    events: Sender<SerialEvent>,
    shutdown: Arc<AtomicBool>,
) {
    let link = match backend.open(&port, settings.baud, READ_POLL) {
        Ok(link) => link,
        Err(e) => {
            debug!(target: "serial", "Probe open failed: {} ({})", port, e);
            let _ = events.send(SerialEvent::ProbeFailed {
                port,
                reason: ProbeFailure::Open(e.to_string()),
            });
            return;
        }
    };
    let mut reader = LineReader::new(link);

    let info = match probe(&port, &mut reader, &settings, &shutdown) {
        Ok(info) => info,
        Err(reason) => {
            // Dropping the reader closes the handle before the port is
            // reported free again.
            drop(reader);
            let _ = events.send(SerialEvent::ProbeFailed { port, reason });
            return;
        }
    };

    info!(
        target: "serial",
        "Found controller on {}: deviceId={} fw={}",
        port,
        info.device_id,
        info.fw
    );
    if events
        .send(SerialEvent::Attached {
            port: port.clone(),
            info,
        })
        .is_err()
    {
        return;
    }

    let reason = read_until_closed(&port, &mut reader, &events, &shutdown);
    drop(reader);
    let _ = events.send(SerialEvent::Closed { port, reason });
}

fn probe(
    port: &str,
    reader: &mut LineReader<Box<dyn SerialLink>>,
    settings: &SerialSettings,
    shutdown: &AtomicBool,
) -> Result<ControllerInfo, ProbeFailure> {
    debug!(target: "serial", "Probing serial port: {}", port);
    write_line(reader.get_mut(), &DeviceMessage::WhoAreYou)
        .map_err(|e| ProbeFailure::Io(e.to_string()))?;

    let reply = read_first_object(port, reader, settings.probe_timeout, shutdown)?;
    match reply {
        DeviceMessage::Hello {
            device_type,
            device_id,
            fw,
        } => {
            if device_type != CONTROLLER_DEVICE_TYPE {
                debug!(target: "serial", "Not our deviceType on {}: {}", port, device_type);
                return Err(ProbeFailure::WrongDeviceType(device_type));
            }
            if let Some(allowlist) = &settings.allowlist {
                if !allowlist.contains(&device_id) {
                    info!(
                        target: "serial",
                        "Ignoring controller on {} with unexpected deviceId={}",
                        port,
                        device_id
                    );
                    return Err(ProbeFailure::NotAllowed(device_id));
                }
            }
            Ok(ControllerInfo {
                device_id,
                device_type,
                fw,
                port: port.to_string(),
            })
        }
        other => {
            debug!(target: "serial", "Unexpected response on {}: {:?}", port, other);
            Err(ProbeFailure::UnexpectedReply(format!("{:?}", other)))
        }
    }
}

/// Wait for the first JSON object line. Boot banners and other non-JSON
/// noise are skipped; the first object decides the probe.
fn read_first_object(
    port: &str,
    reader: &mut LineReader<Box<dyn SerialLink>>,
    timeout: Duration,
    shutdown: &AtomicBool,
) -> Result<DeviceMessage, ProbeFailure> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::Relaxed) {
            return Err(ProbeFailure::Shutdown);
        }
        let line = match reader.next_line() {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(e) => return Err(ProbeFailure::Io(e.to_string())),
        };
        debug!(target: "serial", "RX <- {}: {}", port, line);
        if !line.starts_with('{') {
            continue;
        }
        return parse_device_line(&line).map_err(|e| ProbeFailure::UnexpectedReply(e.to_string()));
    }
    debug!(target: "serial", "No response on: {}", port);
    Err(ProbeFailure::Timeout)
}

fn read_until_closed(
    port: &str,
    reader: &mut LineReader<Box<dyn SerialLink>>,
    events: &Sender<SerialEvent>,
    shutdown: &AtomicBool,
) -> String {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return "hub shutting down".to_string();
        }
        match reader.next_line() {
            Ok(Some(line)) => {
                let event = SerialEvent::Line {
                    port: port.to_string(),
                    line,
                };
                if events.send(event).is_err() {
                    return "hub stopped listening".to_string();
                }
            }
            Ok(None) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return "stream closed".to_string();
            }
            Err(e) => {
                warn!(target: "serial", "Controller read error on {}: {}", port, e);
                return e.to_string();
            }
        }
    }
}
