//! Classifies controller lines and turns `set` commands into engine-tagged
//! client messages.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Instant;

use log::{debug, trace};
use serde_json::Value;

use bauklank_net::framing::parse_device_line;
use bauklank_net::protocol::{DeviceMessage, HubMessage};

use crate::config::SerialLogMode;
use crate::health::ChannelHealthTracker;
use crate::registry::Registry;

/// Drop counters, reported in the heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub lines: u64,
    pub forwarded: u64,
    pub malformed: u64,
    pub unknown_type: u64,
    pub unroutable: u64,
}

impl fmt::Display for RouterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lines={} forwarded={} malformed={} unknown={} unroutable={}",
            self.lines, self.forwarded, self.malformed, self.unknown_type, self.unroutable
        )
    }
}

/// Per-port traffic summary for digest logging.
#[derive(Debug, Clone)]
struct SerialDigest {
    started: Instant,
    lines: u64,
    json: u64,
    sets: u64,
    key_counts: HashMap<String, u64>,
    last_values: HashMap<String, Value>,
}

impl SerialDigest {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            lines: 0,
            json: 0,
            sets: 0,
            key_counts: HashMap::new(),
            last_values: HashMap::new(),
        }
    }

    fn summary(&self, port: &str, now: Instant, max_keys: usize) -> String {
        let mut keys: Vec<(&String, &u64)> = self.key_counts.iter().collect();
        keys.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let parts: Vec<String> = keys
            .into_iter()
            .take(max_keys)
            .map(|(k, n)| {
                let last = self
                    .last_values
                    .get(k)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "null".into());
                format!("{}×{} last={}", k, n, last)
            })
            .collect();
        let key_part = if parts.is_empty() {
            String::new()
        } else {
            format!(" · {}", parts.join(" | "))
        };
        format!(
            "SERIAL {}: {} lines ({} json, {} set) in {:.1}s{}",
            port,
            self.lines,
            self.json,
            self.sets,
            now.saturating_duration_since(self.started).as_secs_f64(),
            key_part
        )
    }
}

pub struct Router {
    log_mode: SerialLogMode,
    stats: RouterStats,
    digests: BTreeMap<String, SerialDigest>,
}

impl Router {
    pub fn new(log_mode: SerialLogMode) -> Self {
        Self {
            log_mode,
            stats: RouterStats::default(),
            digests: BTreeMap::new(),
        }
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Handle one line from the controller on `port`. Returns the message to
    /// broadcast, if the line was a routable `set`.
    pub fn route_line(
        &mut self,
        registry: &mut Registry,
        health: &mut ChannelHealthTracker,
        port: &str,
        line: &str,
        now: Instant,
    ) -> Option<HubMessage> {
        self.stats.lines += 1;
        registry.touch(port, now);
        if self.log_mode == SerialLogMode::Full {
            debug!(target: "serial", "SERIAL {}: {}", port, line);
        }
        let digest = self
            .digests
            .entry(port.to_string())
            .or_insert_with(|| SerialDigest::new(now));
        digest.lines += 1;

        let msg = match parse_device_line(line) {
            Ok(msg) => msg,
            Err(e) => {
                if e.is_unknown_type() {
                    digest.json += 1;
                    self.stats.unknown_type += 1;
                } else {
                    if !matches!(e, bauklank_net::FrameError::NotJson(_)) {
                        digest.json += 1;
                    }
                    self.stats.malformed += 1;
                }
                trace!(target: "router", "Dropped line from {}: {}", port, e);
                return None;
            }
        };
        digest.json += 1;

        match msg {
            DeviceMessage::Hello {
                device_type,
                device_id,
                fw,
            } => {
                registry.update_identity(port, device_type, device_id, fw);
                None
            }
            DeviceMessage::WhoAreYou => {
                self.stats.unknown_type += 1;
                None
            }
            DeviceMessage::Set {
                key,
                value,
                channel,
            } => {
                digest.sets += 1;
                if key.is_empty() {
                    self.stats.malformed += 1;
                    return None;
                }
                let value = normalize_value(&key, value);
                *digest.key_counts.entry(key.clone()).or_insert(0) += 1;
                digest.last_values.insert(key.clone(), value.clone());

                let Some(engine) = registry.route(port, channel.as_deref()) else {
                    self.stats.unroutable += 1;
                    trace!(target: "router", "Unroutable set from {}: {}", port, key);
                    return None;
                };
                if let Some(controller) = registry.get(port) {
                    health.record(engine, &controller.info.device_id, now);
                }
                self.stats.forwarded += 1;
                Some(HubMessage::Set {
                    engine,
                    key: wire_key(key),
                    value,
                })
            }
        }
    }

    /// Emit due digest lines. With `force`, emit for every port with traffic.
    pub fn flush_digests(&mut self, now: Instant, force: bool) {
        let SerialLogMode::Digest { every, max_keys } = self.log_mode.clone() else {
            self.digests.clear();
            return;
        };
        for (port, digest) in self.digests.iter_mut() {
            let due = now.saturating_duration_since(digest.started) >= every;
            if !(due || force) {
                continue;
            }
            if digest.lines > 0 {
                debug!(target: "serial", "{}", digest.summary(port, now, max_keys));
            }
            *digest = SerialDigest::new(now);
        }
    }

    /// Final digest for a port that went away.
    pub fn finish_port(&mut self, port: &str, now: Instant) {
        if let Some(digest) = self.digests.remove(port) {
            if let SerialLogMode::Digest { max_keys, .. } = self.log_mode {
                if digest.lines > 0 {
                    debug!(target: "serial", "{}", digest.summary(port, now, max_keys));
                }
            }
        }
    }
}

/// Device boundary coercion: `volume` and `tone` become integers (truncated),
/// `rate` becomes a float. Values that cannot be converted pass through.
pub fn normalize_value(key: &str, value: Value) -> Value {
    match key {
        "volume" | "tone" => match as_f64(&value, true) {
            Some(v) if v.is_finite() => Value::from(v.trunc() as i64),
            _ => value,
        },
        "rate" => match as_f64(&value, false) {
            Some(v) if v.is_finite() => serde_json::Number::from_f64(v)
                .map(Value::Number)
                .unwrap_or(value),
            _ => value,
        },
        _ => value,
    }
}

/// Device `volume` is an integer percent. Clients get it as `volumePercent`,
/// so the percent-to-gain conversion happens once, on the client.
pub fn wire_key(key: String) -> String {
    match key.as_str() {
        "volume" => "volumePercent".to_string(),
        _ => key,
    }
}

fn as_f64(value: &Value, integer_strings: bool) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) if integer_strings => s.trim().parse::<i64>().ok().map(|v| v as f64),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bauklank_types::{ControllerInfo, SlotId};
    use serde_json::json;
    use std::time::Duration;

    fn slot(s: &str) -> SlotId {
        SlotId::parse(s).unwrap()
    }

    fn setup() -> (Router, Registry, ChannelHealthTracker) {
        let slots = vec![slot("A"), slot("B")];
        let mut registry = Registry::new(slots.clone(), BTreeMap::new());
        registry.attach(
            ControllerInfo {
                device_id: "CTL".into(),
                device_type: "bauklank-controller".into(),
                fw: "1.0".into(),
                port: "/dev/p1".into(),
            },
            Instant::now(),
        );
        let health = ChannelHealthTracker::new(&slots, Duration::from_secs(6));
        (Router::new(SerialLogMode::Full), registry, health)
    }

    #[test]
    fn set_is_tagged_and_marks_channel_online() {
        let (mut router, mut reg, mut health) = setup();
        let now = Instant::now();
        let msg = router.route_line(
            &mut reg,
            &mut health,
            "/dev/p1",
            r#"{"type":"set","key":"rate","value":"0.5"}"#,
            now,
        );
        assert_eq!(
            msg,
            Some(HubMessage::Set {
                engine: slot("A"),
                key: "rate".into(),
                value: json!(0.5),
            })
        );
        assert!(health.channel(&slot("A"), now).unwrap().online);
        assert!(!health.channel(&slot("B"), now).unwrap().online);
    }

    #[test]
    fn device_volume_travels_as_percent() {
        let (mut router, mut reg, mut health) = setup();
        let now = Instant::now();
        let out: Vec<HubMessage> = [2, 1, 0]
            .iter()
            .filter_map(|v| {
                let line = format!(r#"{{"type":"set","key":"volume","value":{}}}"#, v);
                router.route_line(&mut reg, &mut health, "/dev/p1", &line, now)
            })
            .collect();
        let expected: Vec<HubMessage> = [2, 1, 0]
            .iter()
            .map(|v| HubMessage::Set {
                engine: slot("A"),
                key: "volumePercent".into(),
                value: json!(v),
            })
            .collect();
        assert_eq!(out, expected);
        assert_eq!(wire_key("rate".into()), "rate");
    }

    #[test]
    fn bad_lines_are_counted_not_fatal() {
        let (mut router, mut reg, mut health) = setup();
        let now = Instant::now();
        for line in ["garbage", "{\"type\":", "{\"type\":\"blink\"}", "{\"value\":1}"] {
            assert_eq!(router.route_line(&mut reg, &mut health, "/dev/p1", line, now), None);
        }
        let stats = router.stats();
        assert_eq!(stats.lines, 4);
        assert_eq!(stats.malformed, 3);
        assert_eq!(stats.unknown_type, 1);
        assert_eq!(stats.forwarded, 0);
    }

    #[test]
    fn hello_updates_identity_silently() {
        let (mut router, mut reg, mut health) = setup();
        let line = r#"{"type":"hello","deviceType":"bauklank-controller","deviceId":"CTL","fw":"2.0"}"#;
        assert_eq!(
            router.route_line(&mut reg, &mut health, "/dev/p1", line, Instant::now()),
            None
        );
        assert_eq!(reg.get("/dev/p1").unwrap().info.fw, "2.0");
    }

    #[test]
    fn unassigned_controller_sets_are_unroutable() {
        let (mut router, mut reg, mut health) = setup();
        let line = r#"{"type":"set","key":"volume","value":3}"#;
        assert_eq!(
            router.route_line(&mut reg, &mut health, "/dev/ghost", line, Instant::now()),
            None
        );
        assert_eq!(router.stats().unroutable, 1);
    }

    #[test]
    fn burst_on_a_does_not_hold_back_b() {
        let (mut router, mut reg, mut health) = setup();
        let now = Instant::now();
        let mut lines: Vec<String> = (0..1000)
            .map(|i| format!(r#"{{"type":"set","channel":"A","key":"rate","value":{}}}"#, i))
            .collect();
        lines.push(r#"{"type":"set","channel":"B","key":"rate","value":1.0}"#.to_string());

        let out: Vec<HubMessage> = lines
            .iter()
            .filter_map(|l| router.route_line(&mut reg, &mut health, "/dev/p1", l, now))
            .collect();
        assert_eq!(out.len(), 1001);
        assert_eq!(out.last().and_then(|m| m.engine()), Some(&slot("B")));
    }

    #[test]
    fn normalize_truncates_and_coerces() {
        assert_eq!(normalize_value("volume", json!(12.9)), json!(12));
        assert_eq!(normalize_value("tone", json!("-3")), json!(-3));
        assert_eq!(normalize_value("tone", json!("2.5")), json!("2.5"));
        assert_eq!(normalize_value("rate", json!(1)), json!(1.0));
        assert_eq!(normalize_value("rate", json!("abc")), json!("abc"));
        assert_eq!(normalize_value("pan", json!("40")), json!("40"));
    }

    #[test]
    fn digest_summary_lists_top_keys() {
        let now = Instant::now();
        let mut digest = SerialDigest::new(now);
        digest.lines = 3;
        digest.json = 3;
        digest.sets = 3;
        digest.key_counts.insert("rate".into(), 2);
        digest.key_counts.insert("volume".into(), 1);
        digest.last_values.insert("rate".into(), json!(0.5));
        digest.last_values.insert("volume".into(), json!(40));
        let text = digest.summary("/dev/p1", now + Duration::from_secs(5), 1);
        assert_eq!(
            text,
            "SERIAL /dev/p1: 3 lines (3 json, 3 set) in 5.0s · rate×2 last=0.5"
        );
    }
}
