//! Channel liveness derived from `set` arrival times.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bauklank_net::protocol::EncoderStatus;
use bauklank_types::{ChannelHealth, SlotId};

#[derive(Debug, Clone, Default)]
struct ChannelRecord {
    last_update: Option<Instant>,
    device_id: Option<String>,
}

/// Tracks when each engine channel last carried a `set`.
///
/// Nothing here is cached: `online` and `ageMs` are recomputed from the last
/// arrival time on every snapshot, so a fresh message heals a stale channel
/// immediately.
pub struct ChannelHealthTracker {
    stale_after: Duration,
    channels: BTreeMap<SlotId, ChannelRecord>,
}

impl ChannelHealthTracker {
    pub fn new(slots: &[SlotId], stale_after: Duration) -> Self {
        Self {
            stale_after,
            channels: slots
                .iter()
                .map(|s| (*s, ChannelRecord::default()))
                .collect(),
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Record an accepted `set` on `slot`.
    pub fn record(&mut self, slot: SlotId, device_id: &str, now: Instant) {
        if let Some(record) = self.channels.get_mut(&slot) {
            record.last_update = Some(now);
            record.device_id = Some(device_id.to_string());
        }
    }

    /// Forget traffic from a device that went away.
    pub fn clear_device(&mut self, device_id: &str) {
        for record in self.channels.values_mut() {
            if record.device_id.as_deref() == Some(device_id) {
                *record = ChannelRecord::default();
            }
        }
    }

    pub fn channel(&self, slot: &SlotId, now: Instant) -> Option<ChannelHealth> {
        self.channels.get(slot).map(|r| self.health_of(r, now))
    }

    fn health_of(&self, record: &ChannelRecord, now: Instant) -> ChannelHealth {
        match record.last_update {
            None => ChannelHealth::silent(),
            Some(last) => {
                let age = now.saturating_duration_since(last);
                ChannelHealth {
                    online: age < self.stale_after,
                    age_ms: Some(age.as_millis() as u64),
                    device_id: record.device_id.clone(),
                }
            }
        }
    }

    pub fn snapshot(&self, now: Instant) -> BTreeMap<SlotId, ChannelHealth> {
        self.channels
            .iter()
            .map(|(slot, record)| (*slot, self.health_of(record, now)))
            .collect()
    }

    pub fn online_flags(&self, now: Instant) -> BTreeMap<SlotId, bool> {
        self.snapshot(now)
            .into_iter()
            .map(|(slot, health)| (slot, health.online))
            .collect()
    }

    pub fn encoder_status(&self, now: Instant) -> EncoderStatus {
        EncoderStatus {
            timeout_sec: self.stale_after.as_secs_f64(),
            channels: self.snapshot(now),
        }
    }
}

/// One-line summary for logs, e.g. `A=ON age=116ms | B=OFF age=—`.
pub fn format_channels(channels: &BTreeMap<SlotId, ChannelHealth>) -> String {
    channels
        .iter()
        .map(|(slot, h)| {
            let age = match h.age_ms {
                Some(ms) => format!("{}ms", ms),
                None => "—".to_string(),
            };
            format!("{}={} age={}", slot, if h.online { "ON" } else { "OFF" }, age)
        })
        .collect::<Vec<_>>()
        .join(" | ")
}
