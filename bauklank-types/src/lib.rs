//! # bauklank-types
//!
//! Shared type definitions for the Bauklank control plane.
//! This crate contains identifiers and status shapes used by bauklank-net,
//! bauklank-hub and bauklank-engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Largest number of engine slots that can be addressed (`A` through `Z`).
pub const MAX_SLOTS: usize = 26;

/// Identifier of a logical engine slot (`A`, `B`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotId(char);

impl SlotId {
    /// Slot for a zero-based index, `0 → A`.
    pub fn from_index(index: usize) -> Option<Self> {
        if index < MAX_SLOTS {
            Some(Self((b'A' + index as u8) as char))
        } else {
            None
        }
    }

    /// Parse a slot name, accepting lowercase and surrounding whitespace.
    pub fn parse(s: &str) -> Option<Self> {
        let mut chars = s.trim().chars();
        let c = chars.next()?.to_ascii_uppercase();
        if chars.next().is_some() || !c.is_ascii_uppercase() {
            return None;
        }
        Some(Self(c))
    }

    pub fn index(&self) -> usize {
        (self.0 as u8 - b'A') as usize
    }

    pub fn as_char(&self) -> char {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SlotId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SlotId::parse(&value).ok_or_else(|| format!("invalid engine slot '{}'", value))
    }
}

impl From<SlotId> for String {
    fn from(slot: SlotId) -> Self {
        slot.0.to_string()
    }
}

/// The first `count` slots in order (`A`, `B`, …), capped at [`MAX_SLOTS`].
pub fn slot_range(count: usize) -> Vec<SlotId> {
    (0..count.min(MAX_SLOTS))
        .filter_map(SlotId::from_index)
        .collect()
}

/// Identity facts learned from a controller's handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInfo {
    pub device_id: String,
    pub device_type: String,
    pub fw: String,
    pub port: String,
}

/// Derived liveness of one engine channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHealth {
    pub online: bool,
    /// `None` when nothing has been heard on this channel yet.
    pub age_ms: Option<u64>,
    pub device_id: Option<String>,
}

impl ChannelHealth {
    pub fn silent() -> Self {
        Self {
            online: false,
            age_ms: None,
            device_id: None,
        }
    }
}
