//! Wire protocol types for the Bauklank control plane.
//!
//! Two protocols share this module: newline-delimited JSON between the hub
//! and serial controllers, and JSON text frames between the hub and display
//! clients. Both use an internally tagged `type` field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use bauklank_types::{ChannelHealth, ControllerInfo, SlotId};

/// Device type a controller must report in its handshake.
pub const CONTROLLER_DEVICE_TYPE: &str = "bauklank-controller";

/// Unique identifier for a connected display client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Frames exchanged with a serial controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceMessage {
    /// Probe sent by the hub to an unknown port.
    #[serde(rename = "whoareyou")]
    WhoAreYou,
    /// Handshake reply (also accepted mid-stream as an identity refresh).
    #[serde(rename_all = "camelCase")]
    Hello {
        #[serde(default)]
        device_type: String,
        #[serde(default)]
        device_id: String,
        #[serde(default)]
        fw: String,
    },
    /// Control change from an analog input on the controller.
    Set {
        key: String,
        #[serde(default)]
        value: Value,
        /// Optional explicit engine channel for multi-channel controllers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
}

impl DeviceMessage {
    pub const TYPES: [&'static str; 3] = ["whoareyou", "hello", "set"];
}

/// Host identity facts shown in the client status bar.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    pub hostname: String,
    pub user: String,
    pub platform: String,
    pub arch: String,
    pub ip: String,
    pub ips: Vec<String>,
}

/// Controller attachment for one engine slot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineControllerStatus {
    pub connected: bool,
    pub device_id: Option<String>,
    pub fw: Option<String>,
    pub port: Option<String>,
}

/// Per-channel liveness block embedded in `controllerStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderStatus {
    pub timeout_sec: f64,
    pub channels: BTreeMap<SlotId, ChannelHealth>,
}

/// Snapshot of every controller known to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    /// True while at least one controller is attached.
    pub connected: bool,
    /// Identity of the first assigned controller in slot order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    pub engine_slots: Vec<SlotId>,
    pub engines: BTreeMap<SlotId, EngineControllerStatus>,
    /// Discovered controllers that could not be given a slot.
    #[serde(default)]
    pub unassigned: Vec<ControllerInfo>,
    pub encoders: EncoderStatus,
}

/// Messages sent from the hub to display clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HubMessage {
    ServerVersion { version: String },
    MachineStatus(MachineStatus),
    ControllerStatus(ControllerStatus),
    /// A device control change tagged with its engine slot.
    Set {
        engine: SlotId,
        key: String,
        value: Value,
    },
}

impl HubMessage {
    pub const TYPES: [&'static str; 4] =
        ["serverVersion", "machineStatus", "controllerStatus", "set"];

    /// Engine slot this message is addressed to, if any.
    pub fn engine(&self) -> Option<&SlotId> {
        match self {
            HubMessage::Set { engine, .. } => Some(engine),
            _ => None,
        }
    }
}

/// Messages sent from display clients to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Declares which engine slots the client renders. Advisory only.
    #[serde(rename_all = "camelCase")]
    Hello {
        #[serde(default)]
        engine_slots: Vec<SlotId>,
    },
}

impl ClientMessage {
    pub const TYPES: [&'static str; 1] = ["hello"];
}
