//! Network layer for the Bauklank control plane.
//!
//! This crate provides the wire protocol shared by controllers, the hub and
//! display clients, the fan-out server that broadcasts hub messages, and the
//! client-side hub connection with bounded reconnection backoff.

pub mod backoff;
pub mod client;
pub mod framing;
pub mod protocol;
pub mod server;

pub use backoff::Backoff;
pub use client::{ConnectError, ConnectionState, HubConnection, HubEvent};
pub use framing::{FrameError, LineReader};
pub use protocol::{
    ClientId, ClientMessage, ControllerStatus, DeviceMessage, EncoderStatus,
    EngineControllerStatus, HubMessage, MachineStatus,
};
pub use server::{ClientEvent, FanoutServer};
