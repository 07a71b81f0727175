//! Bauklank hub: bridges serial controllers to display clients.
//!
//! The hub discovers controllers on serial ports, assigns them to engine
//! slots, tracks per-channel liveness, and turns controller commands into
//! engine-tagged messages for the fan-out server.

pub mod config;
pub mod error;
pub mod health;
pub mod hub;
pub mod machine;
pub mod registry;
pub mod router;
pub mod serial;

pub use config::{HubConfig, SerialLogMode};
pub use error::HubError;
pub use hub::Hub;
pub use machine::{HostFacts, SystemFacts};
pub use registry::Registry;
pub use serial::{SerialBackend, SerialEvent, SystemSerial};
