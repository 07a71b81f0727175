//! Serial transport: port enumeration, probing, and per-controller readers.

mod link;
mod prober;

use std::io::{self, Read, Write};
use std::time::Duration;

use bauklank_types::ControllerInfo;

pub use prober::Prober;

/// How long a single read waits before the reader checks for shutdown.
pub const READ_POLL: Duration = Duration::from_millis(100);

/// An open byte stream to a serial device.
pub trait SerialLink: Read + Write + Send {}

impl<T: Read + Write + Send> SerialLink for T {}

/// Source of serial ports. The hub uses [`SystemSerial`]; tests substitute
/// scripted in-memory devices.
pub trait SerialBackend: Send + Sync {
    /// Paths of the ports currently present.
    fn list_ports(&self) -> io::Result<Vec<String>>;

    /// Open a port. Reads must return `TimedOut` after `read_timeout` of silence.
    fn open(&self, path: &str, baud: u32, read_timeout: Duration) -> io::Result<Box<dyn SerialLink>>;
}

/// Serial ports of the host, via the `serialport` crate.
pub struct SystemSerial;

impl SerialBackend for SystemSerial {
    fn list_ports(&self) -> io::Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    fn open(&self, path: &str, baud: u32, read_timeout: Duration) -> io::Result<Box<dyn SerialLink>> {
        let port = serialport::new(path, baud).timeout(read_timeout).open()?;
        Ok(Box::new(port))
    }
}

/// Why a probe did not yield a controller. None of these are errors: the
/// port simply stays a candidate for the next scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeFailure {
    Open(String),
    Io(String),
    Timeout,
    UnexpectedReply(String),
    WrongDeviceType(String),
    NotAllowed(String),
    Shutdown,
}

/// Serial activity reported to the control loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SerialEvent {
    /// Probe succeeded; the port's reader is now running.
    Attached { port: String, info: ControllerInfo },
    /// A non-empty line from an attached controller.
    Line { port: String, line: String },
    /// Attached controller went away (EOF, I/O error, or shutdown).
    Closed { port: String, reason: String },
    /// Probe ended without finding a controller. The port handle is closed.
    ProbeFailed { port: String, reason: ProbeFailure },
}

impl SerialEvent {
    pub fn port(&self) -> &str {
        match self {
            SerialEvent::Attached { port, .. }
            | SerialEvent::Line { port, .. }
            | SerialEvent::Closed { port, .. }
            | SerialEvent::ProbeFailed { port, .. } => port,
        }
    }
}
