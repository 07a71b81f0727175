//! Host identity facts and the hub's version string.

use std::net::{IpAddr, ToSocketAddrs, UdpSocket};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::warn;

use bauklank_net::protocol::MachineStatus;

const FALLBACK_VERSION: &str = "0.0.0";

/// Where the hub learns facts about its host.
pub trait HostFacts: Send {
    fn machine_status(&self) -> MachineStatus;
    fn server_version(&self) -> String;
}

/// Facts about the machine the hub runs on.
pub struct SystemFacts {
    version_dir: PathBuf,
    append_git_hash: bool,
    append_dirty_suffix: bool,
}

impl SystemFacts {
    /// Reads `version.json` from the executable's directory when present,
    /// otherwise from the working directory.
    pub fn new(append_git_hash: bool, append_dirty_suffix: bool) -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .filter(|d| d.join("version.json").exists());
        let version_dir = exe_dir
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        Self::with_dir(version_dir, append_git_hash, append_dirty_suffix)
    }

    pub fn with_dir(version_dir: PathBuf, append_git_hash: bool, append_dirty_suffix: bool) -> Self {
        Self {
            version_dir,
            append_git_hash,
            append_dirty_suffix,
        }
    }
}

impl HostFacts for SystemFacts {
    fn machine_status(&self) -> MachineStatus {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        let ips = all_ipv4(&hostname);
        MachineStatus {
            ip: ips.first().cloned().unwrap_or_default(),
            ips,
            hostname,
            user,
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    fn server_version(&self) -> String {
        let base = load_version_json(&self.version_dir.join("version.json"))
            .unwrap_or_else(|| FALLBACK_VERSION.to_string());
        if !self.append_git_hash {
            return base;
        }
        let Some(hash) = git(&self.version_dir, &["rev-parse", "--short", "HEAD"]) else {
            return base;
        };
        let dirty = self.append_dirty_suffix
            && git(&self.version_dir, &["status", "--porcelain"]).is_some();
        format!("{}+g{}{}", base, hash, if dirty { "-dirty" } else { "" })
    }
}

/// The `version` field of a `version.json` file.
pub fn load_version_json(path: &Path) -> Option<String> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(target: "version", "Could not read {}, using v{} ({})", path.display(), FALLBACK_VERSION, e);
            return None;
        }
    };
    let data: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(data) => data,
        Err(e) => {
            warn!(target: "version", "{} is not valid JSON, using v{} ({})", path.display(), FALLBACK_VERSION, e);
            return None;
        }
    };
    let version = match data.get("version") {
        Some(serde_json::Value::String(s)) => s.trim().to_string(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    if version.is_empty() {
        warn!(target: "version", "{} has no 'version', using v{}", path.display(), FALLBACK_VERSION);
        return None;
    }
    Some(version)
}

/// Trimmed stdout of a successful git command, `None` when empty or failing.
fn git(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Address of the interface that would route to the internet. Connecting a
/// UDP socket sends nothing.
fn primary_ipv4() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip.to_string()),
        _ => None,
    }
}

/// Primary address first, loopback dropped unless it is all there is.
fn all_ipv4(hostname: &str) -> Vec<String> {
    let mut ips: Vec<String> = Vec::new();
    if !hostname.is_empty() {
        if let Ok(addrs) = (hostname, 0).to_socket_addrs() {
            for addr in addrs {
                if let IpAddr::V4(ip) = addr.ip() {
                    let ip = ip.to_string();
                    if !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
            }
        }
    }
    if let Some(primary) = primary_ipv4() {
        ips.retain(|ip| ip != &primary);
        ips.insert(0, primary);
    }
    let non_loopback: Vec<String> = ips
        .iter()
        .filter(|ip| !ip.starts_with("127."))
        .cloned()
        .collect();
    if non_loopback.is_empty() {
        ips
    } else {
        non_loopback
    }
}
