use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::LevelFilter;
use serde::Deserialize;

use bauklank_types::{slot_range, SlotId, MAX_SLOTS};

use crate::error::{HubError, Result};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Longest interval any timer may be configured with.
pub const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    engines: EnginesConfig,
    #[serde(default)]
    serial: SerialConfig,
    #[serde(default)]
    identity: BTreeMap<String, String>,
    #[serde(default)]
    health: HealthConfig,
    #[serde(default)]
    status: StatusConfig,
    #[serde(default)]
    version: VersionConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Deserialize, Default)]
struct ServerConfig {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Deserialize, Default)]
struct EnginesConfig {
    count: Option<usize>,
    slot: Option<String>,
}

#[derive(Deserialize, Default)]
struct SerialConfig {
    baud: Option<u32>,
    scan_interval_secs: Option<f64>,
    probe_timeout_secs: Option<f64>,
    exclude: Option<Vec<String>>,
    strict_allowlist: Option<bool>,
    allowlist: Option<Vec<String>>,
    log_mode: Option<String>,
    digest_interval_secs: Option<f64>,
    digest_max_keys: Option<usize>,
}

#[derive(Deserialize, Default)]
struct HealthConfig {
    resend_interval_secs: Option<f64>,
    stale_multiplier: Option<f64>,
}

#[derive(Deserialize, Default)]
struct StatusConfig {
    poll_secs: Option<f64>,
    refresh_secs: Option<f64>,
    machine_poll_secs: Option<f64>,
    heartbeat_secs: Option<f64>,
}

#[derive(Deserialize, Default)]
struct VersionConfig {
    append_git_hash: Option<bool>,
    append_dirty_suffix: Option<bool>,
}

#[derive(Deserialize, Default)]
struct LoggingConfig {
    startup_level: Option<String>,
    run_level: Option<String>,
}

/// How incoming serial lines are logged.
#[derive(Debug, Clone, PartialEq)]
pub enum SerialLogMode {
    /// Every line at debug.
    Full,
    /// A per-port summary every `every`, listing at most `max_keys` keys.
    Digest { every: Duration, max_keys: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub baud: u32,
    pub scan_interval: Duration,
    pub probe_timeout: Duration,
    pub exclude: BTreeSet<String>,
    /// `Some` when the strict allowlist is on.
    pub allowlist: Option<BTreeSet<String>>,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud: 115_200,
            scan_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(1),
            exclude: [
                "/dev/cu.debug-console",
                "/dev/cu.Bluetooth-Incoming-Port",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            allowlist: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSettings {
    pub poll: Duration,
    pub refresh: Duration,
    pub machine_poll: Duration,
    pub heartbeat: Duration,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            poll: Duration::from_secs(1),
            refresh: Duration::from_secs(5),
            machine_poll: Duration::from_secs(5),
            heartbeat: Duration::from_secs(60),
        }
    }
}

/// Resolved hub settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub engine_slots: Vec<SlotId>,
    pub serial: SerialSettings,
    pub identity: BTreeMap<String, SlotId>,
    /// Expected interval between a controller's resends.
    pub resend_interval: Duration,
    pub stale_multiplier: f64,
    pub status: StatusSettings,
    pub serial_log: SerialLogMode,
    pub append_git_hash: bool,
    pub append_dirty_suffix: bool,
    pub startup_log_level: LevelFilter,
    pub run_log_level: LevelFilter,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8765,
            engine_slots: slot_range(2),
            serial: SerialSettings::default(),
            identity: BTreeMap::new(),
            resend_interval: Duration::from_secs(2),
            stale_multiplier: 3.0,
            status: StatusSettings::default(),
            serial_log: SerialLogMode::Full,
            append_git_hash: true,
            append_dirty_suffix: true,
            startup_log_level: LevelFilter::Info,
            run_log_level: LevelFilter::Warn,
        }
    }
}

impl HubConfig {
    /// Embedded defaults, overlaid with the user file. An explicit path must
    /// exist; the per-user file is optional and ignored when malformed.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut base: ConfigFile = toml::from_str(DEFAULT_CONFIG)?;

        match explicit {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                let user: ConfigFile = toml::from_str(&contents)?;
                merge(&mut base, user);
            }
            None => {
                if let Some(path) = user_config_path() {
                    if path.exists() {
                        match std::fs::read_to_string(&path) {
                            Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                                Ok(user) => merge(&mut base, user),
                                Err(e) => log::warn!(
                                    target: "config",
                                    "ignoring malformed config {}: {}",
                                    path.display(),
                                    e
                                ),
                            },
                            Err(e) => log::warn!(
                                target: "config",
                                "could not read config {}: {}",
                                path.display(),
                                e
                            ),
                        }
                    }
                }
            }
        }

        Self::resolve(base)
    }

    /// Parse a config document on its own, over built-in defaults.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents)?;
        Self::resolve(file)
    }

    fn resolve(file: ConfigFile) -> Result<Self> {
        let fallback = HubConfig::default();

        let count = file.engines.count.unwrap_or(fallback.engine_slots.len());
        let slot = match file.engines.slot.as_deref() {
            Some(s) => Some(parse_slot(s)?),
            None => None,
        };
        let engine_slots = engine_slots(count, slot)?;

        let mut identity = BTreeMap::new();
        for (device_id, slot) in file.identity {
            identity.insert(device_id, parse_slot(&slot)?);
        }

        let serial_log = match file.serial.log_mode.as_deref() {
            None | Some("full") => SerialLogMode::Full,
            Some("digest") => SerialLogMode::Digest {
                every: secs(file.serial.digest_interval_secs, Duration::from_secs(5))?,
                max_keys: file.serial.digest_max_keys.unwrap_or(10).max(1),
            },
            Some(other) => {
                return Err(HubError::InvalidConfig(format!(
                    "serial.log_mode must be \"full\" or \"digest\", got \"{}\"",
                    other
                )))
            }
        };

        let allowlist = if file.serial.strict_allowlist.unwrap_or(false) {
            Some(
                file.serial
                    .allowlist
                    .unwrap_or_default()
                    .into_iter()
                    .collect(),
            )
        } else {
            None
        };

        let stale_multiplier = file.health.stale_multiplier.unwrap_or(fallback.stale_multiplier);
        if !stale_multiplier.is_finite() || stale_multiplier <= 0.0 {
            return Err(HubError::InvalidConfig(
                "health.stale_multiplier must be positive".into(),
            ));
        }
        let resend_interval = secs(file.health.resend_interval_secs, fallback.resend_interval)?;
        if stale_after(resend_interval, stale_multiplier).is_none() {
            return Err(HubError::InvalidConfig(format!(
                "health.resend_interval_secs x health.stale_multiplier exceeds {}s",
                MAX_INTERVAL.as_secs()
            )));
        }

        Ok(Self {
            host: file.server.host.unwrap_or(fallback.host),
            port: file.server.port.unwrap_or(fallback.port),
            engine_slots,
            serial: SerialSettings {
                baud: file.serial.baud.unwrap_or(fallback.serial.baud),
                scan_interval: secs(file.serial.scan_interval_secs, fallback.serial.scan_interval)?,
                probe_timeout: secs(file.serial.probe_timeout_secs, fallback.serial.probe_timeout)?,
                exclude: file
                    .serial
                    .exclude
                    .map(|v| v.into_iter().collect())
                    .unwrap_or(fallback.serial.exclude),
                allowlist,
            },
            identity,
            resend_interval,
            stale_multiplier,
            status: StatusSettings {
                poll: secs(file.status.poll_secs, fallback.status.poll)?,
                refresh: secs(file.status.refresh_secs, fallback.status.refresh)?,
                machine_poll: secs(file.status.machine_poll_secs, fallback.status.machine_poll)?,
                heartbeat: secs(file.status.heartbeat_secs, fallback.status.heartbeat)?,
            },
            serial_log,
            append_git_hash: file.version.append_git_hash.unwrap_or(fallback.append_git_hash),
            append_dirty_suffix: file
                .version
                .append_dirty_suffix
                .unwrap_or(fallback.append_dirty_suffix),
            startup_log_level: level(file.logging.startup_level, fallback.startup_log_level)?,
            run_log_level: level(file.logging.run_level, fallback.run_log_level)?,
        })
    }

    /// Apply command-line overrides.
    pub fn apply_args(&mut self, args: &[String]) -> Result<()> {
        let value_of = |flag: &str| -> Result<Option<String>> {
            match args.iter().position(|a| a == flag) {
                Some(i) => args
                    .get(i + 1)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| HubError::InvalidArgument(format!("{} needs a value", flag))),
                None => Ok(None),
            }
        };

        if let Some(host) = value_of("--host")? {
            self.host = host;
        }
        if let Some(port) = value_of("--port")? {
            self.port = port
                .parse()
                .map_err(|_| HubError::InvalidArgument(format!("bad port '{}'", port)))?;
        }

        let count = value_of("--engine-count")?
            .map(|c| {
                c.parse::<usize>()
                    .map_err(|_| HubError::InvalidArgument(format!("bad engine count '{}'", c)))
            })
            .transpose()?;
        let slot = value_of("--slot")?
            .map(|s| {
                SlotId::parse(&s)
                    .ok_or_else(|| HubError::InvalidArgument(format!("bad slot '{}'", s)))
            })
            .transpose()?;
        if count.is_some() || slot.is_some() {
            let count = count.unwrap_or(self.engine_slots.len());
            let slot = slot.or_else(|| self.engine_slots.first().copied());
            self.engine_slots = engine_slots(count, slot)?;
        }

        if let Some(l) = value_of("--startup-log-level")? {
            self.startup_log_level = parse_level(&l)
                .ok_or_else(|| HubError::InvalidArgument(format!("bad log level '{}'", l)))?;
        }
        if let Some(l) = value_of("--run-log-level")? {
            self.run_log_level = parse_level(&l)
                .ok_or_else(|| HubError::InvalidArgument(format!("bad log level '{}'", l)))?;
        }
        if args.iter().any(|a| a == "--verbose" || a == "-v") {
            self.startup_log_level = LevelFilter::Debug;
            self.run_log_level = LevelFilter::Debug;
        }
        Ok(())
    }

    /// Silence after which a channel is reported offline.
    pub fn stale_threshold(&self) -> Duration {
        stale_after(self.resend_interval, self.stale_multiplier).unwrap_or(MAX_INTERVAL)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `--config <path>` from the raw argument list.
pub fn config_path_arg(args: &[String]) -> Option<PathBuf> {
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("bauklank").join("hub.toml"))
}

fn engine_slots(count: usize, single: Option<SlotId>) -> Result<Vec<SlotId>> {
    match count {
        0 => Err(HubError::InvalidConfig("engine count must be at least 1".into())),
        1 => Ok(vec![single.unwrap_or_else(|| slot_range(1)[0])]),
        n if n <= MAX_SLOTS => Ok(slot_range(n)),
        n => Err(HubError::InvalidConfig(format!(
            "engine count {} exceeds {}",
            n, MAX_SLOTS
        ))),
    }
}

fn parse_slot(s: &str) -> Result<SlotId> {
    SlotId::parse(s).ok_or_else(|| HubError::InvalidConfig(format!("invalid engine slot '{}'", s)))
}

fn secs(value: Option<f64>, fallback: Duration) -> Result<Duration> {
    match value {
        None => Ok(fallback),
        Some(v) if v.is_finite() && v > 0.0 => Duration::try_from_secs_f64(v)
            .ok()
            .filter(|d| *d <= MAX_INTERVAL)
            .ok_or_else(|| {
                HubError::InvalidConfig(format!(
                    "interval of {}s is longer than {}s",
                    v,
                    MAX_INTERVAL.as_secs()
                ))
            }),
        Some(v) => Err(HubError::InvalidConfig(format!(
            "interval must be a positive number of seconds, got {}",
            v
        ))),
    }
}

fn stale_after(resend_interval: Duration, multiplier: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(resend_interval.as_secs_f64() * multiplier)
        .ok()
        .filter(|d| *d <= MAX_INTERVAL)
}

fn level(value: Option<String>, fallback: LevelFilter) -> Result<LevelFilter> {
    match value {
        None => Ok(fallback),
        Some(s) => parse_level(&s)
            .ok_or_else(|| HubError::InvalidConfig(format!("invalid log level '{}'", s))),
    }
}

/// Accepts `log` level names plus `warning` and `critical`.
pub fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "warning" => Some(LevelFilter::Warn),
        "critical" => Some(LevelFilter::Error),
        other => other.parse().ok(),
    }
}

fn merge(base: &mut ConfigFile, user: ConfigFile) {
    merge_server(&mut base.server, user.server);
    merge_engines(&mut base.engines, user.engines);
    merge_serial(&mut base.serial, user.serial);
    base.identity.extend(user.identity);
    merge_health(&mut base.health, user.health);
    merge_status(&mut base.status, user.status);
    merge_version(&mut base.version, user.version);
    merge_logging(&mut base.logging, user.logging);
}

fn merge_server(base: &mut ServerConfig, user: ServerConfig) {
    if user.host.is_some() {
        base.host = user.host;
    }
    if user.port.is_some() {
        base.port = user.port;
    }
}

fn merge_engines(base: &mut EnginesConfig, user: EnginesConfig) {
    if user.count.is_some() {
        base.count = user.count;
    }
    if user.slot.is_some() {
        base.slot = user.slot;
    }
}

fn merge_serial(base: &mut SerialConfig, user: SerialConfig) {
    if user.baud.is_some() {
        base.baud = user.baud;
    }
    if user.scan_interval_secs.is_some() {
        base.scan_interval_secs = user.scan_interval_secs;
    }
    if user.probe_timeout_secs.is_some() {
        base.probe_timeout_secs = user.probe_timeout_secs;
    }
    if user.exclude.is_some() {
        base.exclude = user.exclude;
    }
    if user.strict_allowlist.is_some() {
        base.strict_allowlist = user.strict_allowlist;
    }
    if user.allowlist.is_some() {
        base.allowlist = user.allowlist;
    }
    if user.log_mode.is_some() {
        base.log_mode = user.log_mode;
    }
    if user.digest_interval_secs.is_some() {
        base.digest_interval_secs = user.digest_interval_secs;
    }
    if user.digest_max_keys.is_some() {
        base.digest_max_keys = user.digest_max_keys;
    }
}

fn merge_health(base: &mut HealthConfig, user: HealthConfig) {
    if user.resend_interval_secs.is_some() {
        base.resend_interval_secs = user.resend_interval_secs;
    }
    if user.stale_multiplier.is_some() {
        base.stale_multiplier = user.stale_multiplier;
    }
}

fn merge_status(base: &mut StatusConfig, user: StatusConfig) {
    if user.poll_secs.is_some() {
        base.poll_secs = user.poll_secs;
    }
    if user.refresh_secs.is_some() {
        base.refresh_secs = user.refresh_secs;
    }
    if user.machine_poll_secs.is_some() {
        base.machine_poll_secs = user.machine_poll_secs;
    }
    if user.heartbeat_secs.is_some() {
        base.heartbeat_secs = user.heartbeat_secs;
    }
}

fn merge_version(base: &mut VersionConfig, user: VersionConfig) {
    if user.append_git_hash.is_some() {
        base.append_git_hash = user.append_git_hash;
    }
    if user.append_dirty_suffix.is_some() {
        base.append_dirty_suffix = user.append_dirty_suffix;
    }
}

fn merge_logging(base: &mut LoggingConfig, user: LoggingConfig) {
    if user.startup_level.is_some() {
        base.startup_level = user.startup_level;
    }
    if user.run_level.is_some() {
        base.run_level = user.run_level;
    }
}
