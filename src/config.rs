use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::collect::ERROR_LOG_STREAM;

/// Top-level configuration for the healthlog daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory under which `events/` and `metrics/` are rooted.
    /// When unset, the first mounted removable partition is used, falling
    /// back to the working directory.
    #[serde(default)]
    pub base_path: Option<PathBuf>,

    /// Parent directory of the `writetests/` and `writetests_err/` tiers. Default: ".".
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,

    /// Wait before the first cycle so the host can settle after boot. Default: 30s.
    #[serde(default = "default_startup_delay", with = "humantime_serde")]
    pub startup_delay: Duration,

    /// Sleep at the end of every cycle. Default: 0s.
    #[serde(default = "default_cycle_interval", with = "humantime_serde")]
    pub cycle_interval: Duration,

    /// Single-instance lock configuration.
    #[serde(default)]
    pub lock: LockConfig,

    /// Log segment rotation configuration.
    #[serde(default)]
    pub rotation: RotationConfig,

    /// Disk capacity guard configuration.
    #[serde(default)]
    pub guard: GuardConfig,

    /// Write integrity probe configuration.
    #[serde(default)]
    pub integrity: IntegrityConfig,

    /// Write speed probe configuration.
    #[serde(default)]
    pub speed: SpeedConfig,

    /// Event capture configuration.
    #[serde(default)]
    pub events: EventsConfig,

    /// Raw metrics collection configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Single-instance lock configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Lock file path. Default: "./logger.lock".
    #[serde(default = "default_lock_path")]
    pub path: PathBuf,

    /// Age after which an existing lock is considered abandoned. Default: 60s.
    #[serde(default = "default_lock_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,
}

/// Log segment rotation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    /// Size at which a segment stops receiving appends. Default: 1,000,000.
    #[serde(default = "default_segment_ceiling_bytes")]
    pub segment_ceiling_bytes: u64,
}

/// Disk capacity guard configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    /// Minimum free space in MB (10^6 bytes) before scratch tiers are evicted. Default: 1000.
    #[serde(default = "default_threshold_mb")]
    pub threshold_mb: u64,

    /// Path whose filesystem is inspected. Default: the scratch root.
    #[serde(default)]
    pub free_space_path: Option<PathBuf>,
}

/// Write integrity probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IntegrityConfig {
    /// How long the probe keeps writing each cycle. Default: 60s.
    #[serde(default = "default_integrity_duration", with = "humantime_serde")]
    pub duration: Duration,

    /// Size of each generated payload. Default: 10,000,000.
    #[serde(default = "default_payload_bytes")]
    pub payload_bytes: usize,
}

/// Write speed probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeedConfig {
    /// Size of the single large file. Default: 100,000,000.
    #[serde(default = "default_big_file_bytes")]
    pub big_file_bytes: usize,

    /// Number of small files. Default: 1000.
    #[serde(default = "default_small_file_count")]
    pub small_file_count: usize,

    /// Size of each small file. Default: 100,000.
    #[serde(default = "default_small_file_bytes")]
    pub small_file_bytes: usize,
}

/// Event capture configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Ordered table of commands whose output is captured every cycle.
    #[serde(default = "default_event_commands")]
    pub commands: Vec<EventCommand>,
}

/// One named command in the event capture table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventCommand {
    /// Stream name; becomes part of the segment file name.
    pub name: String,
    /// Shell command line.
    pub command: String,
}

impl EventCommand {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// Raw metrics collection configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Command printing `name,value` lines. Unset: no dynamic columns.
    #[serde(default)]
    pub command: Option<String>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_startup_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_cycle_interval() -> Duration {
    Duration::ZERO
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("./logger.lock")
}

fn default_lock_stale_after() -> Duration {
    Duration::from_secs(60)
}

fn default_segment_ceiling_bytes() -> u64 {
    1_000_000
}

fn default_threshold_mb() -> u64 {
    1000
}

fn default_integrity_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_payload_bytes() -> usize {
    10_000_000
}

fn default_big_file_bytes() -> usize {
    100_000_000
}

fn default_small_file_count() -> usize {
    1000
}

fn default_small_file_bytes() -> usize {
    100_000
}

fn default_event_commands() -> Vec<EventCommand> {
    vec![
        EventCommand::new("last_boot", "who -b"),
        EventCommand::new(
            "last_boot_command_3",
            "last -FRx3 boot reboot shutdown root",
        ),
        EventCommand::new("last_crash_3", "last | grep crash | head -3"),
        EventCommand::new("journal_crash_reports_n", "journalctl | grep crash"),
    ]
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            base_path: None,
            scratch_root: default_scratch_root(),
            startup_delay: default_startup_delay(),
            cycle_interval: default_cycle_interval(),
            lock: LockConfig::default(),
            rotation: RotationConfig::default(),
            guard: GuardConfig::default(),
            integrity: IntegrityConfig::default(),
            speed: SpeedConfig::default(),
            events: EventsConfig::default(),
            metrics: MetricsConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: default_lock_path(),
            stale_after: default_lock_stale_after(),
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            segment_ceiling_bytes: default_segment_ceiling_bytes(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            threshold_mb: default_threshold_mb(),
            free_space_path: None,
        }
    }
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            duration: default_integrity_duration(),
            payload_bytes: default_payload_bytes(),
        }
    }
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            big_file_bytes: default_big_file_bytes(),
            small_file_count: default_small_file_count(),
            small_file_bytes: default_small_file_bytes(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            commands: default_event_commands(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg = Self::from_yaml(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty map.
        let cfg: Config = if data.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(data)?
        };

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.lock.stale_after.is_zero() {
            bail!("lock.stale_after must be positive");
        }

        if self.rotation.segment_ceiling_bytes == 0 {
            bail!("rotation.segment_ceiling_bytes must be positive");
        }

        if self.integrity.payload_bytes == 0 {
            bail!("integrity.payload_bytes must be positive");
        }

        if self.speed.big_file_bytes == 0 {
            bail!("speed.big_file_bytes must be positive");
        }

        if self.speed.small_file_count == 0 {
            bail!("speed.small_file_count must be positive");
        }

        if self.speed.small_file_bytes == 0 {
            bail!("speed.small_file_bytes must be positive");
        }

        let mut seen = HashSet::with_capacity(self.events.commands.len());
        for cmd in &self.events.commands {
            if cmd.name.is_empty() {
                bail!("events.commands: name must not be empty");
            }
            if !cmd
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                bail!(
                    "events.commands: name {:?} may only contain [A-Za-z0-9_-]",
                    cmd.name
                );
            }
            if cmd.command.trim().is_empty() {
                bail!("events.commands: command for {:?} must not be empty", cmd.name);
            }
            if cmd.name == ERROR_LOG_STREAM {
                bail!(
                    "events.commands: {:?} is built in and reads the scratch error log",
                    cmd.name
                );
            }
            if !seen.insert(cmd.name.as_str()) {
                bail!("events.commands: duplicate name {:?}", cmd.name);
            }
        }

        if let Some(command) = &self.metrics.command {
            if command.trim().is_empty() {
                bail!("metrics.command must not be empty when set");
            }
        }

        Ok(())
    }

    /// Filesystem path inspected by the disk capacity guard.
    pub fn free_space_path(&self) -> &Path {
        self.guard
            .free_space_path
            .as_deref()
            .unwrap_or(&self.scratch_root)
    }
}
