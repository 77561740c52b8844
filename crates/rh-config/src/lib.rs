//! roguehound configuration loading and validation.
//!
//! All defaults live on the `Default` impls, so a missing config file and
//! `Config::default()` are guaranteed to agree. Values are stored as TOML in
//! the user config directory; unknown band names or malformed TOML are fatal
//! at load time, never at runtime.

use rh_common::{Band, Error, ProcessState, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Data retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Closed process events older than this many days are pruned.
    pub events_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { events_days: 90 }
    }
}

/// Daemon and sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Number of samples kept in the ring buffer (~20 s at 3 Hz).
    pub ring_buffer_size: usize,
    /// Seconds between samples (default ~0.333 s = 3 Hz).
    pub sample_interval: f64,
    /// Minimum seconds between forensic captures. The kernel tracer cannot
    /// produce useful output before its rolling buffer has refilled.
    pub forensics_debounce: f64,
    /// Log a heartbeat line every N samples.
    pub heartbeat_samples: u64,
    /// Consecutive samples at a band before logging the transition.
    pub log_stability_samples: u32,
    /// Hours between automatic prune runs.
    pub auto_prune_interval_hours: u64,
    /// Seconds of unified log history captured during forensics.
    pub forensics_log_seconds: u64,
    /// Loop iterations between machine snapshots (~60 s at 3 Hz).
    pub machine_snapshot_samples: u64,
    /// Machine snapshot retention in hours.
    pub machine_snapshot_retention_hours: f64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size: 60,
            sample_interval: 1.0 / 3.0,
            forensics_debounce: 2.0,
            heartbeat_samples: 60,
            log_stability_samples: 3,
            auto_prune_interval_hours: 24,
            forensics_log_seconds: 60,
            machine_snapshot_samples: 180,
            machine_snapshot_retention_hours: 12.0,
        }
    }
}

/// Score band thresholds and capture behavior.
///
/// Each threshold is the minimum score to enter that band; scores below
/// `medium` are in the low band and are never tracked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BandsConfig {
    pub medium: u8,
    pub elevated: u8,
    pub high: u8,
    pub critical: u8,
    /// Tracking opens events at this band and above.
    pub tracking_band: Band,
    /// Forensic captures trigger at this band and above.
    pub forensics_band: Band,
    /// Samples between checkpoints in the medium band.
    pub medium_checkpoint_samples: u32,
    /// Samples between checkpoints in the elevated band.
    pub elevated_checkpoint_samples: u32,
    /// Seconds after a close during which the same PID cannot reopen an event.
    pub event_cooldown_seconds: f64,
    /// Consecutive below-threshold samples before an event closes.
    pub exit_stability_samples: u32,
}

impl Default for BandsConfig {
    fn default() -> Self {
        Self {
            medium: 30,
            elevated: 45,
            high: 60,
            critical: 80,
            tracking_band: Band::Medium,
            forensics_band: Band::Critical,
            medium_checkpoint_samples: 60,
            elevated_checkpoint_samples: 30,
            event_cooldown_seconds: 60.0,
            exit_stability_samples: 15,
        }
    }
}

impl BandsConfig {
    /// Band for a given score: the greatest threshold not exceeding it.
    pub fn classify(&self, score: u8) -> Band {
        if score >= self.critical {
            Band::Critical
        } else if score >= self.high {
            Band::High
        } else if score >= self.elevated {
            Band::Elevated
        } else if score >= self.medium {
            Band::Medium
        } else {
            Band::Low
        }
    }

    /// Minimum score for a band.
    pub fn threshold(&self, band: Band) -> u8 {
        match band {
            Band::Low => 0,
            Band::Medium => self.medium,
            Band::Elevated => self.elevated,
            Band::High => self.high,
            Band::Critical => self.critical,
        }
    }

    /// Minimum score at which tracking opens an event.
    pub fn tracking_threshold(&self) -> u8 {
        self.threshold(self.tracking_band)
    }

    /// Minimum score at which forensics trigger.
    pub fn forensics_threshold(&self) -> u8 {
        self.threshold(self.forensics_band)
    }

    fn validate(&self) -> Result<()> {
        if !(self.medium <= self.elevated
            && self.elevated <= self.high
            && self.high <= self.critical)
        {
            return Err(Error::Config(format!(
                "band thresholds must be ascending: medium={} elevated={} high={} critical={}",
                self.medium, self.elevated, self.high, self.critical
            )));
        }
        Ok(())
    }
}

/// Post-score multipliers based on process state, applied after the base
/// score calculation.
///
/// Reasoning:
/// - running/stuck (1.0): actively executing, full weight
/// - sleeping (0.75): may be I/O-bound; sleeping with a high disk rate matters
/// - idle (0.3): brief transitional state during process creation
/// - stopped (0.2): frozen, cannot execute until resumed
/// - zombie (0.0): dead; metrics are stale history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMultipliers {
    pub idle: f64,
    pub sleeping: f64,
    pub stopped: f64,
    pub zombie: f64,
    pub running: f64,
    pub stuck: f64,
}

impl Default for StateMultipliers {
    fn default() -> Self {
        Self {
            idle: 0.3,
            sleeping: 0.75,
            stopped: 0.2,
            zombie: 0.0,
            running: 1.0,
            stuck: 1.0,
        }
    }
}

impl StateMultipliers {
    /// Multiplier for a state, 1.0 for unknown states.
    pub fn get(&self, state: ProcessState) -> f64 {
        match state {
            ProcessState::Idle => self.idle,
            ProcessState::Sleeping => self.sleeping,
            ProcessState::Stopped => self.stopped,
            ProcessState::Zombie => self.zombie,
            ProcessState::Running => self.running,
            ProcessState::Stuck => self.stuck,
            ProcessState::Unknown => 1.0,
        }
    }
}

/// Maximum values for normalizing metrics to the 0-1 scale.
///
/// Each value is what counts as "maxed out" for that metric; a process at
/// the maximum scores 1.0 for that component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    /// CPU percent (natural max 100).
    pub cpu: f64,
    /// Memory footprint in gigabytes.
    pub mem_gb: f64,
    pub pageins_rate: f64,
    /// Disk bytes per second.
    pub disk_io_rate: f64,
    pub faults_rate: f64,
    pub csw_rate: f64,
    pub syscalls_rate: f64,
    pub mach_msgs_rate: f64,
    pub wakeups_rate: f64,
    /// ms runnable per second.
    pub runnable_time_rate: f64,
    /// ms interactive QoS per second.
    pub qos_interactive_rate: f64,
    /// ms GPU per second.
    pub gpu_time_rate: f64,
    pub zombie_children: f64,
    /// IPC below this incurs the stalled-pipeline penalty.
    pub ipc_min: f64,
    pub threads: f64,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            cpu: 100.0,
            mem_gb: 8.0,
            pageins_rate: 1000.0,
            disk_io_rate: 100.0 * 1024.0 * 1024.0,
            faults_rate: 10_000.0,
            csw_rate: 30_000.0,
            syscalls_rate: 30_000.0,
            mach_msgs_rate: 30_000.0,
            wakeups_rate: 1000.0,
            runnable_time_rate: 1000.0,
            qos_interactive_rate: 1000.0,
            gpu_time_rate: 1000.0,
            zombie_children: 10.0,
            ipc_min: 0.5,
            threads: 1000.0,
        }
    }
}

/// Scoring configuration: normalization maxima, state multipliers, and the
/// activity thresholds used for fair-share resource counting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub state_multipliers: StateMultipliers,
    pub normalization: NormalizationConfig,
    /// CPU percent at which a process counts as an active resource user.
    pub active_min_cpu: f64,
    /// Memory (MiB) at which a process counts as an active resource user.
    pub active_min_memory_mb: u64,
    /// Disk bytes/sec above which a process counts as an active resource user.
    pub active_min_disk_io: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            state_multipliers: StateMultipliers::default(),
            normalization: NormalizationConfig::default(),
            active_min_cpu: 0.01,
            active_min_memory_mb: 256,
            active_min_disk_io: 0.0,
        }
    }
}

/// Rogue selection: stuck processes are always included, remaining slots go
/// to the top scorers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RogueSelectionConfig {
    /// Maximum rogues emitted per sample.
    pub max_count: usize,
}

impl Default for RogueSelectionConfig {
    fn default() -> Self {
        Self { max_count: 20 }
    }
}

/// Main configuration container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub retention: RetentionConfig,
    pub system: SystemConfig,
    pub bands: BandsConfig,
    pub scoring: ScoringConfig,
    pub rogue_selection: RogueSelectionConfig,
    /// Directory for privileged trace saves; must match the sudoers
    /// allow-list installed alongside the daemon. `None` means
    /// `<data_dir>/runtime`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retention: RetentionConfig::default(),
            system: SystemConfig::default(),
            bands: BandsConfig::default(),
            scoring: ScoringConfig::default(),
            rogue_selection: RogueSelectionConfig::default(),
            runtime_dir: None,
        }
    }
}

impl Config {
    /// Configuration directory (`~/.config/roguehound`).
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("roguehound")
    }

    /// Path to the config file.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Data directory (`~/.local/share/roguehound`).
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("roguehound")
    }

    pub fn db_path() -> PathBuf {
        Self::data_dir().join("data.db")
    }

    pub fn pid_path() -> PathBuf {
        Self::data_dir().join("daemon.pid")
    }

    pub fn socket_path() -> PathBuf {
        Self::data_dir().join("daemon.sock")
    }

    pub fn log_path() -> PathBuf {
        Self::data_dir().join("daemon.log")
    }

    /// Directory for privileged trace saves.
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("runtime"))
    }

    /// Load config from a TOML file, returning defaults for missing values
    /// and the full default config when the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let default_path = Self::config_path();
        let path = path.unwrap_or(&default_path);
        if !path.exists() {
            return Ok(Config::default());
        }

        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.bands.validate()?;
        Ok(config)
    }

    /// Save config as TOML, creating parent directories as needed.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let default_path = Self::config_path();
        let path = path.unwrap_or(&default_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
