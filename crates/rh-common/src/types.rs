//! Core data model: severity bands, process states, and sample records.
//!
//! `ProcessScore` is THE canonical per-process record. Every component
//! (scorer, ring buffer, tracker, storage, wire protocol) consumes this one
//! shape; do not create alternative representations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Severity bands
// ---------------------------------------------------------------------------

/// Severity band derived from a 0-100 score.
///
/// Ordering follows severity: `Low < Medium < Elevated < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    #[default]
    Low,
    Medium,
    Elevated,
    High,
    Critical,
}

impl Band {
    /// All bands in ascending severity.
    pub const ALL: [Band; 5] = [
        Band::Low,
        Band::Medium,
        Band::Elevated,
        Band::High,
        Band::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Band::Low => "low",
            Band::Medium => "medium",
            Band::Elevated => "elevated",
            Band::High => "high",
            Band::Critical => "critical",
        }
    }

    /// Parse a band name as used in config files and the schema.
    pub fn parse(s: &str) -> Option<Band> {
        match s {
            "low" => Some(Band::Low),
            "medium" => Some(Band::Medium),
            "elevated" => Some(Band::Elevated),
            "high" => Some(Band::High),
            "critical" => Some(Band::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Process state
// ---------------------------------------------------------------------------

/// BSD process state as reported by the per-process kernel API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Process being created (SIDL).
    Idle,
    /// Currently runnable (SRUN).
    Running,
    /// Sleeping on an address (SSLEEP).
    Sleeping,
    /// Stopped by SIGSTOP or a debugger (SSTOP).
    Stopped,
    /// Dead, awaiting collection by parent (SZOMB).
    Zombie,
    /// Marked by the kernel as not making forward progress.
    Stuck,
    /// Status code outside the known set.
    #[default]
    Unknown,
}

impl ProcessState {
    /// Map a `pbi_status` value to a state name.
    pub fn from_status(status: u32) -> ProcessState {
        match status {
            1 => ProcessState::Idle,
            2 => ProcessState::Running,
            3 => ProcessState::Sleeping,
            4 => ProcessState::Stopped,
            5 => ProcessState::Zombie,
            6 => ProcessState::Stuck,
            _ => ProcessState::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Idle => "idle",
            ProcessState::Running => "running",
            ProcessState::Sleeping => "sleeping",
            ProcessState::Stopped => "stopped",
            ProcessState::Zombie => "zombie",
            ProcessState::Stuck => "stuck",
            ProcessState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> ProcessState {
        match s {
            "idle" => ProcessState::Idle,
            "running" => ProcessState::Running,
            "sleeping" => ProcessState::Sleeping,
            "stopped" => ProcessState::Stopped,
            "zombie" => ProcessState::Zombie,
            "stuck" => ProcessState::Stuck,
            _ => ProcessState::Unknown,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Dominant resource
// ---------------------------------------------------------------------------

/// The resource whose share realizes a process's disproportionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DominantResource {
    #[default]
    Cpu,
    Gpu,
    Memory,
    Disk,
    Wakeups,
}

impl DominantResource {
    pub fn as_str(self) -> &'static str {
        match self {
            DominantResource::Cpu => "cpu",
            DominantResource::Gpu => "gpu",
            DominantResource::Memory => "memory",
            DominantResource::Disk => "disk",
            DominantResource::Wakeups => "wakeups",
        }
    }

    pub fn parse(s: &str) -> Option<DominantResource> {
        match s {
            "cpu" => Some(DominantResource::Cpu),
            "gpu" => Some(DominantResource::Gpu),
            "memory" => Some(DominantResource::Memory),
            "disk" => Some(DominantResource::Disk),
            "wakeups" => Some(DominantResource::Wakeups),
            _ => None,
        }
    }
}

impl fmt::Display for DominantResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Snapshot type / capture status
// ---------------------------------------------------------------------------

/// Why a process snapshot was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Entry,
    Checkpoint,
    Exit,
}

impl SnapshotType {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotType::Entry => "entry",
            SnapshotType::Checkpoint => "checkpoint",
            SnapshotType::Exit => "exit",
        }
    }
}

/// Outcome of one forensic capture step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Success,
    Failed,
}

impl CaptureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureStatus::Success => "success",
            CaptureStatus::Failed => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessScore
// ---------------------------------------------------------------------------

/// Single process observed at one instant, with scoring outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessScore {
    // Identity
    pub pid: u32,
    pub command: String,
    /// Seconds since epoch at capture (fractional).
    pub captured_at: f64,

    // CPU
    /// Percent busy since the previous observation of this PID.
    pub cpu: f64,

    // Memory
    pub mem: u64,
    /// Lifetime peak physical footprint.
    pub mem_peak: u64,
    pub pageins: u64,
    pub pageins_rate: f64,
    pub faults: u64,
    pub faults_rate: f64,

    // Disk I/O (read + written, cumulative bytes)
    pub disk_io: u64,
    pub disk_io_rate: f64,

    // Activity
    pub csw: u64,
    pub csw_rate: f64,
    pub syscalls: u64,
    pub syscalls_rate: f64,
    pub threads: u32,
    pub mach_msgs: u64,
    pub mach_msgs_rate: f64,

    // Efficiency
    pub instructions: u64,
    pub cycles: u64,
    /// instructions / cycles, 0.0 when cycles == 0.
    pub ipc: f64,

    // Power
    pub energy: u64,
    pub energy_rate: f64,
    pub wakeups: u64,
    pub wakeups_rate: f64,

    // Contention
    /// Cumulative runnable time (ns).
    pub runnable_time: u64,
    /// ms runnable per second.
    pub runnable_time_rate: f64,
    /// Cumulative QoS user-interactive time (ns).
    pub qos_interactive: u64,
    /// ms interactive per second.
    pub qos_interactive_rate: f64,

    // GPU
    /// Cumulative GPU time (ns).
    pub gpu_time: u64,
    /// ms GPU per second.
    pub gpu_time_rate: f64,

    // Zombie children (parent not reaping, a potential bug indicator)
    pub zombie_children: u32,

    // State
    pub state: ProcessState,
    pub priority: i32,

    // Scoring
    /// Final weighted score, 0-100.
    pub score: u8,
    pub band: Band,
    pub cpu_share: f64,
    pub gpu_share: f64,
    pub mem_share: f64,
    pub disk_share: f64,
    pub wakeups_share: f64,
    /// Highest resource share (max of the five above).
    pub disproportionality: f64,
    pub dominant_resource: DominantResource,
}

impl ProcessScore {
    /// The five resource shares in fixed argmax tie order.
    pub fn shares(&self) -> [(DominantResource, f64); 5] {
        [
            (DominantResource::Cpu, self.cpu_share),
            (DominantResource::Gpu, self.gpu_share),
            (DominantResource::Memory, self.mem_share),
            (DominantResource::Disk, self.disk_share),
            (DominantResource::Wakeups, self.wakeups_share),
        ]
    }
}

// ---------------------------------------------------------------------------
// SampleSet
// ---------------------------------------------------------------------------

/// One sampler tick: the selected rogues plus summary fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSet {
    /// Wall clock at the start of the tick (ISO8601 on the wire).
    pub timestamp: DateTime<Utc>,
    /// How long the tick took.
    pub elapsed_ms: u64,
    /// Total processes observed this tick.
    pub process_count: usize,
    /// Hybrid max(peak, rms) over the emitted rogues.
    pub max_score: u8,
    /// Selected processes, stuck first, then score descending.
    pub rogues: Vec<ProcessScore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_score(pid: u32, score: u8) -> ProcessScore {
        ProcessScore {
            pid,
            command: format!("proc{pid}"),
            captured_at: 1_700_000_000.25,
            cpu: 12.5,
            mem: 1024 * 1024,
            mem_peak: 2 * 1024 * 1024,
            pageins: 10,
            pageins_rate: 1.0,
            faults: 100,
            faults_rate: 4.0,
            disk_io: 4096,
            disk_io_rate: 512.0,
            csw: 50,
            csw_rate: 5.0,
            syscalls: 200,
            syscalls_rate: 20.0,
            threads: 4,
            mach_msgs: 30,
            mach_msgs_rate: 3.0,
            instructions: 1_000_000,
            cycles: 2_000_000,
            ipc: 0.5,
            energy: 999,
            energy_rate: 9.0,
            wakeups: 40,
            wakeups_rate: 4.0,
            runnable_time: 5_000_000,
            runnable_time_rate: 1.5,
            qos_interactive: 1_000_000,
            qos_interactive_rate: 0.5,
            gpu_time: 0,
            gpu_time_rate: 0.0,
            zombie_children: 0,
            state: ProcessState::Running,
            priority: 31,
            score,
            band: Band::Medium,
            cpu_share: 2.0,
            gpu_share: 0.0,
            mem_share: 0.5,
            disk_share: 0.25,
            wakeups_share: 0.1,
            disproportionality: 2.0,
            dominant_resource: DominantResource::Cpu,
        }
    }

    #[test]
    fn band_ordering_follows_severity() {
        assert!(Band::Low < Band::Medium);
        assert!(Band::Medium < Band::Elevated);
        assert!(Band::Elevated < Band::High);
        assert!(Band::High < Band::Critical);
    }

    #[test]
    fn band_serde_uses_snake_case() {
        assert_eq!(serde_json::to_string(&Band::Elevated).unwrap(), "\"elevated\"");
        let b: Band = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(b, Band::Critical);
    }

    #[test]
    fn band_parse_round_trips() {
        for band in Band::ALL {
            assert_eq!(Band::parse(band.as_str()), Some(band));
        }
        assert_eq!(Band::parse("halted"), None);
    }

    #[test]
    fn state_from_status_fixed_map() {
        assert_eq!(ProcessState::from_status(1), ProcessState::Idle);
        assert_eq!(ProcessState::from_status(2), ProcessState::Running);
        assert_eq!(ProcessState::from_status(3), ProcessState::Sleeping);
        assert_eq!(ProcessState::from_status(4), ProcessState::Stopped);
        assert_eq!(ProcessState::from_status(5), ProcessState::Zombie);
        assert_eq!(ProcessState::from_status(6), ProcessState::Stuck);
        assert_eq!(ProcessState::from_status(0), ProcessState::Unknown);
        assert_eq!(ProcessState::from_status(99), ProcessState::Unknown);
    }

    #[test]
    fn dominant_resource_serde() {
        assert_eq!(
            serde_json::to_string(&DominantResource::Wakeups).unwrap(),
            "\"wakeups\""
        );
        assert_eq!(DominantResource::parse("memory"), Some(DominantResource::Memory));
        assert_eq!(DominantResource::parse("net"), None);
    }

    #[test]
    fn process_score_json_round_trip_preserves_every_field() {
        let original = sample_score(42, 77);
        let json = serde_json::to_string(&original).unwrap();
        let restored: ProcessScore = serde_json::from_str(&json).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn sample_set_round_trip() {
        let set = SampleSet {
            timestamp: Utc::now(),
            elapsed_ms: 18,
            process_count: 321,
            max_score: 64,
            rogues: vec![sample_score(1, 64), sample_score(2, 12)],
        };
        let json = serde_json::to_string(&set).unwrap();
        let restored: SampleSet = serde_json::from_str(&json).unwrap();
        assert_eq!(set, restored);
    }

    #[test]
    fn shares_are_in_fixed_tie_order() {
        let score = sample_score(1, 10);
        let order: Vec<DominantResource> = score.shares().iter().map(|(r, _)| *r).collect();
        assert_eq!(
            order,
            vec![
                DominantResource::Cpu,
                DominantResource::Gpu,
                DominantResource::Memory,
                DominantResource::Disk,
                DominantResource::Wakeups,
            ]
        );
    }
}
