//! Resource-disproportionality scoring.
//!
//! Raw per-PID metrics become a 0-100 score through four weighted stress
//! categories, then a categorical band and per-resource fair shares:
//!
//! - Blocking (40%): things that cause pauses (paging, disk, faults, GPU)
//! - Contention (30%): fighting for the scheduler (runnable, csw, cpu, QoS)
//! - Pressure (20%): stressing system resources (memory, wakeups, syscalls,
//!   mach messages, unreaped zombie children)
//! - Efficiency (10%): wasting resources (stalled pipeline, thread bloat)
//!
//! Shares are fair-share normalized: `share_X = (X / total_X) / (1 / active)`
//! where `active` counts non-idle processes using measurable resources. A
//! share of 1.0 is exactly a fair slice; 10.0 is ten slices.

use std::collections::HashMap;

use rh_common::{DominantResource, ProcessScore, ProcessState};
use rh_config::{BandsConfig, Config, NormalizationConfig, RogueSelectionConfig, ScoringConfig};

/// One process's raw metrics for a tick, before scoring.
///
/// Built by the sampler; consumed here. Field meanings match
/// [`ProcessScore`] minus the scoring outputs, plus the parent PID used for
/// the zombie-children tally.
#[derive(Debug, Clone, Default)]
pub struct RawProcess {
    pub pid: u32,
    pub ppid: u32,
    pub command: String,
    pub captured_at: f64,
    pub cpu: f64,
    pub mem: u64,
    pub mem_peak: u64,
    pub pageins: u64,
    pub pageins_rate: f64,
    pub faults: u64,
    pub faults_rate: f64,
    pub disk_io: u64,
    pub disk_io_rate: f64,
    pub csw: u64,
    pub csw_rate: f64,
    pub syscalls: u64,
    pub syscalls_rate: f64,
    pub threads: u32,
    pub mach_msgs: u64,
    pub mach_msgs_rate: f64,
    pub instructions: u64,
    pub cycles: u64,
    pub ipc: f64,
    pub energy: u64,
    pub energy_rate: f64,
    pub wakeups: u64,
    pub wakeups_rate: f64,
    pub runnable_time: u64,
    pub runnable_time_rate: f64,
    pub qos_interactive: u64,
    pub qos_interactive_rate: f64,
    pub gpu_time: u64,
    pub gpu_time_rate: f64,
    pub zombie_children: u32,
    pub state: ProcessState,
    pub priority: i32,
}

/// Per-resource fair-share multiples for one process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Shares {
    pub cpu: f64,
    pub gpu: f64,
    pub mem: f64,
    pub disk: f64,
    pub wakeups: f64,
}

impl Shares {
    /// (dominant resource, its share) with the fixed tie order
    /// cpu, gpu, memory, disk, wakeups.
    pub fn dominant(&self) -> (DominantResource, f64) {
        let ordered = [
            (DominantResource::Cpu, self.cpu),
            (DominantResource::Gpu, self.gpu),
            (DominantResource::Memory, self.mem),
            (DominantResource::Disk, self.disk),
            (DominantResource::Wakeups, self.wakeups),
        ];
        let mut best = ordered[0];
        for candidate in &ordered[1..] {
            if candidate.1 > best.1 {
                best = *candidate;
            }
        }
        best
    }
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

fn norm(value: f64, max: f64) -> f64 {
    if max > 0.0 {
        clamp01(value / max)
    } else {
        0.0
    }
}

/// Count processes that are "active" for the fair-share denominator.
///
/// Active means non-idle AND using measurable resources (CPU, memory, or
/// disk above the configured floors). Returns at least 1.
pub fn count_active_processes(processes: &[RawProcess], scoring: &ScoringConfig) -> usize {
    let mem_threshold = scoring.active_min_memory_mb * 1_048_576;
    let count = processes
        .iter()
        .filter(|p| p.state != ProcessState::Idle)
        .filter(|p| {
            p.cpu >= scoring.active_min_cpu
                || p.mem >= mem_threshold
                || p.disk_io_rate > scoring.active_min_disk_io
        })
        .count();
    count.max(1)
}

/// Compute fair-share multiples for every process against the whole set.
pub fn calculate_resource_shares(
    processes: &[RawProcess],
    active_count: usize,
) -> HashMap<u32, Shares> {
    let fair_share = 1.0 / active_count.max(1) as f64;

    let total_cpu: f64 = processes.iter().map(|p| p.cpu).sum();
    let total_gpu: f64 = processes.iter().map(|p| p.gpu_time_rate).sum();
    let total_mem: f64 = processes.iter().map(|p| p.mem as f64).sum();
    let total_disk: f64 = processes.iter().map(|p| p.disk_io_rate).sum();
    let total_wakeups: f64 = processes.iter().map(|p| p.wakeups_rate).sum();

    let fraction = |value: f64, total: f64| if total > 0.0 { value / total } else { 0.0 };

    processes
        .iter()
        .map(|p| {
            let shares = Shares {
                cpu: fraction(p.cpu, total_cpu) / fair_share,
                gpu: fraction(p.gpu_time_rate, total_gpu) / fair_share,
                mem: fraction(p.mem as f64, total_mem) / fair_share,
                disk: fraction(p.disk_io_rate, total_disk) / fair_share,
                wakeups: fraction(p.wakeups_rate, total_wakeups) / fair_share,
            };
            (p.pid, shares)
        })
        .collect()
}

/// Category scores before weighting, each in [0, 100].
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryScores {
    pub blocking: f64,
    pub contention: f64,
    pub pressure: f64,
    pub efficiency: f64,
}

/// Scores a tick's worth of processes and selects rogues.
#[derive(Debug, Clone)]
pub struct Scorer {
    scoring: ScoringConfig,
    bands: BandsConfig,
    selection: RogueSelectionConfig,
}

impl Scorer {
    pub fn new(config: &Config) -> Self {
        Self {
            scoring: config.scoring.clone(),
            bands: config.bands.clone(),
            selection: config.rogue_selection.clone(),
        }
    }

    pub fn bands(&self) -> &BandsConfig {
        &self.bands
    }

    /// Four stress-category scores for one process.
    pub fn category_scores(&self, p: &RawProcess) -> CategoryScores {
        let n: &NormalizationConfig = &self.scoring.normalization;

        // Blocking: things that cause pauses. Stuck is an automatic max.
        let blocking = if p.state == ProcessState::Stuck {
            100.0
        } else {
            norm(p.pageins_rate, n.pageins_rate) * 30.0
                + norm(p.disk_io_rate, n.disk_io_rate) * 30.0
                + norm(p.faults_rate, n.faults_rate) * 20.0
                + norm(p.gpu_time_rate, n.gpu_time_rate) * 20.0
        };

        // Contention: fighting for the scheduler.
        let contention = norm(p.runnable_time_rate, n.runnable_time_rate) * 30.0
            + norm(p.csw_rate, n.csw_rate) * 30.0
            + norm(p.cpu, n.cpu) * 25.0
            + norm(p.qos_interactive_rate, n.qos_interactive_rate) * 15.0;

        // Pressure: stressing system resources.
        let pressure = norm(p.mem as f64, n.mem_gb * 1024.0 * 1024.0 * 1024.0) * 30.0
            + norm(p.wakeups_rate, n.wakeups_rate) * 25.0
            + norm(p.syscalls_rate, n.syscalls_rate) * 15.0
            + norm(p.mach_msgs_rate, n.mach_msgs_rate) * 15.0
            + norm(p.zombie_children as f64, n.zombie_children) * 15.0;

        // Efficiency: low IPC with real cycles is a stalled pipeline.
        let ipc_penalty = if p.ipc < n.ipc_min && n.ipc_min > 0.0 {
            (1.0 - p.ipc / n.ipc_min).max(0.0)
        } else {
            0.0
        };
        let has_cycles = if p.cycles > 0 { 1.0 } else { 0.0 };
        let efficiency = ipc_penalty * has_cycles * 60.0 + norm(p.threads as f64, n.threads) * 40.0;

        CategoryScores {
            blocking,
            contention,
            pressure,
            efficiency,
        }
    }

    /// Weighted combination, state multiplier, and integer clamp.
    pub fn final_score(&self, p: &RawProcess) -> u8 {
        let c = self.category_scores(p);
        let base = c.blocking * 0.40 + c.contention * 0.30 + c.pressure * 0.20 + c.efficiency * 0.10;
        let multiplied = base * self.scoring.state_multipliers.get(p.state);
        (multiplied as i64).clamp(0, 100) as u8
    }

    /// Score every process, attaching band, shares, and dominant resource.
    pub fn score_all(&self, processes: &[RawProcess]) -> Vec<ProcessScore> {
        let active = count_active_processes(processes, &self.scoring);
        let shares = calculate_resource_shares(processes, active);

        processes
            .iter()
            .map(|p| {
                let score = self.final_score(p);
                let share = shares.get(&p.pid).copied().unwrap_or_default();
                let (dominant_resource, disproportionality) = share.dominant();
                ProcessScore {
                    pid: p.pid,
                    command: p.command.clone(),
                    captured_at: p.captured_at,
                    cpu: p.cpu,
                    mem: p.mem,
                    mem_peak: p.mem_peak,
                    pageins: p.pageins,
                    pageins_rate: p.pageins_rate,
                    faults: p.faults,
                    faults_rate: p.faults_rate,
                    disk_io: p.disk_io,
                    disk_io_rate: p.disk_io_rate,
                    csw: p.csw,
                    csw_rate: p.csw_rate,
                    syscalls: p.syscalls,
                    syscalls_rate: p.syscalls_rate,
                    threads: p.threads,
                    mach_msgs: p.mach_msgs,
                    mach_msgs_rate: p.mach_msgs_rate,
                    instructions: p.instructions,
                    cycles: p.cycles,
                    ipc: p.ipc,
                    energy: p.energy,
                    energy_rate: p.energy_rate,
                    wakeups: p.wakeups,
                    wakeups_rate: p.wakeups_rate,
                    runnable_time: p.runnable_time,
                    runnable_time_rate: p.runnable_time_rate,
                    qos_interactive: p.qos_interactive,
                    qos_interactive_rate: p.qos_interactive_rate,
                    gpu_time: p.gpu_time,
                    gpu_time_rate: p.gpu_time_rate,
                    zombie_children: p.zombie_children,
                    state: p.state,
                    priority: p.priority,
                    score,
                    band: self.bands.classify(score),
                    cpu_share: share.cpu,
                    gpu_share: share.gpu,
                    mem_share: share.mem,
                    disk_share: share.disk,
                    wakeups_share: share.wakeups,
                    disproportionality,
                    dominant_resource,
                }
            })
            .collect()
    }

    /// Select emitted rogues: every stuck process first (score descending),
    /// then top scorers into the remaining slots up to `max_count`.
    pub fn select_rogues(&self, scored: Vec<ProcessScore>) -> Vec<ProcessScore> {
        let (mut stuck, mut rest): (Vec<ProcessScore>, Vec<ProcessScore>) = scored
            .into_iter()
            .partition(|p| p.state == ProcessState::Stuck);

        stuck.sort_by(|a, b| b.score.cmp(&a.score));
        rest.sort_by(|a, b| b.score.cmp(&a.score));

        stuck
            .into_iter()
            .chain(rest)
            .take(self.selection.max_count)
            .collect()
    }
}

/// Hybrid summary: `max(peak, rms)` over the emitted rogues, 0 when empty.
///
/// A single bad actor stays visible through peak; broad load can push the
/// summary higher through rms without averaging the peak away.
pub fn summary_score(rogues: &[ProcessScore]) -> u8 {
    if rogues.is_empty() {
        return 0;
    }
    let peak = rogues.iter().map(|p| p.score).max().unwrap_or(0);
    let sum_sq: f64 = rogues.iter().map(|p| (p.score as f64).powi(2)).sum();
    let rms = (sum_sq / rogues.len() as f64).sqrt() as u8;
    peak.max(rms)
}
