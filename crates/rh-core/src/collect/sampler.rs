//! Per-tick process sampling.
//!
//! Each tick joins one rusage + task-info + bsd-info + GPU-time tuple per
//! PID, computes rates against the previous observation of the same PID,
//! tallies zombie children per parent, scores everything, and selects the
//! emitted rogues. All three kernel calls must succeed for a PID to be
//! included, which keeps one coherent tuple; any absence silently drops the
//! PID for this tick.

use std::collections::{HashMap, HashSet};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use tracing::trace;

use rh_common::{ProcessState, SampleSet};
use rh_config::Config;

use crate::collect::gpu::GpuSource;
use crate::collect::libproc::{ProcessDataSource, Timebase};
use crate::score::{summary_score, RawProcess, Scorer};

/// Previous cumulative counters for one PID, kept between ticks.
#[derive(Debug, Clone, Copy, Default)]
struct PrevSample {
    cpu_time_ns: u64,
    disk_io: u64,
    energy: u64,
    pageins: u64,
    csw: u64,
    syscalls: u64,
    mach_msgs: u64,
    wakeups: u64,
    faults: u64,
    /// mach-absolute units
    runnable_time: u64,
    /// mach-absolute units
    qos_interactive: u64,
    /// nanoseconds
    gpu_time: u64,
}

/// Collects process data via the OS adapters.
///
/// Owns the per-PID previous-sample map exclusively. `collect()` blocks for
/// the duration of the scan (~10-50 ms); the daemon runs it on its loop
/// thread, which is the only caller.
pub struct Sampler<P: ProcessDataSource, G: GpuSource> {
    source: P,
    gpu: G,
    scorer: Scorer,
    timebase: Timebase,
    prev: HashMap<u32, PrevSample>,
    last_collect: Option<Instant>,
}

impl<P: ProcessDataSource, G: GpuSource> Sampler<P, G> {
    pub fn new(source: P, gpu: G, config: &Config) -> Self {
        let timebase = source.timebase();
        Self {
            source,
            gpu,
            scorer: Scorer::new(config),
            timebase,
            prev: HashMap::new(),
            last_collect: None,
        }
    }

    /// One sampling tick.
    pub fn collect(&mut self) -> SampleSet {
        self.collect_at(Instant::now())
    }

    /// Tick against an explicit monotonic now (injectable for tests).
    pub fn collect_at(&mut self, now: Instant) -> SampleSet {
        let wall_delta_sec = match self.last_collect {
            Some(prev_t) => now.saturating_duration_since(prev_t).as_secs_f64(),
            None => 0.0,
        };
        self.last_collect = Some(now);
        let wall_delta_ns = wall_delta_sec * 1e9;

        let captured_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        // One GPU registry scan per cycle, best-effort.
        let gpu_usage = self.gpu.gpu_usage();

        let mut raws: Vec<RawProcess> = Vec::new();
        let mut current_pids: HashSet<u32> = HashSet::new();

        for pid in self.source.list_all_pids() {
            if pid == 0 {
                continue;
            }

            // The three calls must all succeed for one coherent tuple.
            let Some(rusage) = self.source.rusage(pid) else {
                continue;
            };
            let Some(task) = self.source.task_info(pid) else {
                continue;
            };
            let Some(bsd) = self.source.bsd_info(pid) else {
                continue;
            };

            current_pids.insert(pid);

            let user_ns = self.timebase.abs_to_ns(rusage.user_time);
            let system_ns = self.timebase.abs_to_ns(rusage.system_time);
            let cpu_time_ns = user_ns + system_ns;

            let disk_io = rusage.diskio_bytesread + rusage.diskio_byteswritten;
            let energy = rusage.billed_energy;
            let pageins = rusage.pageins;
            let csw = task.csw;
            let syscalls = task.syscalls_mach + task.syscalls_unix;
            let mach_msgs = task.messages_sent + task.messages_received;
            let wakeups = rusage.pkg_idle_wkups + rusage.interrupt_wkups;
            let faults = task.faults;
            let runnable_time = rusage.runnable_time;
            let qos_interactive = rusage.qos_user_interactive;
            let gpu_time = gpu_usage.get(&pid).copied().unwrap_or(0);

            let mut cpu_percent = 0.0;
            let mut disk_io_rate = 0.0;
            let mut energy_rate = 0.0;
            let mut pageins_rate = 0.0;
            let mut csw_rate = 0.0;
            let mut syscalls_rate = 0.0;
            let mut mach_msgs_rate = 0.0;
            let mut wakeups_rate = 0.0;
            let mut faults_rate = 0.0;
            let mut runnable_time_rate = 0.0;
            let mut qos_interactive_rate = 0.0;
            let mut gpu_time_rate = 0.0;

            if wall_delta_sec > 0.0 {
                if let Some(prev) = self.prev.get(&pid) {
                    if cpu_time_ns > prev.cpu_time_ns {
                        cpu_percent =
                            ((cpu_time_ns - prev.cpu_time_ns) as f64 / wall_delta_ns) * 100.0;
                    }

                    let per_sec = |cur: u64, old: u64| -> f64 {
                        if cur > old {
                            (cur - old) as f64 / wall_delta_sec
                        } else {
                            0.0
                        }
                    };
                    disk_io_rate = per_sec(disk_io, prev.disk_io);
                    energy_rate = per_sec(energy, prev.energy);
                    pageins_rate = per_sec(pageins, prev.pageins);
                    csw_rate = per_sec(csw, prev.csw);
                    syscalls_rate = per_sec(syscalls, prev.syscalls);
                    mach_msgs_rate = per_sec(mach_msgs, prev.mach_msgs);
                    wakeups_rate = per_sec(wakeups, prev.wakeups);
                    faults_rate = per_sec(faults, prev.faults);

                    // runnable/QoS are mach units: delta → ns → ms per second.
                    if runnable_time > prev.runnable_time {
                        let delta_ns = self.timebase.abs_to_ns(runnable_time - prev.runnable_time);
                        runnable_time_rate = (delta_ns as f64 / 1e6) / wall_delta_sec;
                    }
                    if qos_interactive > prev.qos_interactive {
                        let delta_ns =
                            self.timebase.abs_to_ns(qos_interactive - prev.qos_interactive);
                        qos_interactive_rate = (delta_ns as f64 / 1e6) / wall_delta_sec;
                    }
                    // GPU time is already nanoseconds.
                    if gpu_time > prev.gpu_time {
                        gpu_time_rate = ((gpu_time - prev.gpu_time) as f64 / 1e6) / wall_delta_sec;
                    }
                }
            }

            self.prev.insert(
                pid,
                PrevSample {
                    cpu_time_ns,
                    disk_io,
                    energy,
                    pageins,
                    csw,
                    syscalls,
                    mach_msgs,
                    wakeups,
                    faults,
                    runnable_time,
                    qos_interactive,
                    gpu_time,
                },
            );

            let mut command = self.source.process_name(pid);
            if command.is_empty() {
                command = bsd.comm.clone();
            }
            if command.is_empty() {
                command = format!("pid_{pid}");
            }

            let instructions = rusage.instructions;
            let cycles = rusage.cycles;
            let ipc = if cycles > 0 {
                instructions as f64 / cycles as f64
            } else {
                0.0
            };

            raws.push(RawProcess {
                pid,
                ppid: bsd.ppid,
                command,
                captured_at,
                cpu: cpu_percent,
                mem: rusage.phys_footprint,
                mem_peak: rusage.lifetime_max_phys_footprint,
                pageins,
                pageins_rate,
                faults,
                faults_rate,
                disk_io,
                disk_io_rate,
                csw,
                csw_rate,
                syscalls,
                syscalls_rate,
                threads: task.threadnum,
                mach_msgs,
                mach_msgs_rate,
                instructions,
                cycles,
                ipc,
                energy,
                energy_rate,
                wakeups,
                wakeups_rate,
                runnable_time,
                runnable_time_rate,
                qos_interactive,
                qos_interactive_rate,
                gpu_time,
                gpu_time_rate,
                zombie_children: 0,
                state: ProcessState::from_status(bsd.status),
                priority: task.priority,
            });
        }

        // Prune previous-sample state for departed PIDs.
        self.prev.retain(|pid, _| current_pids.contains(pid));

        // A parent with many zombie children is not reaping them.
        let mut zombie_count: HashMap<u32, u32> = HashMap::new();
        for raw in &raws {
            if raw.state == ProcessState::Zombie {
                *zombie_count.entry(raw.ppid).or_insert(0) += 1;
            }
        }
        for raw in &mut raws {
            raw.zombie_children = zombie_count.get(&raw.pid).copied().unwrap_or(0);
        }

        let process_count = raws.len();
        let scored = self.scorer.score_all(&raws);
        let rogues = self.scorer.select_rogues(scored);
        let max_score = summary_score(&rogues);
        let elapsed_ms = now.elapsed().as_millis() as u64;

        trace!(process_count, max_score, elapsed_ms, "sample collected");

        SampleSet {
            timestamp: Utc::now(),
            elapsed_ms,
            process_count,
            max_score,
            rogues,
        }
    }

    /// Number of PIDs with retained previous-sample state.
    pub fn prev_len(&self) -> usize {
        self.prev.len()
    }

    /// The underlying OS adapter (also used by the daemon for the
    /// single-instance guard and boot time).
    pub fn source(&self) -> &P {
        &self.source
    }

    /// Mutable adapter access, for tests that evolve the process table
    /// between ticks.
    pub fn source_mut(&mut self) -> &mut P {
        &mut self.source
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }
}
