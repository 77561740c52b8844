//! Daemon runtime: the fixed-period loop gluing sampler → ring → tracker →
//! server, plus the single-instance guard, signal-driven shutdown, and
//! periodic pruning.
//!
//! Within a tick, `ring.push` strictly precedes `tracker.update`, which
//! strictly precedes `broadcast`, so clients observe samples in
//! advancing order. The forensics callback only enqueues work; the capture
//! worker never blocks a tick.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tracing::{info, warn};

use rh_common::{Band, Error, Result, SampleSet};
use rh_config::Config;

use crate::collect::gpu::GpuSource;
use crate::collect::libproc::ProcessDataSource;
use crate::collect::Sampler;
use crate::forensics::capture::{disable_tracer, ensure_tracer_enabled};
use crate::forensics::{Debounce, ForensicsConfig, ForensicsJob, ForensicsWorker, SystemTools};
use crate::ring::RingBuffer;
use crate::server::PushServer;
use crate::storage;
use crate::track::{ForensicsCallback, ProcessTracker};

// macOS QoS class constants (pthread/qos.h). USER_INITIATED keeps the
// sampling thread's timers from being coalesced and its I/O from being
// demoted under load; it does not require root.
#[cfg(target_os = "macos")]
const QOS_CLASS_USER_INITIATED: u32 = 0x19;

#[cfg(target_os = "macos")]
extern "C" {
    fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: i32) -> i32;
}

/// Raise the scheduling class of the current thread.
pub fn raise_qos() -> bool {
    #[cfg(target_os = "macos")]
    {
        unsafe { pthread_set_qos_class_self_np(QOS_CLASS_USER_INITIATED, 0) == 0 }
    }
    #[cfg(not(target_os = "macos"))]
    {
        false
    }
}

/// Peak RSS of this process in MiB.
fn max_rss_mb() -> f64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return 0.0;
    }
    // ru_maxrss is bytes on macOS, kilobytes elsewhere.
    #[cfg(target_os = "macos")]
    {
        usage.ru_maxrss as f64 / (1024.0 * 1024.0)
    }
    #[cfg(not(target_os = "macos"))]
    {
        usage.ru_maxrss as f64 / 1024.0
    }
}

// ---------------------------------------------------------------------------
// Single-instance guard
// ---------------------------------------------------------------------------

/// Verify no other daemon owns the PID file.
///
/// A live PID whose command name looks like this daemon aborts startup; a
/// stale or unparseable file is removed. Name lookup goes through the
/// process adapter, so a recycled PID belonging to a different program does
/// not block startup after a reboot.
pub fn check_single_instance(pid_path: &Path, name_of: impl Fn(u32) -> String) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }
    let text = std::fs::read_to_string(pid_path)?;
    let Ok(pid) = text.trim().parse::<u32>() else {
        warn!("removing unparseable pid file");
        std::fs::remove_file(pid_path)?;
        return Ok(());
    };

    let name = name_of(pid);
    if name.to_lowercase().contains("roguehound") {
        return Err(Error::AlreadyRunning { pid });
    }
    if name.is_empty() {
        info!(pid, "removing stale pid file (process gone)");
    } else {
        info!(pid, name = %name, "removing stale pid file (pid recycled)");
    }
    std::fs::remove_file(pid_path)?;
    Ok(())
}

fn write_pid_file(pid_path: &Path) -> Result<()> {
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(pid_path, std::process::id().to_string())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Band-transition logging with a stability filter
// ---------------------------------------------------------------------------

/// What the filter decided to log for one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BandTransition {
    Entered { band: Band },
    Exited,
}

#[derive(Debug, Clone)]
struct BandLogState {
    logged_band: Band,
    current_band: Band,
    consecutive: u32,
    last_seen: u64,
}

/// Suppresses flappy band-transition log lines: a rogue's entry at a higher
/// band is logged only after N consecutive samples there, and its exit back
/// to low symmetrically.
pub struct BandLogFilter {
    stability: u32,
    sample_count: u64,
    tracked: HashMap<u32, BandLogState>,
}

/// Entries unseen for this many samples are forgotten (~8 min at 3 Hz).
const STALE_SAMPLES: u64 = 1500;

impl BandLogFilter {
    pub fn new(stability: u32) -> Self {
        Self {
            stability: stability.max(1),
            sample_count: 0,
            tracked: HashMap::new(),
        }
    }

    /// Advance the per-tick sample counter and prune stale entries.
    pub fn tick(&mut self) {
        self.sample_count += 1;
        let cutoff = self.sample_count;
        self.tracked
            .retain(|_, s| cutoff - s.last_seen < STALE_SAMPLES);
    }

    /// Observe one rogue; returns a transition when it became loggable.
    pub fn observe(&mut self, pid: u32, band: Band) -> Option<BandTransition> {
        let state = self.tracked.entry(pid).or_insert(BandLogState {
            logged_band: Band::Low,
            current_band: Band::Low,
            consecutive: 0,
            last_seen: self.sample_count,
        });

        if band == state.current_band {
            state.consecutive += 1;
        } else {
            state.current_band = band;
            state.consecutive = 1;
        }
        state.last_seen = self.sample_count;

        if band > state.logged_band && band != Band::Low && state.consecutive >= self.stability {
            state.logged_band = band;
            return Some(BandTransition::Entered { band });
        }
        if band == Band::Low && state.logged_band != Band::Low && state.consecutive >= self.stability
        {
            state.logged_band = Band::Low;
            return Some(BandTransition::Exited);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Main daemon orchestrating sampling and detection.
pub struct Daemon<P: ProcessDataSource, G: GpuSource> {
    config: Config,
    sampler: Sampler<P, G>,
    shutdown: Arc<AtomicBool>,
}

impl<P: ProcessDataSource, G: GpuSource> Daemon<P, G> {
    pub fn new(config: Config, source: P, gpu: G) -> Self {
        let sampler = Sampler::new(source, gpu, &config);
        Self {
            config,
            sampler,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared shutdown flag, set by the signal handler.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run until a shutdown signal. Boot time and the instance check go
    /// through the sampler's adapter, keeping OS access behind one seam.
    pub fn run(mut self) -> Result<()> {
        let bands = &self.config.bands;
        info!(
            version = env!("CARGO_PKG_VERSION"),
            ring = self.config.system.ring_buffer_size,
            tracking_threshold = bands.tracking_threshold(),
            medium = bands.medium,
            elevated = bands.elevated,
            high = bands.high,
            critical = bands.critical,
            "roguehound daemon starting"
        );

        if raise_qos() {
            info!("scheduling class raised to user-initiated");
        }

        let pid_path = Config::pid_path();
        check_single_instance(&pid_path, |pid| self.sampler.source().process_name(pid))?;
        write_pid_file(&pid_path)?;

        // Create a config file with defaults on first run.
        if !Config::config_path().exists() {
            self.config.save(None)?;
            info!(path = %Config::config_path().display(), "config file created");
        }

        let db_path = Config::db_path();
        storage::init_database(&db_path)?;
        let conn = storage::open(&db_path)?;

        let boot_time = self.sampler.source().boot_time()?;

        ensure_tracer_enabled();

        let server = PushServer::start(Config::socket_path())?;

        let worker = ForensicsWorker::spawn(
            db_path.clone(),
            ForensicsConfig {
                runtime_dir: self.config.runtime_dir(),
                log_seconds: self.config.system.forensics_log_seconds,
            },
            SystemTools,
        );

        // The tracker callback enqueues trigger requests; the loop applies
        // the debounce, freezes the ring, and hands the job to the worker.
        let (trigger_tx, trigger_rx) = mpsc::channel::<(i64, String)>();
        let callback: ForensicsCallback = Box::new(move |event_id, reason| {
            let _ = trigger_tx.send((event_id, reason.to_string()));
        });
        let mut tracker =
            ProcessTracker::new(&conn, self.config.bands.clone(), boot_time, Some(callback))?;

        let shutdown = Arc::clone(&self.shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| Error::Config(format!("failed to install signal handler: {e}")))?;

        // Startup prune, then periodically.
        if let Err(e) = storage::prune_old_events(&conn, self.config.retention.events_days) {
            warn!(error = %e, "startup prune failed");
        }
        let _ = storage::machine::prune_machine_snapshots(
            &conn,
            self.config.system.machine_snapshot_retention_hours,
        );

        info!("daemon started");
        let result = self.main_loop(&conn, &mut tracker, &server, &worker, &trigger_rx, &db_path);

        // Teardown order: stop pushing, stop capturing, release the tracer,
        // then clean up files.
        server.stop();
        worker.shutdown();
        disable_tracer();
        drop(tracker);
        drop(conn);
        let _ = std::fs::remove_file(&pid_path);
        info!("daemon stopped");

        result
    }

    #[allow(clippy::too_many_arguments)]
    fn main_loop(
        &mut self,
        conn: &Connection,
        tracker: &mut ProcessTracker,
        server: &PushServer,
        worker: &ForensicsWorker,
        trigger_rx: &mpsc::Receiver<(i64, String)>,
        db_path: &Path,
    ) -> Result<()> {
        let sample_interval = Duration::from_secs_f64(self.config.system.sample_interval.max(0.01));
        let prune_interval =
            Duration::from_secs(self.config.system.auto_prune_interval_hours.max(1) * 3600);

        let mut ring = RingBuffer::new(self.config.system.ring_buffer_size);
        let mut debounce = Debounce::new(Duration::from_secs_f64(
            self.config.system.forensics_debounce,
        ));
        let mut band_log = BandLogFilter::new(self.config.system.log_stability_samples);
        let job_tx = worker.sender();

        let mut heartbeat_count: u64 = 0;
        let mut heartbeat_score_sum: u64 = 0;
        let mut heartbeat_max_score: u8 = 0;
        let mut iterations: u64 = 0;
        let mut last_prune = Instant::now();

        while !self.shutdown.load(Ordering::SeqCst) {
            let iteration_start = Instant::now();
            iterations += 1;

            let tick = self.tick(
                conn,
                tracker,
                server,
                trigger_rx,
                &job_tx,
                &mut ring,
                &mut debounce,
                &mut band_log,
            );

            match tick {
                Ok(samples) => {
                    heartbeat_count += 1;
                    heartbeat_score_sum += samples.max_score as u64;
                    heartbeat_max_score = heartbeat_max_score.max(samples.max_score);

                    if heartbeat_count >= self.config.system.heartbeat_samples {
                        let db_size_mb = std::fs::metadata(db_path)
                            .map(|m| m.len() as f64 / (1024.0 * 1024.0))
                            .unwrap_or(0.0);
                        info!(
                            avg_score = (heartbeat_score_sum / heartbeat_count),
                            max_score = heartbeat_max_score,
                            tracked = tracker.tracked_count(),
                            ring_fill = ring.len(),
                            ring_capacity = ring.capacity(),
                            clients = server.client_count(),
                            rss_mb = format!("{:.1}", max_rss_mb()).as_str(),
                            db_mb = format!("{:.1}", db_size_mb).as_str(),
                            "heartbeat"
                        );
                        heartbeat_count = 0;
                        heartbeat_score_sum = 0;
                        heartbeat_max_score = 0;
                    }

                    if iterations % self.config.system.machine_snapshot_samples.max(1) == 0 {
                        if let Err(e) = storage::machine::insert_machine_snapshot(
                            conn,
                            storage::now_epoch(),
                            &samples.rogues,
                        ) {
                            warn!(error = %e, "machine snapshot failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "sampling tick failed");
                    // Brief back-off, but exit immediately on shutdown.
                    self.sleep_with_shutdown(Duration::from_secs(1));
                    continue;
                }
            }

            if last_prune.elapsed() >= prune_interval {
                last_prune = Instant::now();
                if let Err(e) = storage::prune_old_events(conn, self.config.retention.events_days) {
                    warn!(error = %e, "auto prune failed");
                }
                let _ = storage::machine::prune_machine_snapshots(
                    conn,
                    self.config.system.machine_snapshot_retention_hours,
                );
            }

            // Sleep the remainder of the period, waking early on shutdown.
            let elapsed = iteration_start.elapsed();
            if let Some(remaining) = sample_interval.checked_sub(elapsed) {
                self.sleep_with_shutdown(remaining);
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn tick(
        &mut self,
        conn: &Connection,
        tracker: &mut ProcessTracker,
        server: &PushServer,
        trigger_rx: &mpsc::Receiver<(i64, String)>,
        job_tx: &mpsc::Sender<ForensicsJob>,
        ring: &mut RingBuffer,
        debounce: &mut Debounce,
        band_log: &mut BandLogFilter,
    ) -> Result<SampleSet> {
        let samples = self.sampler.collect();

        band_log.tick();
        for rogue in &samples.rogues {
            match band_log.observe(rogue.pid, rogue.band) {
                Some(BandTransition::Entered { band }) => info!(
                    command = %rogue.command,
                    pid = rogue.pid,
                    score = rogue.score,
                    band = %band,
                    dominant = %rogue.dominant_resource,
                    disproportionality = format!("{:.1}x", rogue.disproportionality).as_str(),
                    "rogue entered"
                ),
                Some(BandTransition::Exited) => {
                    info!(command = %rogue.command, pid = rogue.pid, "rogue settled")
                }
                None => {}
            }
        }

        ring.push(samples.clone());
        tracker.update(conn, &samples.rogues);

        // Forensic triggers raised during this update.
        while let Ok((event_id, reason)) = trigger_rx.try_recv() {
            if !debounce.allow() {
                info!(event_id, reason = %reason, "forensics debounced");
                continue;
            }
            let job = ForensicsJob {
                event_id,
                trigger: reason,
                contents: ring.freeze(),
            };
            if job_tx.send(job).is_err() {
                warn!("forensics worker unavailable");
            }
        }

        if server.has_clients() {
            server.broadcast(&samples, ring.len())?;
        }

        Ok(samples)
    }

    fn sleep_with_shutdown(&self, total: Duration) {
        let chunk = Duration::from_millis(100);
        let mut remaining = total;
        while remaining > Duration::ZERO && !self.shutdown.load(Ordering::SeqCst) {
            let step = remaining.min(chunk);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Single-instance guard ──────────────────────────────────────────

    #[test]
    fn no_pid_file_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        check_single_instance(&path, |_| String::new()).unwrap();
    }

    #[test]
    fn live_daemon_pid_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "1234").unwrap();
        let err = check_single_instance(&path, |_| "roguehound".to_string()).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { pid: 1234 }));
        assert!(path.exists(), "pid file belongs to the live daemon");
    }

    #[test]
    fn recycled_pid_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "1234").unwrap();
        check_single_instance(&path, |_| "Safari".to_string()).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn dead_pid_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "99999").unwrap();
        check_single_instance(&path, |_| String::new()).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn garbage_pid_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "not a pid").unwrap();
        check_single_instance(&path, |_| "roguehound".to_string()).unwrap();
        assert!(!path.exists());
    }

    // ── Band log filter ────────────────────────────────────────────────

    #[test]
    fn entry_logged_only_after_stability() {
        let mut filter = BandLogFilter::new(3);

        filter.tick();
        assert_eq!(filter.observe(1, Band::High), None);
        filter.tick();
        assert_eq!(filter.observe(1, Band::High), None);
        filter.tick();
        assert_eq!(
            filter.observe(1, Band::High),
            Some(BandTransition::Entered { band: Band::High })
        );
        // Already logged: no repeat.
        filter.tick();
        assert_eq!(filter.observe(1, Band::High), None);
    }

    #[test]
    fn band_flap_resets_the_counter() {
        let mut filter = BandLogFilter::new(3);
        filter.tick();
        assert_eq!(filter.observe(1, Band::High), None);
        filter.tick();
        assert_eq!(filter.observe(1, Band::Medium), None); // flap resets
        filter.tick();
        assert_eq!(filter.observe(1, Band::Medium), None);
        filter.tick();
        assert_eq!(
            filter.observe(1, Band::Medium),
            Some(BandTransition::Entered { band: Band::Medium })
        );
    }

    #[test]
    fn exit_logged_after_stable_low() {
        let mut filter = BandLogFilter::new(2);
        filter.tick();
        filter.observe(1, Band::Elevated);
        filter.tick();
        assert!(filter.observe(1, Band::Elevated).is_some());

        filter.tick();
        assert_eq!(filter.observe(1, Band::Low), None);
        filter.tick();
        assert_eq!(filter.observe(1, Band::Low), Some(BandTransition::Exited));
        // Exit is logged once.
        filter.tick();
        assert_eq!(filter.observe(1, Band::Low), None);
    }

    #[test]
    fn escalation_to_higher_band_logs_again() {
        let mut filter = BandLogFilter::new(1);
        filter.tick();
        assert_eq!(
            filter.observe(1, Band::Medium),
            Some(BandTransition::Entered { band: Band::Medium })
        );
        filter.tick();
        assert_eq!(
            filter.observe(1, Band::Critical),
            Some(BandTransition::Entered { band: Band::Critical })
        );
        // Dropping back to medium is not an entry (medium < critical).
        filter.tick();
        assert_eq!(filter.observe(1, Band::Medium), None);
    }

    #[test]
    fn stale_entries_are_pruned() {
        let mut filter = BandLogFilter::new(1);
        filter.tick();
        filter.observe(1, Band::High);
        assert_eq!(filter.tracked.len(), 1);
        for _ in 0..(STALE_SAMPLES + 1) {
            filter.tick();
        }
        assert!(filter.tracked.is_empty());
    }

    // ── RSS helper ─────────────────────────────────────────────────────

    #[test]
    fn max_rss_is_positive() {
        assert!(max_rss_mb() > 0.0);
    }
}
