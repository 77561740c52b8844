//! Forensic capture orchestration.
//!
//! A capture runs on a dedicated worker thread with its own database
//! connection; the tracker-side callback only enqueues a job, so the tick
//! that triggered it never blocks. The two external legs (privileged trace
//! save and the unified-log query) run concurrently; every DB write is
//! partitioned by the capture id. Raw artifacts are parsed then discarded.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use rh_common::{CaptureStatus, DominantResource, Error, Result};

use crate::forensics::logs::parse_logs_ndjson;
use crate::forensics::trace::parse_trace;
use crate::ring::BufferContents;
use crate::storage;
use crate::storage::forensics::{
    create_forensic_capture, insert_buffer_context, insert_log_entries, store_trace_data,
    update_forensic_capture_status,
};

// ---------------------------------------------------------------------------
// Debounce
// ---------------------------------------------------------------------------

/// Minimum spacing between captures on the monotonic clock.
///
/// The kernel tracer cannot produce useful output until its rolling buffer
/// has refilled after a save.
#[derive(Debug)]
pub struct Debounce {
    min_interval: Duration,
    last: Option<Instant>,
}

impl Debounce {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// True when enough time has elapsed; records the attempt when allowed.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

// ---------------------------------------------------------------------------
// Culprits
// ---------------------------------------------------------------------------

/// Compact per-PID summary extracted from the frozen ring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Culprit {
    pub pid: u32,
    pub command: String,
    pub score: u8,
    pub dominant_resource: DominantResource,
    pub disproportionality: f64,
}

/// Peak score per distinct PID across the frozen window, sorted descending.
pub fn identify_culprits(contents: &BufferContents) -> Vec<Culprit> {
    let mut peaks: std::collections::HashMap<u32, Culprit> = std::collections::HashMap::new();

    for sample in &contents.samples {
        for rogue in &sample.rogues {
            let replace = peaks
                .get(&rogue.pid)
                .map(|existing| rogue.score > existing.score)
                .unwrap_or(true);
            if replace {
                peaks.insert(
                    rogue.pid,
                    Culprit {
                        pid: rogue.pid,
                        command: rogue.command.clone(),
                        score: rogue.score,
                        dominant_resource: rogue.dominant_resource,
                        disproportionality: rogue.disproportionality,
                    },
                );
            }
        }
    }

    let mut culprits: Vec<Culprit> = peaks.into_values().collect();
    culprits.sort_by(|a, b| b.score.cmp(&a.score).then(a.pid.cmp(&b.pid)));
    culprits
}

// ---------------------------------------------------------------------------
// Tool adapters
// ---------------------------------------------------------------------------

/// Narrow contract over the kernel tracer and the log query tool.
pub trait ForensicTools: Send + Sync {
    /// Privileged save of the rolling kernel trace to `output`.
    fn save_trace(&self, output: &Path) -> Result<()>;
    /// Unprivileged decode of a saved trace to its text form.
    fn decode_trace(&self, path: &Path) -> Result<String>;
    /// NDJSON log stream for the last `window_sec` seconds.
    fn query_logs(&self, window_sec: u64) -> Result<Vec<u8>>;
}

/// Real tool invocations. Both subprocesses start in their own session so
/// terminal signals to a controlling UI do not cascade into them.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTools;

const LOG_PREDICATE: &str = "subsystem == \"com.apple.powerd\" OR \
subsystem == \"com.apple.kernel\" OR \
subsystem == \"com.apple.windowserver\" OR \
eventMessage CONTAINS[c] \"hang\" OR \
eventMessage CONTAINS[c] \"stall\" OR \
eventMessage CONTAINS[c] \"timeout\"";

fn detached(cmd: &mut Command) -> &mut Command {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

impl ForensicTools for SystemTools {
    fn save_trace(&self, output: &Path) -> Result<()> {
        let result = detached(
            Command::new("/usr/bin/sudo")
                .arg("-n") // non-interactive, fail if a password is needed
                .arg("/usr/bin/tailspin")
                .arg("save")
                .arg("-o")
                .arg(output)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped()),
        )
        .output()
        .map_err(|e| Error::TraceSave(format!("spawn failed: {e}")))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            if stderr.contains("password is required") || stderr.contains("a password") {
                return Err(Error::PrivilegedToolDenied(stderr));
            }
            return Err(Error::TraceSave(stderr));
        }
        if !output.exists() {
            return Err(Error::TraceSave(format!(
                "tracer did not create output: {}",
                output.display()
            )));
        }
        Ok(())
    }

    fn decode_trace(&self, path: &Path) -> Result<String> {
        let result = detached(
            Command::new("/usr/sbin/spindump")
                .arg("-i")
                .arg(path)
                .arg("-stdout")
                .stdin(Stdio::null())
                .stderr(Stdio::null()),
        )
        .output()
        .map_err(|e| Error::TraceDecode(format!("spawn failed: {e}")))?;

        if !result.status.success() {
            return Err(Error::TraceDecode(format!("decoder exited {}", result.status)));
        }
        Ok(String::from_utf8_lossy(&result.stdout).into_owned())
    }

    fn query_logs(&self, window_sec: u64) -> Result<Vec<u8>> {
        let result = detached(
            Command::new("/usr/bin/log")
                .arg("show")
                .arg("--style")
                .arg("ndjson")
                .arg("--last")
                .arg(format!("{window_sec}s"))
                .arg("--predicate")
                .arg(LOG_PREDICATE)
                .stdin(Stdio::null())
                .stderr(Stdio::null()),
        )
        .output()
        .map_err(|e| Error::LogQuery(format!("spawn failed: {e}")))?;

        if !result.status.success() {
            return Err(Error::LogQuery(format!("log tool exited {}", result.status)));
        }
        Ok(result.stdout)
    }
}

/// Ensure the kernel tracer is recording; without it, captures fail with
/// trace-too-short errors.
pub fn ensure_tracer_enabled() {
    let info = Command::new("/usr/bin/tailspin")
        .arg("info")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();
    match info {
        Ok(out) => {
            let text = String::from_utf8_lossy(&out.stdout);
            if text.contains("has been disabled") {
                let _ = Command::new("/usr/bin/tailspin")
                    .arg("enable")
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
                info!("kernel tracer enabled");
            }
        }
        Err(_) => warn!("kernel tracer tool not found"),
    }
}

/// Disable tracing on shutdown; the daemon owns the tracer lifetime.
pub fn disable_tracer() {
    let _ = Command::new("/usr/bin/tailspin")
        .arg("disable")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Forensics settings carried into the worker.
#[derive(Debug, Clone)]
pub struct ForensicsConfig {
    /// Trace save directory; must match the privileged-invocation allow-list.
    pub runtime_dir: PathBuf,
    /// Seconds of log history per capture.
    pub log_seconds: u64,
}

struct TraceLeg {
    save: CaptureStatus,
    decode: Option<CaptureStatus>,
    text: Option<String>,
}

/// Run one full capture: raw → parse → DB → cleanup.
///
/// Returns the capture id. Individual leg failures are recorded on the
/// capture row and never abort the remaining steps.
pub fn capture_and_store<T: ForensicTools>(
    conn: &Connection,
    tools: &T,
    config: &ForensicsConfig,
    event_id: i64,
    trigger: &str,
    contents: &BufferContents,
) -> Result<i64> {
    let capture_id = create_forensic_capture(conn, event_id, trigger)?;

    std::fs::create_dir_all(&config.runtime_dir)?;
    let trace_path = config.runtime_dir.join(format!("capture_{event_id}.trace"));

    // The two external legs run concurrently; DB writes happen afterwards on
    // this thread only.
    let (trace_leg, logs_result) = std::thread::scope(|scope| {
        let logs_handle = scope.spawn(|| tools.query_logs(config.log_seconds));

        let trace_leg = match tools.save_trace(&trace_path) {
            Ok(()) => match tools.decode_trace(&trace_path) {
                Ok(text) => TraceLeg {
                    save: CaptureStatus::Success,
                    decode: Some(CaptureStatus::Success),
                    text: Some(text),
                },
                Err(e) => {
                    warn!(error = %e, "trace decode failed");
                    TraceLeg {
                        save: CaptureStatus::Success,
                        decode: Some(CaptureStatus::Failed),
                        text: None,
                    }
                }
            },
            Err(e) => {
                match &e {
                    Error::PrivilegedToolDenied(msg) => {
                        error!(error = %msg, "privileged trace save denied; check the sudoers rule");
                    }
                    other => warn!(error = %other, "trace save failed"),
                }
                TraceLeg {
                    save: CaptureStatus::Failed,
                    decode: None,
                    text: None,
                }
            }
        };

        let logs_result = logs_handle.join().unwrap_or_else(|_| {
            Err(Error::LogQuery("log query thread panicked".into()))
        });
        (trace_leg, logs_result)
    });

    // Raw artifacts are not retained.
    let _ = std::fs::remove_file(&trace_path);

    // Decode succeeded → parse and store; parse itself never fails.
    let mut decode_status = trace_leg.decode;
    if let Some(text) = trace_leg.text {
        let data = parse_trace(&text);
        if let Err(e) = store_trace_data(conn, capture_id, &data) {
            warn!(capture_id, error = %e, "trace row insert failed");
            decode_status = Some(CaptureStatus::Failed);
        } else {
            info!(
                capture_id,
                process_count = data.processes.len(),
                thread_count = data.processes.iter().map(|p| p.threads.len()).sum::<usize>(),
                "trace parsed"
            );
        }
    }

    let logs_status = match logs_result {
        Ok(bytes) => {
            let entries = parse_logs_ndjson(&bytes);
            match insert_log_entries(conn, capture_id, &entries) {
                Ok(()) => {
                    info!(capture_id, entry_count = entries.len(), "logs parsed");
                    CaptureStatus::Success
                }
                Err(e) => {
                    warn!(capture_id, error = %e, "log row insert failed");
                    CaptureStatus::Failed
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "log query failed");
            CaptureStatus::Failed
        }
    };

    // Ring-buffer context: who was hot across the frozen window.
    let culprits = identify_culprits(contents);
    let peak_score = culprits.iter().map(|c| c.score).max().unwrap_or(0);
    let culprits_json = serde_json::to_string(&culprits)?;
    insert_buffer_context(conn, capture_id, contents.len(), peak_score, &culprits_json)?;

    update_forensic_capture_status(
        conn,
        capture_id,
        Some(trace_leg.save),
        decode_status,
        Some(logs_status),
    )?;

    info!(
        capture_id,
        event_id,
        trigger,
        trace_save = trace_leg.save.as_str(),
        "forensics capture complete"
    );

    Ok(capture_id)
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// One queued capture request.
pub struct ForensicsJob {
    pub event_id: i64,
    pub trigger: String,
    pub contents: BufferContents,
}

/// Dedicated capture thread owning its own database connection.
///
/// Jobs arrive over an mpsc channel; dropping the sender drains and stops
/// the worker.
pub struct ForensicsWorker {
    tx: Option<Sender<ForensicsJob>>,
    handle: Option<JoinHandle<()>>,
}

impl ForensicsWorker {
    pub fn spawn<T: ForensicTools + 'static>(
        db_path: PathBuf,
        config: ForensicsConfig,
        tools: T,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<ForensicsJob>();
        let handle = std::thread::Builder::new()
            .name("forensics".into())
            .spawn(move || worker_loop(rx, db_path, config, tools))
            .expect("spawn forensics worker");
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn sender(&self) -> Sender<ForensicsJob> {
        self.tx.as_ref().expect("worker running").clone()
    }

    /// Stop accepting jobs, finish the queue, and join the thread.
    pub fn shutdown(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ForensicsWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T: ForensicTools>(
    rx: Receiver<ForensicsJob>,
    db_path: PathBuf,
    config: ForensicsConfig,
    tools: T,
) {
    let conn = match storage::open(&db_path) {
        Ok(conn) => conn,
        Err(e) => {
            error!(error = %e, "forensics worker could not open database");
            return;
        }
    };

    while let Ok(job) = rx.recv() {
        debug!(event_id = job.event_id, trigger = %job.trigger, "capture starting");
        if let Err(e) =
            capture_and_store(&conn, &tools, &config, job.event_id, &job.trigger, &job.contents)
        {
            error!(event_id = job.event_id, error = %e, "forensics capture failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::events::create_process_event;
    use crate::storage::testutil::memory_db;
    use chrono::Utc;
    use rh_common::{Band, ProcessState, SampleSet};

    // ── Debounce ───────────────────────────────────────────────────────

    #[test]
    fn debounce_allows_first_and_spaced_calls() {
        let mut debounce = Debounce::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(debounce.allow_at(t0));
        assert!(!debounce.allow_at(t0 + Duration::from_millis(500)));
        assert!(!debounce.allow_at(t0 + Duration::from_millis(1999)));
        assert!(debounce.allow_at(t0 + Duration::from_secs(2)));
    }

    #[test]
    fn debounce_denied_attempt_does_not_reset_window() {
        let mut debounce = Debounce::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(debounce.allow_at(t0));
        assert!(!debounce.allow_at(t0 + Duration::from_secs(1)));
        // Window is measured from the last allowed capture, not the denial.
        assert!(debounce.allow_at(t0 + Duration::from_secs(2)));
    }

    // ── Culprits ───────────────────────────────────────────────────────

    fn rogue(pid: u32, score: u8) -> rh_common::ProcessScore {
        let mut p = crate::storage::events::testutil::score_fixture(pid, score);
        p.state = ProcessState::Running;
        p.band = Band::Medium;
        p
    }

    fn window(samples: Vec<Vec<rh_common::ProcessScore>>) -> BufferContents {
        BufferContents {
            samples: samples
                .into_iter()
                .map(|rogues| SampleSet {
                    timestamp: Utc::now(),
                    elapsed_ms: 5,
                    process_count: rogues.len(),
                    max_score: rogues.iter().map(|r| r.score).max().unwrap_or(0),
                    rogues,
                })
                .collect(),
        }
    }

    #[test]
    fn culprits_keep_peak_score_per_pid() {
        let contents = window(vec![
            vec![rogue(1, 40), rogue(2, 80)],
            vec![rogue(1, 70), rogue(2, 30)],
        ]);
        let culprits = identify_culprits(&contents);
        assert_eq!(culprits.len(), 2);
        assert_eq!(culprits[0].pid, 2);
        assert_eq!(culprits[0].score, 80);
        assert_eq!(culprits[1].pid, 1);
        assert_eq!(culprits[1].score, 70);
    }

    #[test]
    fn culprits_empty_window() {
        assert!(identify_culprits(&window(vec![])).is_empty());
    }

    // ── Capture with mock tools ────────────────────────────────────────

    const TRACE_TEXT: &str = "\
Date/Time:        2026-07-14 09:31:02.123 -0700
End time:         2026-07-14 09:31:07.456 -0700
Duration:         5.33s
Steps:            532 (10ms sampling interval)
OS Version:       macOS 15.5 (24F74)
Architecture:     arm64e

Process:          stalled [777]
Num samples:      532 (1-532)
  Thread 0x1 532 samples (1-532)
  532  start + 52 (dyld + 24) [0x19e30ab84]
";

    struct MockTools {
        save_result: fn(&Path) -> Result<()>,
        decode_ok: bool,
        logs_ok: bool,
    }

    impl Default for MockTools {
        fn default() -> Self {
            Self {
                save_result: |path| {
                    std::fs::write(path, b"binary trace")?;
                    Ok(())
                },
                decode_ok: true,
                logs_ok: true,
            }
        }
    }

    impl ForensicTools for MockTools {
        fn save_trace(&self, output: &Path) -> Result<()> {
            (self.save_result)(output)
        }

        fn decode_trace(&self, _path: &Path) -> Result<String> {
            if self.decode_ok {
                Ok(TRACE_TEXT.to_string())
            } else {
                Err(Error::TraceDecode("decoder exited 1".into()))
            }
        }

        fn query_logs(&self, _window_sec: u64) -> Result<Vec<u8>> {
            if self.logs_ok {
                Ok(br#"{"timestamp":"t1","eventMessage":"stall detected"}"#.to_vec())
            } else {
                Err(Error::LogQuery("log tool exited 1".into()))
            }
        }
    }

    fn forensics_config(dir: &tempfile::TempDir) -> ForensicsConfig {
        ForensicsConfig {
            runtime_dir: dir.path().to_path_buf(),
            log_seconds: 60,
        }
    }

    fn event(conn: &Connection) -> i64 {
        create_process_event(
            conn,
            777,
            "stalled",
            1_700_000_000,
            100.0,
            Band::Critical,
            85,
            Band::Critical,
        )
        .unwrap()
    }

    #[test]
    fn successful_capture_records_everything() {
        let conn = memory_db();
        let dir = tempfile::tempdir().unwrap();
        let event_id = event(&conn);
        let contents = window(vec![vec![rogue(777, 85)]]);

        let capture_id = capture_and_store(
            &conn,
            &MockTools::default(),
            &forensics_config(&dir),
            event_id,
            "band_entry_critical",
            &contents,
        )
        .unwrap();

        let (save, decode, logs): (String, String, String) = conn
            .query_row(
                "SELECT trace_save_status, trace_decode_status, logs_status
                   FROM forensic_captures WHERE id = ?1",
                [capture_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(save, "success");
        assert_eq!(decode, "success");
        assert_eq!(logs, "success");

        let traces: i64 = conn
            .query_row("SELECT count(*) FROM trace_process", [], |r| r.get(0))
            .unwrap();
        assert_eq!(traces, 1);
        let log_rows: i64 = conn
            .query_row("SELECT count(*) FROM log_entries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(log_rows, 1);

        let ctx = crate::storage::forensics::get_buffer_context(&conn, capture_id)
            .unwrap()
            .unwrap();
        assert_eq!(ctx.sample_count, 1);
        assert_eq!(ctx.peak_score, 85);
        assert!(ctx.culprits.contains("\"pid\":777"));

        // Raw trace artifact was removed.
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn save_failure_skips_decode_but_logs_still_run() {
        let conn = memory_db();
        let dir = tempfile::tempdir().unwrap();
        let event_id = event(&conn);

        let tools = MockTools {
            save_result: |_| Err(Error::PrivilegedToolDenied("sudo: a password is required".into())),
            ..Default::default()
        };
        let capture_id = capture_and_store(
            &conn,
            &tools,
            &forensics_config(&dir),
            event_id,
            "band_entry_critical",
            &window(vec![]),
        )
        .unwrap();

        let (save, decode, logs): (String, Option<String>, String) = conn
            .query_row(
                "SELECT trace_save_status, trace_decode_status, logs_status
                   FROM forensic_captures WHERE id = ?1",
                [capture_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(save, "failed");
        assert_eq!(decode, None, "decode never ran");
        assert_eq!(logs, "success");
    }

    #[test]
    fn decode_failure_keeps_save_success() {
        let conn = memory_db();
        let dir = tempfile::tempdir().unwrap();
        let event_id = event(&conn);

        let tools = MockTools {
            decode_ok: false,
            ..Default::default()
        };
        let capture_id = capture_and_store(
            &conn,
            &tools,
            &forensics_config(&dir),
            event_id,
            "peak_escalation_critical",
            &window(vec![]),
        )
        .unwrap();

        let (save, decode): (String, String) = conn
            .query_row(
                "SELECT trace_save_status, trace_decode_status
                   FROM forensic_captures WHERE id = ?1",
                [capture_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(save, "success");
        assert_eq!(decode, "failed");
        let traces: i64 = conn
            .query_row("SELECT count(*) FROM trace_header", [], |r| r.get(0))
            .unwrap();
        assert_eq!(traces, 0);
    }

    #[test]
    fn log_failure_is_isolated_from_trace_leg() {
        let conn = memory_db();
        let dir = tempfile::tempdir().unwrap();
        let event_id = event(&conn);

        let tools = MockTools {
            logs_ok: false,
            ..Default::default()
        };
        let capture_id = capture_and_store(
            &conn,
            &tools,
            &forensics_config(&dir),
            event_id,
            "band_entry_critical",
            &window(vec![]),
        )
        .unwrap();

        let (decode, logs): (String, String) = conn
            .query_row(
                "SELECT trace_decode_status, logs_status FROM forensic_captures WHERE id = ?1",
                [capture_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(decode, "success");
        assert_eq!(logs, "failed");
    }

    #[test]
    fn worker_processes_jobs_then_drains_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("data.db");
        crate::storage::init_database(&db_path).unwrap();
        let event_id = {
            let conn = crate::storage::open(&db_path).unwrap();
            event(&conn)
        };

        let worker = ForensicsWorker::spawn(
            db_path.clone(),
            forensics_config(&dir),
            MockTools::default(),
        );
        worker
            .sender()
            .send(ForensicsJob {
                event_id,
                trigger: "band_entry_critical".into(),
                contents: window(vec![vec![rogue(777, 85)]]),
            })
            .unwrap();
        worker.shutdown();

        let conn = crate::storage::open(&db_path).unwrap();
        let captures: i64 = conn
            .query_row("SELECT count(*) FROM forensic_captures", [], |r| r.get(0))
            .unwrap();
        assert_eq!(captures, 1);
    }
}
