//! Forensics pipeline against an on-disk database: debounce gating, worker
//! hand-off, and the resulting capture rows.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use rh_common::{Band, Error, Result, SampleSet};
use rh_core::forensics::{
    Debounce, ForensicTools, ForensicsConfig, ForensicsJob, ForensicsWorker,
};
use rh_core::ring::RingBuffer;
use rh_core::storage;
use rh_core::storage::events::create_process_event;

struct StubTools;

impl ForensicTools for StubTools {
    fn save_trace(&self, output: &Path) -> Result<()> {
        std::fs::write(output, b"trace")?;
        Ok(())
    }

    fn decode_trace(&self, _path: &Path) -> Result<String> {
        Ok("Date/Time: now\nDuration: 1.00s\nSteps: 100 (10ms sampling interval)\n\
Process: hog [321]\nNum samples: 100 (1-100)\n"
            .to_string())
    }

    fn query_logs(&self, _window_sec: u64) -> Result<Vec<u8>> {
        Ok(br#"{"timestamp":"t","eventMessage":"stall"}"#.to_vec())
    }
}

struct FailingTools;

impl ForensicTools for FailingTools {
    fn save_trace(&self, _output: &Path) -> Result<()> {
        Err(Error::PrivilegedToolDenied("sudo: a password is required".into()))
    }

    fn decode_trace(&self, _path: &Path) -> Result<String> {
        unreachable!("decode must not run when save failed")
    }

    fn query_logs(&self, _window_sec: u64) -> Result<Vec<u8>> {
        Err(Error::LogQuery("log tool exited 1".into()))
    }
}

fn empty_sample(max_score: u8) -> SampleSet {
    SampleSet {
        timestamp: Utc::now(),
        elapsed_ms: 3,
        process_count: 50,
        max_score,
        rogues: Vec::new(),
    }
}

fn setup(dir: &tempfile::TempDir) -> (std::path::PathBuf, i64) {
    let db_path = dir.path().join("data.db");
    storage::init_database(&db_path).unwrap();
    let conn = storage::open(&db_path).unwrap();
    let event_id = create_process_event(
        &conn,
        321,
        "hog",
        1_700_000_000,
        10.0,
        Band::Critical,
        90,
        Band::Critical,
    )
    .unwrap();
    (db_path, event_id)
}

#[test]
fn debounced_triggers_produce_exactly_one_capture() {
    let dir = tempfile::tempdir().unwrap();
    let (db_path, event_id) = setup(&dir);

    let worker = ForensicsWorker::spawn(
        db_path.clone(),
        ForensicsConfig {
            runtime_dir: dir.path().join("runtime"),
            log_seconds: 60,
        },
        StubTools,
    );

    // Two triggers inside the debounce window → one job, as the daemon's
    // trigger gate enforces.
    let mut debounce = Debounce::new(Duration::from_millis(200));
    let mut ring = RingBuffer::new(8);
    ring.push(empty_sample(90));

    let t0 = Instant::now();
    let mut sent = 0;
    for (reason, offset_ms) in [
        ("band_entry_critical", 0u64),
        ("peak_escalation_critical", 50),
    ] {
        if debounce.allow_at(t0 + Duration::from_millis(offset_ms)) {
            worker
                .sender()
                .send(ForensicsJob {
                    event_id,
                    trigger: reason.to_string(),
                    contents: ring.freeze(),
                })
                .unwrap();
            sent += 1;
        }
    }
    assert_eq!(sent, 1);

    // After the window, a third trigger captures again.
    assert!(debounce.allow_at(t0 + Duration::from_millis(250)));
    worker
        .sender()
        .send(ForensicsJob {
            event_id,
            trigger: "peak_escalation_critical".to_string(),
            contents: ring.freeze(),
        })
        .unwrap();

    worker.shutdown();

    let conn = storage::open(&db_path).unwrap();
    let captures: i64 = conn
        .query_row("SELECT count(*) FROM forensic_captures", [], |r| r.get(0))
        .unwrap();
    assert_eq!(captures, 2);

    // The successful capture parsed the trace and the logs.
    let processes: i64 = conn
        .query_row("SELECT count(*) FROM trace_process", [], |r| r.get(0))
        .unwrap();
    assert_eq!(processes, 2);
    let logs: i64 = conn
        .query_row("SELECT count(*) FROM log_entries", [], |r| r.get(0))
        .unwrap();
    assert_eq!(logs, 2);
}

#[test]
fn all_legs_failing_still_records_the_capture() {
    let dir = tempfile::tempdir().unwrap();
    let (db_path, event_id) = setup(&dir);

    let worker = ForensicsWorker::spawn(
        db_path.clone(),
        ForensicsConfig {
            runtime_dir: dir.path().join("runtime"),
            log_seconds: 60,
        },
        FailingTools,
    );
    let mut ring = RingBuffer::new(4);
    ring.push(empty_sample(85));
    worker
        .sender()
        .send(ForensicsJob {
            event_id,
            trigger: "band_entry_critical".to_string(),
            contents: ring.freeze(),
        })
        .unwrap();
    worker.shutdown();

    let conn = storage::open(&db_path).unwrap();
    let (save, decode, logs): (String, Option<String>, String) = conn
        .query_row(
            "SELECT trace_save_status, trace_decode_status, logs_status FROM forensic_captures",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap();
    assert_eq!(save, "failed");
    assert_eq!(decode, None);
    assert_eq!(logs, "failed");

    // Buffer context is written regardless of leg failures.
    let contexts: i64 = conn
        .query_row("SELECT count(*) FROM buffer_context", [], |r| r.get(0))
        .unwrap();
    assert_eq!(contexts, 1);
}
