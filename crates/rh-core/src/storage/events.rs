//! Process event and snapshot CRUD.
//!
//! An event is one tracked episode of a single process at or above the
//! tracking band. Snapshots store a full `ProcessScore` relationally, one
//! column per field, and cascade on event delete.

use rusqlite::{params, Connection, OptionalExtension, Row};

use rh_common::{Band, DominantResource, ProcessScore, ProcessState, Result, SnapshotType};

/// An open event restored at tracker startup.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenEvent {
    pub id: i64,
    pub pid: u32,
    pub command: String,
    pub entry_time: f64,
    pub entry_band: Band,
    pub peak_score: u8,
    pub peak_band: Band,
    pub peak_snapshot_id: Option<i64>,
}

/// Listing row for the CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSummary {
    pub id: i64,
    pub pid: u32,
    pub command: String,
    pub entry_time: f64,
    pub exit_time: Option<f64>,
    pub entry_band: Band,
    pub peak_band: Band,
    pub peak_score: u8,
}

/// Full event detail, with the peak snapshot joined in.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDetail {
    pub id: i64,
    pub pid: u32,
    pub command: String,
    pub boot_time: i64,
    pub entry_time: f64,
    pub exit_time: Option<f64>,
    pub entry_band: Band,
    pub peak_band: Band,
    pub peak_score: u8,
    pub peak_snapshot_id: Option<i64>,
    pub peak_snapshot: Option<SnapshotRow>,
}

/// A stored snapshot: metadata plus the full score record.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub id: i64,
    pub event_id: i64,
    pub snapshot_type: String,
    pub score: ProcessScore,
}

fn band(s: String) -> Band {
    Band::parse(&s).unwrap_or(Band::Low)
}

/// Create a new event. `peak_snapshot_id` starts NULL and is set after the
/// entry snapshot lands via [`update_process_event_peak`].
#[allow(clippy::too_many_arguments)]
pub fn create_process_event(
    conn: &Connection,
    pid: u32,
    command: &str,
    boot_time: i64,
    entry_time: f64,
    entry_band: Band,
    peak_score: u8,
    peak_band: Band,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO process_events
           (pid, command, boot_time, entry_time, entry_band, peak_score, peak_band)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            pid,
            command,
            boot_time,
            entry_time,
            entry_band.as_str(),
            peak_score,
            peak_band.as_str()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// All open events (no exit_time) for the given boot.
pub fn get_open_events(conn: &Connection, boot_time: i64) -> Result<Vec<OpenEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, pid, command, entry_time, entry_band, peak_score, peak_band, peak_snapshot_id
           FROM process_events
           WHERE boot_time = ?1 AND exit_time IS NULL",
    )?;
    let rows = stmt.query_map([boot_time], |row| {
        Ok(OpenEvent {
            id: row.get(0)?,
            pid: row.get(1)?,
            command: row.get(2)?,
            entry_time: row.get(3)?,
            entry_band: band(row.get(4)?),
            peak_score: row.get(5)?,
            peak_band: band(row.get(6)?),
            peak_snapshot_id: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

/// Event listing with optional boot and entry-time filters, newest first.
pub fn get_process_events(
    conn: &Connection,
    boot_time: Option<i64>,
    time_cutoff: Option<f64>,
    limit: usize,
) -> Result<Vec<EventSummary>> {
    let mut sql = String::from(
        "SELECT id, pid, command, entry_time, exit_time, entry_band, peak_band, peak_score
           FROM process_events",
    );
    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(boot) = boot_time {
        conditions.push(format!("boot_time = ?{}", values.len() + 1));
        values.push(Box::new(boot));
    }
    if let Some(cutoff) = time_cutoff {
        conditions.push(format!("entry_time >= ?{}", values.len() + 1));
        values.push(Box::new(cutoff));
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY entry_time DESC LIMIT ?{}", values.len() + 1));
    values.push(Box::new(limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        |row| {
        Ok(EventSummary {
            id: row.get(0)?,
            pid: row.get(1)?,
            command: row.get(2)?,
            entry_time: row.get(3)?,
            exit_time: row.get(4)?,
            entry_band: band(row.get(5)?),
            peak_band: band(row.get(6)?),
            peak_score: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

/// Full detail for one event, `None` when it does not exist.
pub fn get_process_event_detail(conn: &Connection, event_id: i64) -> Result<Option<EventDetail>> {
    let row = conn
        .query_row(
            "SELECT id, pid, command, boot_time, entry_time, exit_time,
                    entry_band, peak_band, peak_score, peak_snapshot_id
               FROM process_events WHERE id = ?1",
            [event_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, u8>(8)?,
                    row.get::<_, Option<i64>>(9)?,
                ))
            },
        )
        .optional()?;

    let Some((id, pid, command, boot_time, entry_time, exit_time, entry_band, peak_band, peak_score, peak_snapshot_id)) =
        row
    else {
        return Ok(None);
    };

    let peak_snapshot = match peak_snapshot_id {
        Some(snapshot_id) => get_snapshot(conn, snapshot_id)?,
        None => None,
    };

    Ok(Some(EventDetail {
        id,
        pid,
        command,
        boot_time,
        entry_time,
        exit_time,
        entry_band: band(entry_band),
        peak_band: band(peak_band),
        peak_score,
        peak_snapshot_id,
        peak_snapshot,
    }))
}

/// Close an event by setting its exit time.
pub fn close_process_event(conn: &Connection, event_id: i64, exit_time: f64) -> Result<()> {
    conn.execute(
        "UPDATE process_events SET exit_time = ?1 WHERE id = ?2",
        params![exit_time, event_id],
    )?;
    Ok(())
}

/// Update peak score/band and repoint the peak snapshot.
pub fn update_process_event_peak(
    conn: &Connection,
    event_id: i64,
    peak_score: u8,
    peak_band: Band,
    peak_snapshot_id: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE process_events
           SET peak_score = ?1, peak_band = ?2, peak_snapshot_id = ?3
           WHERE id = ?4",
        params![peak_score, peak_band.as_str(), peak_snapshot_id, event_id],
    )?;
    Ok(())
}

/// Insert a full snapshot for an event; returns the snapshot id.
pub fn insert_process_snapshot(
    conn: &Connection,
    event_id: i64,
    snapshot_type: SnapshotType,
    score: &ProcessScore,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO process_snapshots
           (event_id, snapshot_type, captured_at,
            cpu, mem, mem_peak, pageins, pageins_rate, faults, faults_rate,
            disk_io, disk_io_rate,
            csw, csw_rate, syscalls, syscalls_rate, threads, mach_msgs, mach_msgs_rate,
            instructions, cycles, ipc,
            energy, energy_rate, wakeups, wakeups_rate,
            runnable_time, runnable_time_rate, qos_interactive, qos_interactive_rate,
            gpu_time, gpu_time_rate,
            zombie_children,
            state, priority,
            score, band, cpu_share, gpu_share, mem_share, disk_share,
            wakeups_share, disproportionality, dominant_resource)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                   ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28,
                   ?29, ?30, ?31, ?32, ?33, ?34, ?35, ?36, ?37, ?38, ?39, ?40, ?41,
                   ?42, ?43, ?44)",
        params![
            event_id,
            snapshot_type.as_str(),
            score.captured_at,
            score.cpu,
            score.mem,
            score.mem_peak,
            score.pageins,
            score.pageins_rate,
            score.faults,
            score.faults_rate,
            score.disk_io,
            score.disk_io_rate,
            score.csw,
            score.csw_rate,
            score.syscalls,
            score.syscalls_rate,
            score.threads,
            score.mach_msgs,
            score.mach_msgs_rate,
            score.instructions,
            score.cycles,
            score.ipc,
            score.energy,
            score.energy_rate,
            score.wakeups,
            score.wakeups_rate,
            score.runnable_time,
            score.runnable_time_rate,
            score.qos_interactive,
            score.qos_interactive_rate,
            score.gpu_time,
            score.gpu_time_rate,
            score.zombie_children,
            score.state.as_str(),
            score.priority,
            score.score,
            score.band.as_str(),
            score.cpu_share,
            score.gpu_share,
            score.mem_share,
            score.disk_share,
            score.wakeups_share,
            score.disproportionality,
            score.dominant_resource.as_str(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

const SNAPSHOT_COLUMNS: &str = "id, event_id, snapshot_type, captured_at,
            cpu, mem, mem_peak, pageins, pageins_rate, faults, faults_rate,
            disk_io, disk_io_rate,
            csw, csw_rate, syscalls, syscalls_rate, threads, mach_msgs, mach_msgs_rate,
            instructions, cycles, ipc,
            energy, energy_rate, wakeups, wakeups_rate,
            runnable_time, runnable_time_rate, qos_interactive, qos_interactive_rate,
            gpu_time, gpu_time_rate,
            zombie_children,
            state, priority,
            score, band, cpu_share, gpu_share, mem_share, disk_share,
            wakeups_share, disproportionality, dominant_resource";

fn snapshot_from_row(row: &Row<'_>, pid: u32, command: String) -> rusqlite::Result<SnapshotRow> {
    let state: String = row.get(34)?;
    let band_str: String = row.get(37)?;
    let dominant: String = row.get(44)?;
    Ok(SnapshotRow {
        id: row.get(0)?,
        event_id: row.get(1)?,
        snapshot_type: row.get(2)?,
        score: ProcessScore {
            pid,
            command,
            captured_at: row.get(3)?,
            cpu: row.get(4)?,
            mem: row.get(5)?,
            mem_peak: row.get(6)?,
            pageins: row.get(7)?,
            pageins_rate: row.get(8)?,
            faults: row.get(9)?,
            faults_rate: row.get(10)?,
            disk_io: row.get(11)?,
            disk_io_rate: row.get(12)?,
            csw: row.get(13)?,
            csw_rate: row.get(14)?,
            syscalls: row.get(15)?,
            syscalls_rate: row.get(16)?,
            threads: row.get(17)?,
            mach_msgs: row.get(18)?,
            mach_msgs_rate: row.get(19)?,
            instructions: row.get(20)?,
            cycles: row.get(21)?,
            ipc: row.get(22)?,
            energy: row.get(23)?,
            energy_rate: row.get(24)?,
            wakeups: row.get(25)?,
            wakeups_rate: row.get(26)?,
            runnable_time: row.get(27)?,
            runnable_time_rate: row.get(28)?,
            qos_interactive: row.get(29)?,
            qos_interactive_rate: row.get(30)?,
            gpu_time: row.get(31)?,
            gpu_time_rate: row.get(32)?,
            zombie_children: row.get(33)?,
            state: ProcessState::parse(&state),
            priority: row.get(35)?,
            score: row.get(36)?,
            band: Band::parse(&band_str).unwrap_or(Band::Low),
            cpu_share: row.get(38)?,
            gpu_share: row.get(39)?,
            mem_share: row.get(40)?,
            disk_share: row.get(41)?,
            wakeups_share: row.get(42)?,
            disproportionality: row.get(43)?,
            dominant_resource: DominantResource::parse(&dominant).unwrap_or_default(),
        },
    })
}

/// Fetch one snapshot by id, joining pid/command from its event.
pub fn get_snapshot(conn: &Connection, snapshot_id: i64) -> Result<Option<SnapshotRow>> {
    let sql = format!(
        "SELECT {SNAPSHOT_COLUMNS}, e.pid, e.command
           FROM process_snapshots s JOIN process_events e ON e.id = s.event_id
           WHERE s.id = ?1"
    );
    // Column names in SNAPSHOT_COLUMNS are unqualified; qualify via table alias.
    let sql = sql.replace("id, event_id, snapshot_type,", "s.id, s.event_id, s.snapshot_type,");
    let row = conn
        .query_row(&sql, [snapshot_id], |row| {
            let pid: u32 = row.get(45)?;
            let command: String = row.get(46)?;
            snapshot_from_row(row, pid, command)
        })
        .optional()?;
    Ok(row)
}

/// All snapshots for an event, ordered by capture time.
pub fn get_process_snapshots(conn: &Connection, event_id: i64) -> Result<Vec<SnapshotRow>> {
    let sql = format!(
        "SELECT {SNAPSHOT_COLUMNS}, e.pid, e.command
           FROM process_snapshots s JOIN process_events e ON e.id = s.event_id
           WHERE s.event_id = ?1
           ORDER BY s.captured_at, s.id"
    );
    let sql = sql.replace("id, event_id, snapshot_type,", "s.id, s.event_id, s.snapshot_type,");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([event_id], |row| {
        let pid: u32 = row.get(45)?;
        let command: String = row.get(46)?;
        snapshot_from_row(row, pid, command)
    })?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

#[cfg(test)]
pub(crate) mod testutil {
    use rh_common::{Band, DominantResource, ProcessScore, ProcessState};

    /// A fully-populated score for storage round-trip tests.
    pub fn score_fixture(pid: u32, score: u8) -> ProcessScore {
        ProcessScore {
            pid,
            command: format!("proc{pid}"),
            captured_at: 1_700_000_123.5,
            cpu: 87.5,
            mem: 3 * 1024 * 1024 * 1024,
            mem_peak: 4 * 1024 * 1024 * 1024,
            pageins: 1500,
            pageins_rate: 120.5,
            faults: 88_000,
            faults_rate: 440.25,
            disk_io: 9_999_999,
            disk_io_rate: 1_048_576.0,
            csw: 420_000,
            csw_rate: 2_100.0,
            syscalls: 812_345,
            syscalls_rate: 4_061.7,
            threads: 42,
            mach_msgs: 55_000,
            mach_msgs_rate: 275.0,
            instructions: 8_800_000_000,
            cycles: 11_000_000_000,
            ipc: 0.8,
            energy: 123_456_789,
            energy_rate: 617_283.9,
            wakeups: 9_001,
            wakeups_rate: 45.0,
            runnable_time: 2_500_000_000,
            runnable_time_rate: 12.5,
            qos_interactive: 900_000_000,
            qos_interactive_rate: 4.5,
            gpu_time: 777_000_000,
            gpu_time_rate: 3.9,
            zombie_children: 2,
            state: ProcessState::Running,
            priority: 31,
            score,
            band: Band::Medium,
            cpu_share: 3.5,
            gpu_share: 0.2,
            mem_share: 1.9,
            disk_share: 0.7,
            wakeups_share: 0.1,
            disproportionality: 3.5,
            dominant_resource: DominantResource::Cpu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::score_fixture;
    use super::*;
    use crate::storage::testutil::memory_db;

    const BOOT: i64 = 1_700_000_000;

    fn open_event(conn: &Connection, pid: u32, score: u8) -> i64 {
        let event_id = create_process_event(
            conn,
            pid,
            &format!("proc{pid}"),
            BOOT,
            100.0,
            Band::Medium,
            score,
            Band::Medium,
        )
        .unwrap();
        let snapshot = score_fixture(pid, score);
        let snapshot_id =
            insert_process_snapshot(conn, event_id, SnapshotType::Entry, &snapshot).unwrap();
        update_process_event_peak(conn, event_id, score, Band::Medium, snapshot_id).unwrap();
        event_id
    }

    #[test]
    fn create_and_restore_open_events() {
        let conn = memory_db();
        let id1 = open_event(&conn, 10, 40);
        let id2 = open_event(&conn, 11, 55);
        close_process_event(&conn, id2, 200.0).unwrap();

        let open = get_open_events(&conn, BOOT).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, id1);
        assert_eq!(open[0].pid, 10);
        assert_eq!(open[0].peak_score, 40);
        assert!(open[0].peak_snapshot_id.is_some());

        // Other boots see nothing.
        assert!(get_open_events(&conn, BOOT + 1).unwrap().is_empty());
    }

    #[test]
    fn snapshot_round_trip_preserves_every_field() {
        let conn = memory_db();
        let event_id = create_process_event(
            &conn, 42, "proc42", BOOT, 100.0, Band::Medium, 35, Band::Medium,
        )
        .unwrap();
        let original = score_fixture(42, 35);
        let snapshot_id =
            insert_process_snapshot(&conn, event_id, SnapshotType::Checkpoint, &original).unwrap();

        let restored = get_snapshot(&conn, snapshot_id).unwrap().unwrap();
        assert_eq!(restored.snapshot_type, "checkpoint");
        assert_eq!(restored.event_id, event_id);
        assert_eq!(restored.score, original);
    }

    #[test]
    fn snapshots_ordered_by_capture_time() {
        let conn = memory_db();
        let event_id = create_process_event(
            &conn, 1, "p", BOOT, 100.0, Band::Medium, 35, Band::Medium,
        )
        .unwrap();
        for (t, ty) in [
            (100.0, SnapshotType::Entry),
            (101.0, SnapshotType::Checkpoint),
            (102.0, SnapshotType::Exit),
        ] {
            let mut s = score_fixture(1, 35);
            s.captured_at = t;
            insert_process_snapshot(&conn, event_id, ty, &s).unwrap();
        }
        let snaps = get_process_snapshots(&conn, event_id).unwrap();
        assert_eq!(snaps.len(), 3);
        assert_eq!(snaps[0].snapshot_type, "entry");
        assert_eq!(snaps[2].snapshot_type, "exit");
    }

    #[test]
    fn event_detail_joins_peak_snapshot() {
        let conn = memory_db();
        let event_id = open_event(&conn, 9, 66);
        let detail = get_process_event_detail(&conn, event_id).unwrap().unwrap();
        assert_eq!(detail.pid, 9);
        assert_eq!(detail.boot_time, BOOT);
        assert_eq!(detail.peak_score, 66);
        let peak = detail.peak_snapshot.unwrap();
        assert_eq!(peak.score.score, 66);
        assert!(get_process_event_detail(&conn, 9999).unwrap().is_none());
    }

    #[test]
    fn listing_filters_and_orders() {
        let conn = memory_db();
        for (pid, entry) in [(1u32, 100.0f64), (2, 200.0), (3, 300.0)] {
            create_process_event(&conn, pid, "p", BOOT, entry, Band::Medium, 35, Band::Medium)
                .unwrap();
        }
        let all = get_process_events(&conn, Some(BOOT), None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].pid, 3, "newest first");

        let recent = get_process_events(&conn, Some(BOOT), Some(150.0), 10).unwrap();
        assert_eq!(recent.len(), 2);

        let limited = get_process_events(&conn, None, None, 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn cascade_delete_removes_snapshots() {
        let conn = memory_db();
        let event_id = open_event(&conn, 5, 50);
        conn.execute("DELETE FROM process_events WHERE id = ?1", [event_id])
            .unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM process_snapshots", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn prune_removes_only_old_closed_events() {
        let conn = memory_db();
        let now = crate::storage::now_epoch();

        // Old closed event: pruned.
        let old_id = open_event(&conn, 1, 40);
        close_process_event(&conn, old_id, now - 100.0 * 86_400.0).unwrap();
        // Recent closed event: kept.
        let recent_id = open_event(&conn, 2, 40);
        close_process_event(&conn, recent_id, now - 86_400.0).unwrap();
        // Ancient open event: never pruned.
        let open_id = create_process_event(
            &conn,
            3,
            "p",
            BOOT,
            now - 400.0 * 86_400.0,
            Band::Medium,
            40,
            Band::Medium,
        )
        .unwrap();

        let deleted = crate::storage::prune_old_events(&conn, 90).unwrap();
        assert_eq!(deleted, 1);

        let remaining: Vec<i64> = {
            let mut stmt = conn.prepare("SELECT id FROM process_events ORDER BY id").unwrap();
            stmt.query_map([], |r| r.get(0))
                .unwrap()
                .collect::<std::result::Result<_, _>>()
                .unwrap()
        };
        assert!(remaining.contains(&recent_id));
        assert!(remaining.contains(&open_id));
        assert!(!remaining.contains(&old_id));
    }
}
