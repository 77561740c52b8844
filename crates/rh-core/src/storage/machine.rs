//! Periodic whole-machine snapshots with short retention.

use rusqlite::{params, Connection};
use tracing::debug;

use rh_common::{ProcessScore, Result};

/// Insert a full machine snapshot with every scored process.
pub fn insert_machine_snapshot(
    conn: &Connection,
    captured_at: f64,
    processes: &[ProcessScore],
) -> Result<i64> {
    let max_score = processes.iter().map(|p| p.score).max().unwrap_or(0);

    conn.execute(
        "INSERT INTO machine_snapshots (captured_at, process_count, max_score)
           VALUES (?1, ?2, ?3)",
        params![captured_at, processes.len() as i64, max_score],
    )?;
    let snapshot_id = conn.last_insert_rowid();

    let mut stmt = conn.prepare(
        "INSERT INTO machine_snapshot_processes
           (snapshot_id, pid, command,
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
    )?;
    for p in processes {
        stmt.execute(params![
            snapshot_id,
            p.pid,
            p.command,
            p.cpu,
            p.mem,
            p.mem_peak,
            p.pageins,
            p.pageins_rate,
            p.faults,
            p.faults_rate,
            p.disk_io,
            p.disk_io_rate,
            p.csw,
            p.csw_rate,
            p.syscalls,
            p.syscalls_rate,
            p.threads,
            p.mach_msgs,
            p.mach_msgs_rate,
            p.instructions,
            p.cycles,
            p.ipc,
            p.energy,
            p.energy_rate,
            p.wakeups,
            p.wakeups_rate,
            p.runnable_time,
            p.runnable_time_rate,
            p.qos_interactive,
            p.qos_interactive_rate,
            p.gpu_time,
            p.gpu_time_rate,
            p.zombie_children,
            p.state.as_str(),
            p.priority,
            p.score,
            p.band.as_str(),
            p.cpu_share,
            p.gpu_share,
            p.mem_share,
            p.disk_share,
            p.wakeups_share,
            p.disproportionality,
            p.dominant_resource.as_str(),
        ])?;
    }

    debug!(snapshot_id, process_count = processes.len(), max_score, "machine snapshot inserted");
    Ok(snapshot_id)
}

/// Delete machine snapshots older than `max_age_hours`; cascades remove the
/// per-process rows.
pub fn prune_machine_snapshots(conn: &Connection, max_age_hours: f64) -> Result<usize> {
    let cutoff = super::now_epoch() - max_age_hours * 3600.0;
    let deleted = conn.execute(
        "DELETE FROM machine_snapshots WHERE captured_at < ?1",
        [cutoff],
    )?;
    Ok(deleted)
}

pub fn machine_snapshot_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT count(*) FROM machine_snapshots", [], |r| r.get(0))?)
}
