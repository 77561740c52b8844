//! Forensic capture rows and the trace/log/buffer-context subtables.
//!
//! Everything hangs off a `forensic_captures` row and cascades with it.
//! Frame rows reconstruct the call tree while inserting, by remembering the
//! most recent frame id at each depth.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};

use rh_common::{CaptureStatus, Result};

use crate::forensics::logs::LogEntry;
use crate::forensics::trace::{TraceData, TraceProcess, TraceThread};

/// One capture attempt with its three step statuses.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRow {
    pub id: i64,
    pub event_id: i64,
    pub captured_at: f64,
    pub trigger: String,
    pub trace_save_status: Option<String>,
    pub trace_decode_status: Option<String>,
    pub logs_status: Option<String>,
}

/// Create a capture record; statuses start NULL.
pub fn create_forensic_capture(conn: &Connection, event_id: i64, trigger: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO forensic_captures (event_id, captured_at, trigger) VALUES (?1, ?2, ?3)",
        params![event_id, super::now_epoch(), trigger],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Record the per-step outcomes on a capture.
pub fn update_forensic_capture_status(
    conn: &Connection,
    capture_id: i64,
    trace_save: Option<CaptureStatus>,
    trace_decode: Option<CaptureStatus>,
    logs: Option<CaptureStatus>,
) -> Result<()> {
    conn.execute(
        "UPDATE forensic_captures
           SET trace_save_status = ?1, trace_decode_status = ?2, logs_status = ?3
           WHERE id = ?4",
        params![
            trace_save.map(CaptureStatus::as_str),
            trace_decode.map(CaptureStatus::as_str),
            logs.map(CaptureStatus::as_str),
            capture_id
        ],
    )?;
    Ok(())
}

/// All captures for an event, oldest first.
pub fn get_forensic_captures(conn: &Connection, event_id: i64) -> Result<Vec<CaptureRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, event_id, captured_at, trigger,
                trace_save_status, trace_decode_status, logs_status
           FROM forensic_captures WHERE event_id = ?1
           ORDER BY captured_at",
    )?;
    let rows = stmt.query_map([event_id], |row| {
        Ok(CaptureRow {
            id: row.get(0)?,
            event_id: row.get(1)?,
            captured_at: row.get(2)?,
            trigger: row.get(3)?,
            trace_save_status: row.get(4)?,
            trace_decode_status: row.get(5)?,
            logs_status: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

/// Store a fully parsed trace document under a capture.
pub fn store_trace_data(conn: &Connection, capture_id: i64, data: &TraceData) -> Result<()> {
    let h = &data.header;
    conn.execute(
        "INSERT INTO trace_header
           (capture_id, start_time, end_time, duration_sec, steps, sampling_interval_ms,
            os_version, architecture, report_version, hardware_model, active_cpus,
            memory_gb, hw_page_size, vm_page_size, time_since_boot_sec,
            time_awake_since_boot_sec, total_cpu_time_sec, total_cycles,
            total_instructions, total_cpi, memory_pressure_avg_pct,
            memory_pressure_max_pct, available_memory_avg_gb, available_memory_min_gb,
            free_disk_gb, total_disk_gb, advisory_battery, advisory_user,
            advisory_thermal, advisory_combined, shared_cache_residency_pct,
            vnodes_available_pct, data_source, reason)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                   ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28,
                   ?29, ?30, ?31, ?32, ?33, ?34)",
        params![
            capture_id,
            h.start_time,
            h.end_time,
            h.duration_sec,
            h.steps,
            h.sampling_interval_ms,
            h.os_version,
            h.architecture,
            h.report_version,
            h.hardware_model,
            h.active_cpus,
            h.memory_gb,
            h.hw_page_size,
            h.vm_page_size,
            h.time_since_boot_sec,
            h.time_awake_since_boot_sec,
            h.total_cpu_time_sec,
            h.total_cycles,
            h.total_instructions,
            h.total_cpi,
            h.memory_pressure_avg_pct,
            h.memory_pressure_max_pct,
            h.available_memory_avg_gb,
            h.available_memory_min_gb,
            h.free_disk_gb,
            h.total_disk_gb,
            h.advisory_battery,
            h.advisory_user,
            h.advisory_thermal,
            h.advisory_combined,
            h.shared_cache_residency_pct,
            h.vnodes_available_pct,
            h.data_source,
            h.reason,
        ],
    )?;

    for cache in &h.shared_caches {
        conn.execute(
            "INSERT INTO trace_shared_cache (capture_id, uuid, base_address, slide, name)
               VALUES (?1, ?2, ?3, ?4, ?5)",
            params![capture_id, cache.uuid, cache.base_address, cache.slide, cache.name],
        )?;
    }

    for stat in &h.io_stats {
        conn.execute(
            "INSERT INTO trace_io_stats (capture_id, tier, io_count, io_rate, bytes, bytes_rate)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                capture_id,
                stat.tier,
                stat.io_count,
                stat.io_rate,
                stat.bytes_total,
                stat.bytes_rate
            ],
        )?;
    }

    for proc_ in &data.processes {
        store_trace_process(conn, capture_id, proc_)?;
    }

    for bucket in &data.io_histograms {
        conn.execute(
            "INSERT INTO trace_io_histogram
               (capture_id, histogram_type, begin_value, end_value, frequency, cdf)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                capture_id,
                bucket.histogram_type,
                bucket.begin_value,
                bucket.end_value,
                bucket.frequency,
                bucket.cdf
            ],
        )?;
    }

    for agg in &data.io_aggregates {
        conn.execute(
            "INSERT INTO trace_io_aggregate
               (capture_id, tier, num_ios, latency_mean_us, latency_max_us,
                latency_sd_us, read_count, read_bytes, write_count, write_bytes)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                capture_id,
                agg.tier,
                agg.num_ios,
                agg.latency_mean_us,
                agg.latency_max_us,
                agg.latency_sd_us,
                agg.read_count,
                agg.read_bytes,
                agg.write_count,
                agg.write_bytes
            ],
        )?;
    }

    Ok(())
}

fn store_trace_process(conn: &Connection, capture_id: i64, proc_: &TraceProcess) -> Result<()> {
    conn.execute(
        "INSERT INTO trace_process
           (capture_id, pid, name, uuid, path, identifier, version,
            parent_pid, parent_name, responsible_pid, responsible_name,
            execed_from_pid, execed_from_name, execed_to_pid, execed_to_name,
            architecture, shared_cache_uuid, runningboard_managed, sudden_term,
            footprint_mb, footprint_delta_mb, io_count, io_bytes, time_since_fork_sec,
            start_time, end_time, num_samples, sample_range_start, sample_range_end,
            cpu_time_sec, cycles, instructions, cpi, num_threads)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                   ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28,
                   ?29, ?30, ?31, ?32, ?33, ?34)",
        params![
            capture_id,
            proc_.pid,
            proc_.name,
            proc_.uuid,
            proc_.path,
            proc_.identifier,
            proc_.version,
            proc_.parent_pid,
            proc_.parent_name,
            proc_.responsible_pid,
            proc_.responsible_name,
            proc_.execed_from_pid,
            proc_.execed_from_name,
            proc_.execed_to_pid,
            proc_.execed_to_name,
            proc_.architecture,
            proc_.shared_cache_uuid,
            proc_.runningboard_managed,
            proc_.sudden_term,
            proc_.footprint_mb,
            proc_.footprint_delta_mb,
            proc_.io_count,
            proc_.io_bytes,
            proc_.time_since_fork_sec,
            proc_.start_time,
            proc_.end_time,
            proc_.num_samples,
            proc_.sample_range_start,
            proc_.sample_range_end,
            proc_.cpu_time_sec,
            proc_.cycles,
            proc_.instructions,
            proc_.cpi,
            proc_.num_threads,
        ],
    )?;
    let process_id = conn.last_insert_rowid();

    for note in &proc_.notes {
        conn.execute(
            "INSERT INTO trace_process_note (process_id, note) VALUES (?1, ?2)",
            params![process_id, note],
        )?;
    }

    for img in &proc_.binary_images {
        conn.execute(
            "INSERT INTO trace_binary_image
               (process_id, start_address, end_address, name, version, uuid, path, is_kernel)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                process_id,
                img.start_address,
                img.end_address,
                img.name,
                img.version,
                img.uuid,
                img.path,
                img.is_kernel
            ],
        )?;
    }

    for thread in &proc_.threads {
        store_trace_thread(conn, process_id, thread)?;
    }

    Ok(())
}

fn store_trace_thread(conn: &Connection, process_id: i64, thread: &TraceThread) -> Result<()> {
    conn.execute(
        "INSERT INTO trace_thread
           (process_id, thread_id, dispatch_queue_name, dispatch_queue_serial,
            thread_name, num_samples, sample_range_start, sample_range_end,
            priority, base_priority, cpu_time_sec, cycles, instructions, cpi,
            io_count, io_bytes)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            process_id,
            thread.thread_id,
            thread.dispatch_queue_name,
            thread.dispatch_queue_serial,
            thread.thread_name,
            thread.num_samples,
            thread.sample_range_start,
            thread.sample_range_end,
            thread.priority,
            thread.base_priority,
            thread.cpu_time_sec,
            thread.cycles,
            thread.instructions,
            thread.cpi,
            thread.io_count,
            thread.io_bytes,
        ],
    )?;
    let thread_db_id = conn.last_insert_rowid();

    // Frames arrive in document order; the most recent frame at depth d-1 is
    // the parent of a frame at depth d.
    let mut depth_to_frame_id: HashMap<u32, i64> = HashMap::new();
    for frame in &thread.frames {
        let parent_id = if frame.depth > 0 {
            depth_to_frame_id.get(&(frame.depth - 1)).copied()
        } else {
            None
        };
        conn.execute(
            "INSERT INTO trace_frame
               (thread_id, parent_frame_id, depth, sample_count, is_kernel,
                symbol_name, symbol_offset, library_name, library_offset,
                address, state, core_type, blocked_on)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                thread_db_id,
                parent_id,
                frame.depth,
                frame.sample_count,
                frame.is_kernel,
                frame.symbol_name,
                frame.symbol_offset,
                frame.library_name,
                frame.library_offset,
                frame.address,
                frame.state,
                frame.core_type,
                frame.blocked_on,
            ],
        )?;
        depth_to_frame_id.insert(frame.depth, conn.last_insert_rowid());
    }

    Ok(())
}

/// Insert parsed log entries under a capture.
pub fn insert_log_entries(conn: &Connection, capture_id: i64, entries: &[LogEntry]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO log_entries
           (capture_id, timestamp, event_message, mach_timestamp,
            subsystem, category, process_name, process_id, message_type)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for entry in entries {
        stmt.execute(params![
            capture_id,
            entry.timestamp,
            entry.event_message,
            entry.mach_timestamp,
            entry.subsystem,
            entry.category,
            entry.process_name,
            entry.process_id,
            entry.message_type,
        ])?;
    }
    Ok(())
}

/// Log entries for a capture, oldest first.
pub fn get_log_entries(conn: &Connection, capture_id: i64, limit: usize) -> Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT timestamp, event_message, mach_timestamp, subsystem, category,
                process_name, process_id, message_type
           FROM log_entries WHERE capture_id = ?1
           ORDER BY timestamp LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![capture_id, limit as i64], |row| {
        Ok(LogEntry {
            timestamp: row.get(0)?,
            event_message: row.get(1)?,
            mach_timestamp: row.get(2)?,
            subsystem: row.get(3)?,
            category: row.get(4)?,
            process_name: row.get(5)?,
            process_id: row.get(6)?,
            message_type: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

/// Ring-buffer context stored with a capture. Culprits are a JSON array.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferContextRow {
    pub capture_id: i64,
    pub sample_count: usize,
    pub peak_score: u8,
    pub culprits: String,
}

pub fn insert_buffer_context(
    conn: &Connection,
    capture_id: i64,
    sample_count: usize,
    peak_score: u8,
    culprits_json: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO buffer_context (capture_id, sample_count, peak_score, culprits)
           VALUES (?1, ?2, ?3, ?4)",
        params![capture_id, sample_count as i64, peak_score, culprits_json],
    )?;
    Ok(())
}

pub fn get_buffer_context(conn: &Connection, capture_id: i64) -> Result<Option<BufferContextRow>> {
    let row = conn
        .query_row(
            "SELECT capture_id, sample_count, peak_score, culprits
               FROM buffer_context WHERE capture_id = ?1",
            [capture_id],
            |row| {
                Ok(BufferContextRow {
                    capture_id: row.get(0)?,
                    sample_count: row.get::<_, i64>(1)? as usize,
                    peak_score: row.get(2)?,
                    culprits: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}
