//! Database schema.
//!
//! A single integer version lives in `daemon_state`; a mismatch at startup
//! deletes the database (and its WAL/SHM sidecars) and recreates it from
//! this script. There are no migrations by design.

/// Bumped on any schema change.
pub const SCHEMA_VERSION: i64 = 7;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS daemon_state (
    key TEXT PRIMARY KEY,
    value TEXT,
    updated_at REAL
);

CREATE TABLE IF NOT EXISTS process_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pid INTEGER NOT NULL,
    command TEXT NOT NULL,
    boot_time INTEGER NOT NULL,
    entry_time REAL NOT NULL,
    exit_time REAL,
    entry_band TEXT NOT NULL,
    peak_band TEXT NOT NULL,
    peak_score INTEGER NOT NULL,
    peak_snapshot_id INTEGER,
    FOREIGN KEY (peak_snapshot_id) REFERENCES process_snapshots(id)
);

CREATE TABLE IF NOT EXISTS process_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL,
    snapshot_type TEXT NOT NULL,
    captured_at REAL NOT NULL,
    -- CPU
    cpu REAL NOT NULL,
    -- Memory
    mem INTEGER NOT NULL,
    mem_peak INTEGER NOT NULL,
    pageins INTEGER NOT NULL,
    pageins_rate REAL NOT NULL,
    faults INTEGER NOT NULL,
    faults_rate REAL NOT NULL,
    -- Disk I/O
    disk_io INTEGER NOT NULL,
    disk_io_rate REAL NOT NULL,
    -- Activity
    csw INTEGER NOT NULL,
    csw_rate REAL NOT NULL,
    syscalls INTEGER NOT NULL,
    syscalls_rate REAL NOT NULL,
    threads INTEGER NOT NULL,
    mach_msgs INTEGER NOT NULL,
    mach_msgs_rate REAL NOT NULL,
    -- Efficiency
    instructions INTEGER NOT NULL,
    cycles INTEGER NOT NULL,
    ipc REAL NOT NULL,
    -- Power
    energy INTEGER NOT NULL,
    energy_rate REAL NOT NULL,
    wakeups INTEGER NOT NULL,
    wakeups_rate REAL NOT NULL,
    -- Contention
    runnable_time INTEGER NOT NULL,
    runnable_time_rate REAL NOT NULL,
    qos_interactive INTEGER NOT NULL,
    qos_interactive_rate REAL NOT NULL,
    -- GPU
    gpu_time INTEGER NOT NULL,
    gpu_time_rate REAL NOT NULL,
    -- Zombie children
    zombie_children INTEGER NOT NULL,
    -- State
    state TEXT NOT NULL,
    priority INTEGER NOT NULL,
    -- Scoring
    score INTEGER NOT NULL,
    band TEXT NOT NULL,
    cpu_share REAL NOT NULL,
    gpu_share REAL NOT NULL,
    mem_share REAL NOT NULL,
    disk_share REAL NOT NULL,
    wakeups_share REAL NOT NULL,
    disproportionality REAL NOT NULL,
    dominant_resource TEXT NOT NULL,
    FOREIGN KEY (event_id) REFERENCES process_events(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_process_events_pid_boot
    ON process_events(pid, boot_time);
CREATE INDEX IF NOT EXISTS idx_process_events_open
    ON process_events(exit_time) WHERE exit_time IS NULL;
CREATE INDEX IF NOT EXISTS idx_process_snapshots_event
    ON process_snapshots(event_id);
CREATE INDEX IF NOT EXISTS idx_process_snapshots_score
    ON process_snapshots(score);

-- Forensic captures linked to process events
CREATE TABLE IF NOT EXISTS forensic_captures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL,
    captured_at REAL NOT NULL,
    trigger TEXT NOT NULL,
    trace_save_status TEXT,
    trace_decode_status TEXT,
    logs_status TEXT,
    FOREIGN KEY (event_id) REFERENCES process_events(id) ON DELETE CASCADE
);

-- Trace header: system-wide metadata from the decoded kernel trace
CREATE TABLE IF NOT EXISTS trace_header (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    capture_id INTEGER NOT NULL UNIQUE,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    duration_sec REAL NOT NULL,
    steps INTEGER NOT NULL,
    sampling_interval_ms INTEGER NOT NULL,
    os_version TEXT NOT NULL,
    architecture TEXT NOT NULL,
    report_version INTEGER,
    hardware_model TEXT,
    active_cpus INTEGER,
    memory_gb INTEGER,
    hw_page_size INTEGER,
    vm_page_size INTEGER,
    time_since_boot_sec INTEGER,
    time_awake_since_boot_sec INTEGER,
    total_cpu_time_sec REAL,
    total_cycles INTEGER,
    total_instructions INTEGER,
    total_cpi REAL,
    memory_pressure_avg_pct INTEGER,
    memory_pressure_max_pct INTEGER,
    available_memory_avg_gb REAL,
    available_memory_min_gb REAL,
    free_disk_gb REAL,
    total_disk_gb REAL,
    advisory_battery INTEGER,
    advisory_user INTEGER,
    advisory_thermal INTEGER,
    advisory_combined INTEGER,
    shared_cache_residency_pct REAL,
    vnodes_available_pct REAL,
    data_source TEXT,
    reason TEXT,
    FOREIGN KEY (capture_id) REFERENCES forensic_captures(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS trace_shared_cache (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    capture_id INTEGER NOT NULL,
    uuid TEXT NOT NULL,
    base_address TEXT NOT NULL,
    slide TEXT NOT NULL,
    name TEXT NOT NULL,
    FOREIGN KEY (capture_id) REFERENCES forensic_captures(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS trace_io_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    capture_id INTEGER NOT NULL,
    tier TEXT NOT NULL,
    io_count INTEGER NOT NULL,
    io_rate REAL,
    bytes INTEGER NOT NULL,
    bytes_rate REAL,
    FOREIGN KEY (capture_id) REFERENCES forensic_captures(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS trace_process (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    capture_id INTEGER NOT NULL,
    pid INTEGER NOT NULL,
    name TEXT NOT NULL,
    uuid TEXT,
    path TEXT,
    identifier TEXT,
    version TEXT,
    parent_pid INTEGER,
    parent_name TEXT,
    responsible_pid INTEGER,
    responsible_name TEXT,
    execed_from_pid INTEGER,
    execed_from_name TEXT,
    execed_to_pid INTEGER,
    execed_to_name TEXT,
    architecture TEXT,
    shared_cache_uuid TEXT,
    runningboard_managed INTEGER,
    sudden_term TEXT,
    footprint_mb REAL,
    footprint_delta_mb REAL,
    io_count INTEGER,
    io_bytes INTEGER,
    time_since_fork_sec INTEGER,
    start_time TEXT,
    end_time TEXT,
    num_samples INTEGER,
    sample_range_start INTEGER,
    sample_range_end INTEGER,
    cpu_time_sec REAL,
    cycles INTEGER,
    instructions INTEGER,
    cpi REAL,
    num_threads INTEGER,
    FOREIGN KEY (capture_id) REFERENCES forensic_captures(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS trace_process_note (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_id INTEGER NOT NULL,
    note TEXT NOT NULL,
    FOREIGN KEY (process_id) REFERENCES trace_process(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS trace_thread (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_id INTEGER NOT NULL,
    thread_id TEXT NOT NULL,
    dispatch_queue_name TEXT,
    dispatch_queue_serial INTEGER,
    thread_name TEXT,
    num_samples INTEGER,
    sample_range_start INTEGER,
    sample_range_end INTEGER,
    priority INTEGER,
    base_priority INTEGER,
    cpu_time_sec REAL,
    cycles INTEGER,
    instructions INTEGER,
    cpi REAL,
    io_count INTEGER,
    io_bytes INTEGER,
    FOREIGN KEY (process_id) REFERENCES trace_process(id) ON DELETE CASCADE
);

-- Stack frames form a tree via the parent_frame_id self-reference
CREATE TABLE IF NOT EXISTS trace_frame (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id INTEGER NOT NULL,
    parent_frame_id INTEGER,
    depth INTEGER NOT NULL,
    sample_count INTEGER NOT NULL,
    is_kernel INTEGER NOT NULL,
    symbol_name TEXT,
    symbol_offset INTEGER,
    library_name TEXT,
    library_offset INTEGER,
    address TEXT NOT NULL,
    state TEXT,
    core_type TEXT,
    blocked_on TEXT,
    FOREIGN KEY (thread_id) REFERENCES trace_thread(id) ON DELETE CASCADE,
    FOREIGN KEY (parent_frame_id) REFERENCES trace_frame(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS trace_binary_image (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_id INTEGER NOT NULL,
    start_address TEXT NOT NULL,
    end_address TEXT,
    name TEXT NOT NULL,
    version TEXT,
    uuid TEXT,
    path TEXT,
    is_kernel INTEGER NOT NULL,
    FOREIGN KEY (process_id) REFERENCES trace_process(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS trace_io_histogram (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    capture_id INTEGER NOT NULL,
    histogram_type TEXT NOT NULL,
    begin_value INTEGER NOT NULL,
    end_value INTEGER,
    frequency INTEGER NOT NULL,
    cdf INTEGER NOT NULL,
    FOREIGN KEY (capture_id) REFERENCES forensic_captures(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS trace_io_aggregate (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    capture_id INTEGER NOT NULL,
    tier TEXT NOT NULL,
    num_ios INTEGER NOT NULL,
    latency_mean_us INTEGER,
    latency_max_us INTEGER,
    latency_sd_us INTEGER,
    read_count INTEGER,
    read_bytes INTEGER,
    write_count INTEGER,
    write_bytes INTEGER,
    FOREIGN KEY (capture_id) REFERENCES forensic_captures(id) ON DELETE CASCADE
);

-- Log entries (from the unified log query, NDJSON style)
CREATE TABLE IF NOT EXISTS log_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    capture_id INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    mach_timestamp INTEGER,
    subsystem TEXT,
    category TEXT,
    process_name TEXT,
    process_id INTEGER,
    message_type TEXT,
    event_message TEXT NOT NULL,
    FOREIGN KEY (capture_id) REFERENCES forensic_captures(id) ON DELETE CASCADE
);

-- Ring buffer context at capture time
CREATE TABLE IF NOT EXISTS buffer_context (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    capture_id INTEGER NOT NULL,
    sample_count INTEGER NOT NULL,
    peak_score INTEGER NOT NULL,
    culprits TEXT NOT NULL,
    FOREIGN KEY (capture_id) REFERENCES forensic_captures(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_forensic_captures_event ON forensic_captures(event_id);
CREATE INDEX IF NOT EXISTS idx_log_entries_capture ON log_entries(capture_id);
CREATE INDEX IF NOT EXISTS idx_buffer_context_capture ON buffer_context(capture_id);

CREATE INDEX IF NOT EXISTS idx_trace_header_capture ON trace_header(capture_id);
CREATE INDEX IF NOT EXISTS idx_trace_shared_cache_capture ON trace_shared_cache(capture_id);
CREATE INDEX IF NOT EXISTS idx_trace_io_stats_capture ON trace_io_stats(capture_id);
CREATE INDEX IF NOT EXISTS idx_trace_process_capture ON trace_process(capture_id);
CREATE INDEX IF NOT EXISTS idx_trace_process_pid ON trace_process(pid);
CREATE INDEX IF NOT EXISTS idx_trace_process_note_process ON trace_process_note(process_id);
CREATE INDEX IF NOT EXISTS idx_trace_thread_process ON trace_thread(process_id);
CREATE INDEX IF NOT EXISTS idx_trace_frame_thread ON trace_frame(thread_id);
CREATE INDEX IF NOT EXISTS idx_trace_frame_parent ON trace_frame(parent_frame_id);
CREATE INDEX IF NOT EXISTS idx_trace_binary_image_process ON trace_binary_image(process_id);
CREATE INDEX IF NOT EXISTS idx_trace_io_histogram_capture ON trace_io_histogram(capture_id);
CREATE INDEX IF NOT EXISTS idx_trace_io_aggregate_capture ON trace_io_aggregate(capture_id);

-- Machine snapshots: periodic full-system state, short retention
CREATE TABLE IF NOT EXISTS machine_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    captured_at REAL NOT NULL,
    process_count INTEGER NOT NULL,
    max_score INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS machine_snapshot_processes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL,
    pid INTEGER NOT NULL,
    command TEXT NOT NULL,
    cpu REAL NOT NULL,
    mem INTEGER NOT NULL,
    mem_peak INTEGER NOT NULL,
    pageins INTEGER NOT NULL,
    pageins_rate REAL NOT NULL,
    faults INTEGER NOT NULL,
    faults_rate REAL NOT NULL,
    disk_io INTEGER NOT NULL,
    disk_io_rate REAL NOT NULL,
    csw INTEGER NOT NULL,
    csw_rate REAL NOT NULL,
    syscalls INTEGER NOT NULL,
    syscalls_rate REAL NOT NULL,
    threads INTEGER NOT NULL,
    mach_msgs INTEGER NOT NULL,
    mach_msgs_rate REAL NOT NULL,
    instructions INTEGER NOT NULL,
    cycles INTEGER NOT NULL,
    ipc REAL NOT NULL,
    energy INTEGER NOT NULL,
    energy_rate REAL NOT NULL,
    wakeups INTEGER NOT NULL,
    wakeups_rate REAL NOT NULL,
    runnable_time INTEGER NOT NULL,
    runnable_time_rate REAL NOT NULL,
    qos_interactive INTEGER NOT NULL,
    qos_interactive_rate REAL NOT NULL,
    gpu_time INTEGER NOT NULL,
    gpu_time_rate REAL NOT NULL,
    zombie_children INTEGER NOT NULL,
    state TEXT NOT NULL,
    priority INTEGER NOT NULL,
    score INTEGER NOT NULL,
    band TEXT NOT NULL,
    cpu_share REAL NOT NULL,
    gpu_share REAL NOT NULL,
    mem_share REAL NOT NULL,
    disk_share REAL NOT NULL,
    wakeups_share REAL NOT NULL,
    disproportionality REAL NOT NULL,
    dominant_resource TEXT NOT NULL,
    FOREIGN KEY (snapshot_id) REFERENCES machine_snapshots(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_machine_snapshots_time ON machine_snapshots(captured_at);
CREATE INDEX IF NOT EXISTS idx_msp_snapshot ON machine_snapshot_processes(snapshot_id);
";
