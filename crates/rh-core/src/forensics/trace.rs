//! Decoded kernel-trace text parser.
//!
//! The decoder emits a multi-section text document: a header (everything
//! before the first `Process:` line), process blocks with threads, indented
//! call stacks and binary images, and a trailing I/O section with size and
//! latency histograms. All parsed fragments become relational rows; no text
//! is retained. Unknown tagged lines are ignored; the parser must not fail
//! on unexpected fields.

use regex::Regex;
use std::sync::LazyLock;

// ---------------------------------------------------------------------------
// Parsed structures
// ---------------------------------------------------------------------------

/// One stack frame. `depth` is derived from indentation (two spaces per
/// level); the tree is reconstructed at insert time by remembering the most
/// recent frame at each depth.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceFrame {
    pub sample_count: u64,
    pub is_kernel: bool,
    pub address: String,
    pub depth: u32,
    pub symbol_name: Option<String>,
    pub symbol_offset: Option<u64>,
    pub library_name: Option<String>,
    pub library_offset: Option<u64>,
    pub state: Option<String>,
    pub core_type: Option<String>,
    pub blocked_on: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceThread {
    /// Hex id like `0x3fd504`.
    pub thread_id: String,
    pub dispatch_queue_name: Option<String>,
    pub dispatch_queue_serial: Option<u64>,
    pub thread_name: Option<String>,
    pub num_samples: Option<u64>,
    pub sample_range_start: Option<u64>,
    pub sample_range_end: Option<u64>,
    pub priority: Option<i64>,
    pub base_priority: Option<i64>,
    pub cpu_time_sec: Option<f64>,
    pub cycles: Option<u64>,
    pub instructions: Option<u64>,
    pub cpi: Option<f64>,
    pub io_count: Option<u64>,
    pub io_bytes: Option<u64>,
    pub frames: Vec<TraceFrame>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceBinaryImage {
    pub start_address: String,
    pub end_address: Option<String>,
    pub name: String,
    pub version: Option<String>,
    pub uuid: Option<String>,
    pub path: Option<String>,
    pub is_kernel: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceProcess {
    pub pid: i64,
    pub name: String,
    pub uuid: Option<String>,
    pub path: Option<String>,
    pub identifier: Option<String>,
    pub version: Option<String>,
    pub parent_pid: Option<i64>,
    pub parent_name: Option<String>,
    pub responsible_pid: Option<i64>,
    pub responsible_name: Option<String>,
    pub execed_from_pid: Option<i64>,
    pub execed_from_name: Option<String>,
    pub execed_to_pid: Option<i64>,
    pub execed_to_name: Option<String>,
    pub architecture: Option<String>,
    pub shared_cache_uuid: Option<String>,
    pub runningboard_managed: Option<bool>,
    pub sudden_term: Option<String>,
    pub footprint_mb: Option<f64>,
    pub footprint_delta_mb: Option<f64>,
    pub io_count: Option<u64>,
    pub io_bytes: Option<u64>,
    pub time_since_fork_sec: Option<u64>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub num_samples: Option<u64>,
    pub sample_range_start: Option<u64>,
    pub sample_range_end: Option<u64>,
    pub cpu_time_sec: Option<f64>,
    pub cycles: Option<u64>,
    pub instructions: Option<u64>,
    pub cpi: Option<f64>,
    pub num_threads: Option<u64>,
    pub notes: Vec<String>,
    pub threads: Vec<TraceThread>,
    pub binary_images: Vec<TraceBinaryImage>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceSharedCache {
    pub uuid: String,
    pub base_address: String,
    pub slide: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceIoStats {
    /// `overall`, `tier0`, `tier1`, `tier2`.
    pub tier: String,
    pub io_count: u64,
    pub io_rate: Option<f64>,
    pub bytes_total: u64,
    pub bytes_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceIoHistogramBucket {
    /// `io_size`, `tier0_latency`, `tier1_latency`, `tier2_latency`.
    pub histogram_type: String,
    /// KB for size histograms, µs for latency histograms.
    pub begin_value: u64,
    /// `None` for the overflow (`> X`) bucket.
    pub end_value: Option<u64>,
    pub frequency: u64,
    pub cdf: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceIoAggregate {
    pub tier: String,
    pub num_ios: u64,
    pub latency_mean_us: Option<u64>,
    pub latency_max_us: Option<u64>,
    pub latency_sd_us: Option<u64>,
    pub read_count: Option<u64>,
    pub read_bytes: Option<u64>,
    pub write_count: Option<u64>,
    pub write_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceHeader {
    pub start_time: String,
    pub end_time: String,
    pub duration_sec: f64,
    pub steps: u64,
    pub sampling_interval_ms: u64,
    pub os_version: String,
    pub architecture: String,
    pub report_version: Option<i64>,
    pub hardware_model: Option<String>,
    pub active_cpus: Option<i64>,
    pub memory_gb: Option<i64>,
    pub hw_page_size: Option<i64>,
    pub vm_page_size: Option<i64>,
    pub time_since_boot_sec: Option<i64>,
    pub time_awake_since_boot_sec: Option<i64>,
    pub total_cpu_time_sec: Option<f64>,
    pub total_cycles: Option<u64>,
    pub total_instructions: Option<u64>,
    pub total_cpi: Option<f64>,
    pub memory_pressure_avg_pct: Option<i64>,
    pub memory_pressure_max_pct: Option<i64>,
    pub available_memory_avg_gb: Option<f64>,
    pub available_memory_min_gb: Option<f64>,
    pub free_disk_gb: Option<f64>,
    pub total_disk_gb: Option<f64>,
    pub advisory_battery: Option<i64>,
    pub advisory_user: Option<i64>,
    pub advisory_thermal: Option<i64>,
    pub advisory_combined: Option<i64>,
    pub shared_cache_residency_pct: Option<f64>,
    pub vnodes_available_pct: Option<f64>,
    pub data_source: Option<String>,
    pub reason: Option<String>,
    pub shared_caches: Vec<TraceSharedCache>,
    pub io_stats: Vec<TraceIoStats>,
}

/// Complete parsed trace document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceData {
    pub header: TraceHeader,
    pub processes: Vec<TraceProcess>,
    pub io_histograms: Vec<TraceIoHistogramBucket>,
    pub io_aggregates: Vec<TraceIoAggregate>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a size string like `14.83 MB` or `674.97 KB` into bytes.
fn parse_size(s: &str) -> u64 {
    static SIZE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)([\d.]+)\s*(KB|MB|GB|B)?").expect("size regex"));
    let Some(caps) = SIZE_RE.captures(s.trim()) else {
        return 0;
    };
    let value: f64 = caps[1].parse().unwrap_or(0.0);
    let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
        Some(u) if u == "KB" => 1024.0,
        Some(u) if u == "MB" => 1024.0 * 1024.0,
        Some(u) if u == "GB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    (value * multiplier) as u64
}

/// Parse a count with an optional suffix like `51.3G` or `87.4G`.
fn parse_count_suffix(s: &str) -> u64 {
    static COUNT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)([\d.]+)([KMGT])?").expect("count regex"));
    let Some(caps) = COUNT_RE.captures(s.trim()) else {
        return 0;
    };
    let value: f64 = caps[1].parse().unwrap_or(0.0);
    let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
        Some(u) if u == "K" => 1e3,
        Some(u) if u == "M" => 1e6,
        Some(u) if u == "G" => 1e9,
        Some(u) if u == "T" => 1e12,
        _ => 1.0,
    };
    (value * multiplier) as u64
}

/// Parse `name [pid]`, returning `(name, pid)`.
fn parse_process_ref(s: &str) -> Option<(String, i64)> {
    static REF_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(.+?)\s+\[(\d+)\]").expect("ref regex"));
    let caps = REF_RE.captures(s.trim())?;
    Some((caps[1].to_string(), caps[2].parse().ok()?))
}

fn tail(line: &str) -> String {
    line.splitn(2, ':').nth(1).unwrap_or("").trim().to_string()
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Parse a complete decoded trace document.
pub fn parse_trace(text: &str) -> TraceData {
    let lines: Vec<&str> = text.split('\n').collect();

    let process_start = lines
        .iter()
        .position(|l| l.starts_with("Process:"))
        .unwrap_or(lines.len());

    let header = parse_header(&lines[..process_start]);

    let io_start = lines[process_start..]
        .iter()
        .rposition(|l| l.starts_with("IO Size Histogram:"))
        .map(|i| process_start + i)
        .unwrap_or(lines.len());

    let processes = parse_processes(&lines[process_start..io_start]);
    let (io_histograms, io_aggregates) = parse_io_section(&lines[io_start.min(lines.len())..]);

    TraceData {
        header,
        processes,
        io_histograms,
        io_aggregates,
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn parse_header(lines: &[&str]) -> TraceHeader {
    static DURATION_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"([\d.]+)s").expect("regex"));
    static STEPS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(\d+)\s*\((\d+)ms").expect("regex"));
    static MEMORY_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(\d+)\s*GB").expect("regex"));
    static SECONDS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)s").expect("regex"));
    static CPU_TOTALS_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"([\d.]+)s\s*\(([\d.]+[KMGT]?)\s*cycles,\s*([\d.]+[KMGT]?)\s*instructions,\s*([\d.]+)c/i\)",
        )
        .expect("regex")
    });
    static PRESSURE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"average\s*(\d+)%.*highest\s*(\d+)%").expect("regex"));
    static AVAIL_MEM_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"average\s*([\d.]+)\s*GB.*lowest\s*([\d.]+)\s*GB").expect("regex")
    });
    static DISK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"([\d.]+)\s*GB/([\d.]+)\s*GB").expect("regex"));
    static PCT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([\d.]+)%").expect("regex"));
    static CACHE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?i)([A-F0-9-]+)\s+slid base address\s+(0x[0-9a-f]+),\s*slide\s+(0x[0-9a-f]+)\s*\(([^)]+)\)",
        )
        .expect("regex")
    });
    static IO_STAT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?i)(\w+):\s*(\d+)\s*IOs?\s*\(([\d.]+)\s*IOs?/s\),\s*([\d.]+\s*[KMGB]+)\s*\(([\d.]+)\s*([KMGB]+)/s\)",
        )
        .expect("regex")
    });

    let mut header = TraceHeader {
        sampling_interval_ms: 10,
        ..Default::default()
    };

    let advisory_fields: [(&str, fn(&mut TraceHeader, i64)); 4] = [
        ("Battery", |h, v| h.advisory_battery = Some(v)),
        ("User", |h, v| h.advisory_user = Some(v)),
        ("ThermalPressure", |h, v| h.advisory_thermal = Some(v)),
        ("Combined", |h, v| h.advisory_combined = Some(v)),
    ];

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        if line.starts_with("Date/Time:") {
            header.start_time = tail(line);
        } else if line.starts_with("End time:") {
            header.end_time = tail(line);
        } else if line.starts_with("Duration:") {
            if let Some(caps) = DURATION_RE.captures(line) {
                header.duration_sec = caps[1].parse().unwrap_or(0.0);
            }
        } else if line.starts_with("Steps:") {
            if let Some(caps) = STEPS_RE.captures(line) {
                header.steps = caps[1].parse().unwrap_or(0);
                header.sampling_interval_ms = caps[2].parse().unwrap_or(10);
            }
        } else if line.starts_with("OS Version:") {
            header.os_version = tail(line);
        } else if line.starts_with("Architecture:") {
            header.architecture = tail(line);
        } else if line.starts_with("Report Version:") {
            header.report_version = tail(line).parse().ok();
        } else if line.starts_with("Hardware model:") {
            header.hardware_model = Some(tail(line));
        } else if line.starts_with("Active cpus:") {
            header.active_cpus = tail(line).parse().ok();
        } else if line.starts_with("Memory size:") {
            if let Some(caps) = MEMORY_RE.captures(line) {
                header.memory_gb = caps[1].parse().ok();
            }
        } else if line.starts_with("HW page size:") {
            header.hw_page_size = tail(line).parse().ok();
        } else if line.starts_with("VM page size:") {
            header.vm_page_size = tail(line).parse().ok();
        } else if line.starts_with("Time Since Boot:") {
            if let Some(caps) = SECONDS_RE.captures(line) {
                header.time_since_boot_sec = caps[1].parse().ok();
            }
        } else if line.starts_with("Time Awake Since Boot:") {
            if let Some(caps) = SECONDS_RE.captures(line) {
                header.time_awake_since_boot_sec = caps[1].parse().ok();
            }
        } else if line.starts_with("Total CPU Time:") {
            if let Some(caps) = CPU_TOTALS_RE.captures(line) {
                header.total_cpu_time_sec = caps[1].parse().ok();
                header.total_cycles = Some(parse_count_suffix(&caps[2]));
                header.total_instructions = Some(parse_count_suffix(&caps[3]));
                header.total_cpi = caps[4].parse().ok();
            }
        } else if line.starts_with("Memory pressure:") {
            if let Some(caps) = PRESSURE_RE.captures(line) {
                header.memory_pressure_avg_pct = caps[1].parse().ok();
                header.memory_pressure_max_pct = caps[2].parse().ok();
            }
        } else if line.starts_with("Available memory:") {
            if let Some(caps) = AVAIL_MEM_RE.captures(line) {
                header.available_memory_avg_gb = caps[1].parse().ok();
                header.available_memory_min_gb = caps[2].parse().ok();
            }
        } else if line.starts_with("Free disk space:") {
            if let Some(caps) = DISK_RE.captures(line) {
                header.free_disk_gb = caps[1].parse().ok();
                header.total_disk_gb = caps[2].parse().ok();
            }
        } else if line.starts_with("Advisory levels:") {
            for (key, set) in &advisory_fields {
                let re = Regex::new(&format!(r"{key}\s*->\s*(\d+)")).expect("advisory regex");
                if let Some(caps) = re.captures(line) {
                    if let Ok(v) = caps[1].parse() {
                        set(&mut header, v);
                    }
                }
            }
        } else if line.starts_with("Shared cache residency:") {
            if let Some(caps) = PCT_RE.captures(line) {
                header.shared_cache_residency_pct = caps[1].parse().ok();
            }
        } else if line.starts_with("Vnodes Available:") {
            if let Some(caps) = PCT_RE.captures(line) {
                header.vnodes_available_pct = caps[1].parse().ok();
            }
        } else if line.starts_with("Data Source:") {
            header.data_source = Some(tail(line));
        } else if line.starts_with("Reason:") {
            header.reason = Some(tail(line));
        } else if line.starts_with("Shared Cache:") {
            if let Some(caps) = CACHE_RE.captures(line) {
                header.shared_caches.push(TraceSharedCache {
                    uuid: caps[1].to_string(),
                    base_address: caps[2].to_string(),
                    slide: caps[3].to_string(),
                    name: caps[4].to_string(),
                });
            }
        } else if line.starts_with("I/O statistics:") {
            // Indented stats lines follow.
            let mut j = i + 1;
            while j < lines.len() && lines[j].starts_with("  ") {
                if let Some(caps) = IO_STAT_RE.captures(lines[j].trim()) {
                    let bytes_unit = match caps[6].to_ascii_uppercase().as_str() {
                        "KB" => 1024.0,
                        "MB" => 1024.0 * 1024.0,
                        "GB" => 1024.0 * 1024.0 * 1024.0,
                        _ => 1.0,
                    };
                    header.io_stats.push(TraceIoStats {
                        tier: caps[1].to_ascii_lowercase(),
                        io_count: caps[2].parse().unwrap_or(0),
                        io_rate: caps[3].parse().ok(),
                        bytes_total: parse_size(&caps[4]),
                        bytes_rate: caps[5].parse::<f64>().ok().map(|r| r * bytes_unit),
                    });
                }
                j += 1;
            }
            i = j - 1;
        }

        i += 1;
    }

    header
}

// ---------------------------------------------------------------------------
// Process blocks
// ---------------------------------------------------------------------------

static PROCESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Process:\s+(.+?)\s+\[(\d+)\]").expect("process regex"));
static THREAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)^\s{2}Thread\s+(0x[0-9a-f]+)(?:\s+DispatchQueue\s+"([^"]+)"\((\d+)\))?(?:\s+Thread name\s+"([^"]+)")?(?:\s+(\d+)\s+samples?\s*\((\d+)-(\d+)\))?(?:\s+priority\s+(\d+)\s*\(base\s+(\d+)\))?(?:\s+cpu time\s+([\d.]+)s\s*\(([\d.]+[KMGT]?)\s*cycles,\s*([\d.]+[KMGT]?)\s*instructions,\s*([\d.]+)c/i\))?(?:\s+(\d+)\s+I/Os?\s*\(([^)]+)\))?"#,
    )
    .expect("thread regex")
});
static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s+(\*?)(\d+)\s+(.+?)\s+\[(0x[0-9a-f]+)\](?:\s+\(([^)]+)\))?$")
        .expect("frame regex")
});
static BINARY_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s+(\*?)(0x[0-9a-f]+)\s*-\s*(0x[0-9a-f]+|(?:\?\?\?))\s+(.+?)\s+<([A-F0-9-]+)>(?:__TEXT_EXEC)?\s*(.*)$",
    )
    .expect("binary image regex")
});
static NAME_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.+?)\s+(\d[\d.]*(?:\s*\([^)]+\))?)\s*$").expect("regex"));
static SYMBOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.+?)\s*\+\s*(\d+)\s*\((.+?)\s*\+\s*(\d+)\)").expect("regex"));
static LIB_ONLY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\?\?\?\s*\((.+?)\s*\+\s*(\d+)\)").expect("regex"));
static NUM_SAMPLES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*\((\d+)-(\d+)\)").expect("regex"));
static CPU_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"([\d.]+)s\s*\(([\d.]+[KMGT]?)\s*cycles,\s*([\d.]+[KMGT]?)\s*instructions,\s*([\d.]+)c/i\)",
    )
    .expect("regex")
});
static IO_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*I/Os?\s*\(([^)]+)\)").expect("regex"));
static FOOTPRINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d.]+)\s*(KB|MB|GB)").expect("regex"));
static FOOTPRINT_DELTA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\+?([\d.]+)\s*(KB|MB|GB)\)").expect("regex"));
static SHARED_CACHE_UUID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([A-F0-9-]+)\s+slid").expect("regex"));
static FIRST_INT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)").expect("regex"));
static FIRST_SECS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([\d.]+)s").expect("regex"));

fn mb_value(value: f64, unit: &str) -> f64 {
    match unit.to_ascii_uppercase().as_str() {
        "KB" => value / 1024.0,
        "GB" => value * 1024.0,
        _ => value,
    }
}

fn parse_processes(lines: &[&str]) -> Vec<TraceProcess> {
    let mut processes: Vec<TraceProcess> = Vec::new();
    let mut current: Option<TraceProcess> = None;
    let mut current_thread: Option<TraceThread> = None;
    let mut in_binary_images = false;

    let finish_thread = |proc_: &mut TraceProcess, thread: &mut Option<TraceThread>| {
        if let Some(t) = thread.take() {
            proc_.threads.push(t);
        }
    };

    for line in lines {
        if let Some(caps) = PROCESS_RE.captures(line) {
            if let Some(mut done) = current.take() {
                finish_thread(&mut done, &mut current_thread);
                processes.push(done);
            }
            current = Some(TraceProcess {
                pid: caps[2].parse().unwrap_or(0),
                name: caps[1].to_string(),
                ..Default::default()
            });
            in_binary_images = false;
            continue;
        }

        let Some(proc_) = current.as_mut() else {
            continue;
        };

        if line.trim() == "Binary Images:" {
            finish_thread(proc_, &mut current_thread);
            in_binary_images = true;
            continue;
        }

        if in_binary_images {
            if let Some(caps) = BINARY_IMAGE_RE.captures(line) {
                let end = &caps[3];
                let name_version = caps[4].trim();
                let (name, version) = match NAME_VERSION_RE.captures(name_version) {
                    Some(nv) => (nv[1].trim().to_string(), Some(nv[2].trim().to_string())),
                    None => (name_version.to_string(), None),
                };
                let path = caps.get(6).map(|m| m.as_str().trim()).filter(|p| !p.is_empty());
                proc_.binary_images.push(TraceBinaryImage {
                    start_address: caps[2].to_string(),
                    end_address: (end != "???").then(|| end.to_string()),
                    name,
                    version,
                    uuid: Some(caps[5].to_string()),
                    path: path.map(str::to_string),
                    is_kernel: &caps[1] == "*",
                });
            } else if !line.trim().is_empty() && !line.starts_with(' ') {
                in_binary_images = false;
            }
            continue;
        }

        if line.starts_with("UUID:") {
            proc_.uuid = Some(tail(line));
        } else if line.starts_with("Path:") {
            proc_.path = Some(tail(line));
        } else if line.starts_with("Identifier:") {
            proc_.identifier = Some(tail(line));
        } else if line.starts_with("Version:") {
            proc_.version = Some(tail(line));
        } else if line.starts_with("Parent:") {
            if let Some((name, pid)) = parse_process_ref(&tail(line)) {
                proc_.parent_name = Some(name);
                proc_.parent_pid = Some(pid);
            }
        } else if line.starts_with("Responsible:") {
            if let Some((name, pid)) = parse_process_ref(&tail(line)) {
                proc_.responsible_name = Some(name);
                proc_.responsible_pid = Some(pid);
            }
        } else if line.starts_with("Execed from:") {
            if let Some((name, pid)) = parse_process_ref(&tail(line)) {
                proc_.execed_from_name = Some(name);
                proc_.execed_from_pid = Some(pid);
            }
        } else if line.starts_with("Execed to:") {
            if let Some((name, pid)) = parse_process_ref(&tail(line)) {
                proc_.execed_to_name = Some(name);
                proc_.execed_to_pid = Some(pid);
            }
        } else if line.starts_with("Architecture:") {
            proc_.architecture = Some(tail(line));
        } else if line.starts_with("Shared Cache:") {
            if let Some(caps) = SHARED_CACHE_UUID_RE.captures(line) {
                proc_.shared_cache_uuid = Some(caps[1].to_string());
            }
        } else if line.starts_with("RunningBoard Mgd:") {
            proc_.runningboard_managed = Some(line.contains("Yes"));
        } else if line.starts_with("Sudden Term:") {
            proc_.sudden_term = Some(tail(line));
        } else if line.starts_with("Note:") {
            proc_.notes.push(tail(line));
        } else if line.starts_with("Footprint:") {
            if let Some(caps) = FOOTPRINT_RE.captures(line) {
                let value: f64 = caps[1].parse().unwrap_or(0.0);
                proc_.footprint_mb = Some(mb_value(value, &caps[2]));
            }
            if let Some(caps) = FOOTPRINT_DELTA_RE.captures(line) {
                let value: f64 = caps[1].parse().unwrap_or(0.0);
                proc_.footprint_delta_mb = Some(mb_value(value, &caps[2]));
            }
        } else if line.starts_with("I/O:") {
            if let Some(caps) = IO_LINE_RE.captures(line) {
                proc_.io_count = caps[1].parse().ok();
                proc_.io_bytes = Some(parse_size(&caps[2]));
            }
        } else if line.starts_with("Time Since Fork:") {
            if let Some(caps) = FIRST_INT_RE.captures(line) {
                proc_.time_since_fork_sec = caps[1].parse().ok();
            }
        } else if line.starts_with("Start time:") {
            proc_.start_time = Some(tail(line));
        } else if line.starts_with("End time:") && proc_.start_time.is_some() {
            // Only short-lived processes carry their own end time.
            proc_.end_time = Some(tail(line));
        } else if line.starts_with("Num samples:") {
            if let Some(caps) = NUM_SAMPLES_RE.captures(line) {
                proc_.num_samples = caps[1].parse().ok();
                proc_.sample_range_start = caps[2].parse().ok();
                proc_.sample_range_end = caps[3].parse().ok();
            } else if let Some(caps) = FIRST_INT_RE.captures(line) {
                proc_.num_samples = caps[1].parse().ok();
            }
        } else if line.starts_with("CPU Time:") {
            if let Some(caps) = CPU_TIME_RE.captures(line) {
                proc_.cpu_time_sec = caps[1].parse().ok();
                proc_.cycles = Some(parse_count_suffix(&caps[2]));
                proc_.instructions = Some(parse_count_suffix(&caps[3]));
                proc_.cpi = caps[4].parse().ok();
            } else if let Some(caps) = FIRST_SECS_RE.captures(line) {
                proc_.cpu_time_sec = caps[1].parse().ok();
            }
        } else if line.starts_with("Num threads:") {
            if let Some(caps) = FIRST_INT_RE.captures(line) {
                proc_.num_threads = caps[1].parse().ok();
            }
        } else if let Some(caps) = THREAD_RE.captures(line) {
            finish_thread(proc_, &mut current_thread);

            let mut thread = TraceThread {
                thread_id: caps[1].to_string(),
                ..Default::default()
            };
            thread.dispatch_queue_name = caps.get(2).map(|m| m.as_str().to_string());
            thread.dispatch_queue_serial = caps.get(3).and_then(|m| m.as_str().parse().ok());
            thread.thread_name = caps.get(4).map(|m| m.as_str().to_string());
            thread.num_samples = caps.get(5).and_then(|m| m.as_str().parse().ok());
            thread.sample_range_start = caps.get(6).and_then(|m| m.as_str().parse().ok());
            thread.sample_range_end = caps.get(7).and_then(|m| m.as_str().parse().ok());
            thread.priority = caps.get(8).and_then(|m| m.as_str().parse().ok());
            thread.base_priority = caps.get(9).and_then(|m| m.as_str().parse().ok());
            thread.cpu_time_sec = caps.get(10).and_then(|m| m.as_str().parse().ok());
            thread.cycles = caps.get(11).map(|m| parse_count_suffix(m.as_str()));
            thread.instructions = caps.get(12).map(|m| parse_count_suffix(m.as_str()));
            thread.cpi = caps.get(13).and_then(|m| m.as_str().parse().ok());
            thread.io_count = caps.get(14).and_then(|m| m.as_str().parse().ok());
            thread.io_bytes = caps.get(15).map(|m| parse_size(m.as_str()));
            current_thread = Some(thread);
        } else if current_thread.is_some() {
            if let Some(caps) = FRAME_RE.captures(line) {
                let indent = line.len() - line.trim_start().len();
                let depth = indent.saturating_sub(2) as u32 / 2;

                let symbol_info = caps[3].trim().to_string();
                let mut frame = TraceFrame {
                    sample_count: caps[2].parse().unwrap_or(0),
                    is_kernel: &caps[1] == "*",
                    address: caps[4].to_string(),
                    depth,
                    ..Default::default()
                };

                if symbol_info != "???" {
                    if let Some(sym) = SYMBOL_RE.captures(&symbol_info) {
                        frame.symbol_name = Some(sym[1].trim().to_string());
                        frame.symbol_offset = sym[2].parse().ok();
                        frame.library_name = Some(sym[3].trim().to_string());
                        frame.library_offset = sym[4].parse().ok();
                    } else if let Some(lib) = LIB_ONLY_RE.captures(&symbol_info) {
                        frame.library_name = Some(lib[1].trim().to_string());
                        frame.library_offset = lib[2].parse().ok();
                    }
                }

                if let Some(state_info) = caps.get(5).map(|m| m.as_str()) {
                    let lowered = state_info.to_ascii_lowercase();
                    if lowered.contains("running") {
                        frame.state = Some("running".to_string());
                        if lowered.contains("p-core") {
                            frame.core_type = Some("p-core".to_string());
                        } else if lowered.contains("e-core") {
                            frame.core_type = Some("e-core".to_string());
                        }
                    } else if lowered.contains("blocked by wait4") {
                        frame.state = Some("blocked".to_string());
                        static BLOCKED_RE: LazyLock<Regex> = LazyLock::new(|| {
                            Regex::new(r"(?i)blocked by wait4 on\s+(.+)").expect("regex")
                        });
                        if let Some(b) = BLOCKED_RE.captures(state_info) {
                            frame.blocked_on = Some(b[1].trim().to_string());
                        }
                    }
                }

                if let Some(t) = current_thread.as_mut() {
                    t.frames.push(frame);
                }
            }
        }
    }

    if let Some(mut done) = current.take() {
        finish_thread(&mut done, &mut current_thread);
        processes.push(done);
    }

    processes
}

// ---------------------------------------------------------------------------
// Trailing I/O section
// ---------------------------------------------------------------------------

fn parse_io_section(lines: &[&str]) -> (Vec<TraceIoHistogramBucket>, Vec<TraceIoAggregate>) {
    static TIER_LATENCY_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"Tier\s*(\d+)\s*Latency").expect("regex"));
    static TIER_AGG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"Tier\s*(\d+)\s*Aggregate").expect("regex"));
    static NUM_IOS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"Num IOs\s*(\d+)").expect("regex"));
    static LAT_MEAN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"Latency Mean\s*(\d+)us").expect("regex"));
    static LAT_MAX_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"Max Latency\s*(\d+)us").expect("regex"));
    static LAT_SD_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"Latency SD\s*(\d+)us").expect("regex"));
    static READS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"Reads\s*(\d+)\s*\(([^)]+)\)").expect("regex"));
    static WRITES_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"Writes\s*(\d+)\s*\(([^)]+)\)").expect("regex"));
    static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("regex"));

    let digits = |s: &str| -> Option<u64> {
        DIGITS_RE.find(s).and_then(|m| m.as_str().parse().ok())
    };

    let mut histograms = Vec::new();
    let mut aggregates = Vec::new();
    let mut current_type: Option<String> = None;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim();

        if line == "IO Size Histogram:" {
            current_type = Some("io_size".to_string());
        } else if line.ends_with("Latency Histogram:") {
            if let Some(caps) = TIER_LATENCY_RE.captures(line) {
                current_type = Some(format!("tier{}_latency", &caps[1]));
            }
        } else if line.ends_with("Aggregate Stats:") {
            if let Some(caps) = TIER_AGG_RE.captures(line) {
                let mut agg = TraceIoAggregate {
                    tier: format!("tier{}", &caps[1]),
                    ..Default::default()
                };
                i += 1;
                if i < lines.len() {
                    let stats_line = lines[i].trim();
                    agg.num_ios = NUM_IOS_RE
                        .captures(stats_line)
                        .and_then(|c| c[1].parse().ok())
                        .unwrap_or(0);
                    agg.latency_mean_us =
                        LAT_MEAN_RE.captures(stats_line).and_then(|c| c[1].parse().ok());
                    agg.latency_max_us =
                        LAT_MAX_RE.captures(stats_line).and_then(|c| c[1].parse().ok());
                    agg.latency_sd_us =
                        LAT_SD_RE.captures(stats_line).and_then(|c| c[1].parse().ok());

                    i += 1;
                    if i < lines.len() {
                        let rw_line = lines[i].trim();
                        if let Some(caps) = READS_RE.captures(rw_line) {
                            agg.read_count = caps[1].parse().ok();
                            agg.read_bytes = Some(parse_size(&caps[2]));
                        }
                        if let Some(caps) = WRITES_RE.captures(rw_line) {
                            agg.write_count = caps[1].parse().ok();
                            agg.write_bytes = Some(parse_size(&caps[2]));
                        }
                    }
                }
                aggregates.push(agg);
                current_type = None;
            }
        } else if let Some(hist_type) = &current_type {
            if !line.is_empty() && !line.starts_with("Begin") {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() >= 4 {
                    let bucket = if parts[0] == ">" {
                        digits(parts[1]).map(|begin| (begin, None, parts[2], parts[3]))
                    } else {
                        match (digits(parts[0]), digits(parts[1])) {
                            (Some(begin), Some(end)) => Some((begin, Some(end), parts[2], parts[3])),
                            _ => None,
                        }
                    };
                    if let Some((begin_value, end_value, freq_s, cdf_s)) = bucket {
                        if let (Ok(frequency), Ok(cdf)) = (freq_s.parse(), cdf_s.parse()) {
                            histograms.push(TraceIoHistogramBucket {
                                histogram_type: hist_type.clone(),
                                begin_value,
                                end_value,
                                frequency,
                                cdf,
                            });
                        }
                    }
                }
            }
        }

        i += 1;
    }

    (histograms, aggregates)
}
