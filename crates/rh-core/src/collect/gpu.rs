//! Per-process GPU time from the GPU registry.
//!
//! Each GPU-using process owns an `AGXDeviceUserClient` registry entry whose
//! `IOUserClientCreator` property names the PID ("pid 410, WindowServer") and
//! whose `AppUsage` array carries `accumulatedGPUTime` in nanoseconds. Most
//! processes never touch the GPU and simply have no entry.
//!
//! # Graceful degradation
//! One registry scan per sampling cycle, best-effort: a missing tool, a
//! non-zero exit, or unparseable output all yield an empty map, never an
//! error.

use regex::Regex;
use std::collections::HashMap;
use std::process::Command;
use std::sync::LazyLock;
use tracing::trace;

/// Best-effort map of pid → cumulative GPU nanoseconds.
pub trait GpuSource: Send {
    fn gpu_usage(&self) -> HashMap<u32, u64>;
}

/// Queries the registry dump tool (`ioreg`) once per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoregGpuSource;

impl IoregGpuSource {
    pub fn new() -> Self {
        Self
    }
}

impl GpuSource for IoregGpuSource {
    fn gpu_usage(&self) -> HashMap<u32, u64> {
        let output = match Command::new("/usr/sbin/ioreg")
            .args(["-r", "-d", "1", "-c", "AGXDeviceUserClient", "-w", "0"])
            .output()
        {
            Ok(out) if out.status.success() => out,
            Ok(_) | Err(_) => {
                trace!("gpu registry scan unavailable");
                return HashMap::new();
            }
        };

        parse_ioreg_clients(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Fixed map for tests and non-macOS builds.
#[derive(Debug, Default, Clone)]
pub struct MockGpuSource {
    pub usage: HashMap<u32, u64>,
}

impl GpuSource for MockGpuSource {
    fn gpu_usage(&self) -> HashMap<u32, u64> {
        self.usage.clone()
    }
}

static CREATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""IOUserClientCreator"\s*=\s*"pid\s+(\d+),"#).expect("regex"));
static GPU_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""accumulatedGPUTime"\s*=\s*(\d+)"#).expect("regex"));

/// Parse registry dump text into pid → accumulated GPU ns.
///
/// The dump is a sequence of `+-o <Class>` blocks; within one block the
/// property order is not guaranteed, so the block is collected first and
/// scanned as a whole. A process with several GPU contexts owns several
/// client entries; their times accumulate.
pub fn parse_ioreg_clients(text: &str) -> HashMap<u32, u64> {
    let mut result: HashMap<u32, u64> = HashMap::new();
    let mut block = String::new();

    let mut flush = |block: &str, result: &mut HashMap<u32, u64>| {
        let Some(caps) = CREATOR_RE.captures(block) else {
            return;
        };
        let Ok(pid) = caps[1].parse::<u32>() else {
            return;
        };
        let total: u64 = GPU_TIME_RE
            .captures_iter(block)
            .filter_map(|c| c[1].parse::<u64>().ok())
            .sum();
        if total > 0 {
            *result.entry(pid).or_insert(0) += total;
        }
    };

    for line in text.lines() {
        if line.trim_start().starts_with("+-o ") {
            flush(&block, &mut result);
            block.clear();
        }
        block.push_str(line);
        block.push('\n');
    }
    flush(&block, &mut result);

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"+-o AGXDeviceUserClientG15  <class AGXDeviceUserClient, id 0x100001a2b, !registered>
    {
      "AppUsage" = ({"accumulatedGPUTime"=48213685,"finalized"=0})
      "IOUserClientCreator" = "pid 410, WindowServer"
    }
+-o AGXDeviceUserClientG15  <class AGXDeviceUserClient, id 0x100001a2c, !registered>
    {
      "IOUserClientCreator" = "pid 9321, Safari"
      "AppUsage" = ({"accumulatedGPUTime"=1000,"finalized"=0},{"accumulatedGPUTime"=2500})
    }
"#;

    #[test]
    fn parses_pid_and_gpu_time() {
        let usage = parse_ioreg_clients(SAMPLE);
        assert_eq!(usage.get(&410), Some(&48_213_685));
    }

    #[test]
    fn sums_multiple_app_usage_entries() {
        let usage = parse_ioreg_clients(SAMPLE);
        assert_eq!(usage.get(&9321), Some(&3500));
    }

    #[test]
    fn accumulates_across_multiple_clients_for_same_pid() {
        let text = r#"+-o AGXDeviceUserClient  <class AGXDeviceUserClient>
      "IOUserClientCreator" = "pid 7, game"
      "AppUsage" = ({"accumulatedGPUTime"=100})
+-o AGXDeviceUserClient  <class AGXDeviceUserClient>
      "IOUserClientCreator" = "pid 7, game"
      "AppUsage" = ({"accumulatedGPUTime"=250})
"#;
        let usage = parse_ioreg_clients(text);
        assert_eq!(usage.get(&7), Some(&350));
    }

    #[test]
    fn block_without_creator_is_ignored() {
        let text = "+-o Thing\n  \"AppUsage\" = ({\"accumulatedGPUTime\"=99})\n";
        assert!(parse_ioreg_clients(text).is_empty());
    }

    #[test]
    fn zero_gpu_time_yields_no_entry() {
        let text = r#"+-o AGXDeviceUserClient
      "IOUserClientCreator" = "pid 5, idle_app"
      "AppUsage" = ({"accumulatedGPUTime"=0})
"#;
        assert!(parse_ioreg_clients(text).is_empty());
    }

    #[test]
    fn empty_and_garbage_input() {
        assert!(parse_ioreg_clients("").is_empty());
        assert!(parse_ioreg_clients("not an ioreg dump at all").is_empty());
    }

    #[test]
    fn mock_source_returns_configured_map() {
        let mut usage = HashMap::new();
        usage.insert(1u32, 500u64);
        let source = MockGpuSource { usage };
        assert_eq!(source.gpu_usage().get(&1), Some(&500));
    }
}
