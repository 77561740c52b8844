//! Per-process kernel metrics behind a narrow adapter trait.
//!
//! `LibprocSource` calls `libproc.dylib` directly on macOS (`proc_pid_rusage`,
//! `proc_pidinfo`, `proc_listallpids`, `proc_name`), with no subprocess overhead.
//! `MockSource` serves tests and non-macOS builds.
//!
//! Process disappearance and permission denial are reported as `None`; the
//! sampler drops such PIDs for the tick without error.

use std::collections::HashMap;

use rh_common::Result;

// ---------------------------------------------------------------------------
// Timebase
// ---------------------------------------------------------------------------

/// Mach timebase for converting absolute time to nanoseconds.
///
/// Intel reports (1, 1): absolute time already is nanoseconds. Apple
/// Silicon reports (125, 3), ~41.67 ns per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    pub numer: u32,
    pub denom: u32,
}

impl Timebase {
    /// Identity timebase (ticks are nanoseconds).
    pub const IDENTITY: Timebase = Timebase { numer: 1, denom: 1 };

    /// Convert mach-absolute ticks to nanoseconds (integer math).
    pub fn abs_to_ns(self, ticks: u64) -> u64 {
        ((ticks as u128 * self.numer as u128) / self.denom.max(1) as u128) as u64
    }
}

// ---------------------------------------------------------------------------
// Adapter-facing records
// ---------------------------------------------------------------------------

/// Cumulative per-process counters from `proc_pid_rusage` (RUSAGE_INFO_V4).
///
/// CPU, runnable, and QoS times are in mach-absolute units and must go
/// through [`Timebase::abs_to_ns`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rusage {
    pub user_time: u64,
    pub system_time: u64,
    pub pkg_idle_wkups: u64,
    pub interrupt_wkups: u64,
    pub pageins: u64,
    pub phys_footprint: u64,
    pub lifetime_max_phys_footprint: u64,
    pub diskio_bytesread: u64,
    pub diskio_byteswritten: u64,
    pub billed_energy: u64,
    pub instructions: u64,
    pub cycles: u64,
    pub runnable_time: u64,
    pub qos_user_interactive: u64,
}

/// Scheduler-facing counters from `proc_pidinfo(PROC_PIDTASKINFO)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskInfo {
    pub threadnum: u32,
    pub csw: u64,
    pub syscalls_mach: u64,
    pub syscalls_unix: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub faults: u64,
    pub priority: i32,
}

/// Identity and state from `proc_pidinfo(PROC_PIDTBSDINFO)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BsdInfo {
    /// Raw `pbi_status`; map with `ProcessState::from_status`.
    pub status: u32,
    pub ppid: u32,
    pub comm: String,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Narrow contract over the per-process kernel API and boot-time sysctl.
pub trait ProcessDataSource: Send {
    /// Live PIDs, excluding 0.
    fn list_all_pids(&self) -> Vec<u32>;

    /// `None` when the process is gone or access is denied.
    fn rusage(&self, pid: u32) -> Option<Rusage>;
    fn task_info(&self, pid: u32) -> Option<TaskInfo>;
    fn bsd_info(&self, pid: u32) -> Option<BsdInfo>;

    /// Preferred display name; empty string when unavailable.
    fn process_name(&self, pid: u32) -> String;

    /// Mach timebase, fetched once per process start.
    fn timebase(&self) -> Timebase;

    /// System boot time as Unix seconds. Partitions events between boots.
    fn boot_time(&self) -> Result<i64>;
}

// ---------------------------------------------------------------------------
// macOS implementation
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
mod sys {
    use libc::{c_char, c_int, c_uint, c_void};

    pub const RUSAGE_INFO_V4: c_int = 4;
    pub const PROC_PIDTASKINFO: c_int = 4;
    pub const PROC_PIDTBSDINFO: c_int = 3;
    pub const MAXCOMLEN: usize = 16;

    /// rusage_info_v4 from sys/resource.h.
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct RusageInfoV4 {
        pub ri_uuid: [u8; 16],
        pub ri_user_time: u64,
        pub ri_system_time: u64,
        pub ri_pkg_idle_wkups: u64,
        pub ri_interrupt_wkups: u64,
        pub ri_pageins: u64,
        pub ri_wired_size: u64,
        pub ri_resident_size: u64,
        pub ri_phys_footprint: u64,
        pub ri_proc_start_abstime: u64,
        pub ri_proc_exit_abstime: u64,
        pub ri_child_user_time: u64,
        pub ri_child_system_time: u64,
        pub ri_child_pkg_idle_wkups: u64,
        pub ri_child_interrupt_wkups: u64,
        pub ri_child_pageins: u64,
        pub ri_child_elapsed_abstime: u64,
        pub ri_diskio_bytesread: u64,
        pub ri_diskio_byteswritten: u64,
        pub ri_cpu_time_qos_default: u64,
        pub ri_cpu_time_qos_maintenance: u64,
        pub ri_cpu_time_qos_background: u64,
        pub ri_cpu_time_qos_utility: u64,
        pub ri_cpu_time_qos_legacy: u64,
        pub ri_cpu_time_qos_user_initiated: u64,
        pub ri_cpu_time_qos_user_interactive: u64,
        pub ri_billed_system_time: u64,
        pub ri_serviced_system_time: u64,
        pub ri_logical_writes: u64,
        pub ri_lifetime_max_phys_footprint: u64,
        pub ri_instructions: u64,
        pub ri_cycles: u64,
        pub ri_billed_energy: u64,
        pub ri_serviced_energy: u64,
        pub ri_interval_max_phys_footprint: u64,
        pub ri_runnable_time: u64,
    }

    /// proc_taskinfo from sys/proc_info.h.
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct ProcTaskInfo {
        pub pti_virtual_size: u64,
        pub pti_resident_size: u64,
        pub pti_total_user: u64,
        pub pti_total_system: u64,
        pub pti_threads_user: u64,
        pub pti_threads_system: u64,
        pub pti_policy: i32,
        pub pti_faults: i32,
        pub pti_pageins: i32,
        pub pti_cow_faults: i32,
        pub pti_messages_sent: i32,
        pub pti_messages_received: i32,
        pub pti_syscalls_mach: i32,
        pub pti_syscalls_unix: i32,
        pub pti_csw: i32,
        pub pti_threadnum: i32,
        pub pti_numrunning: i32,
        pub pti_priority: i32,
    }

    /// proc_bsdinfo from sys/proc_info.h (prefix consumed by the daemon).
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct ProcBsdInfo {
        pub pbi_flags: u32,
        pub pbi_status: u32,
        pub pbi_xstatus: u32,
        pub pbi_pid: u32,
        pub pbi_ppid: u32,
        pub pbi_uid: u32,
        pub pbi_gid: u32,
        pub pbi_ruid: u32,
        pub pbi_rgid: u32,
        pub pbi_svuid: u32,
        pub pbi_svgid: u32,
        pub pbi_rfu_1: u32,
        pub pbi_comm: [c_char; MAXCOMLEN],
        pub pbi_name: [c_char; 2 * MAXCOMLEN],
        pub pbi_nfiles: u32,
        pub pbi_pgid: u32,
        pub pbi_pjobc: u32,
        pub pbi_e_tdev: u32,
        pub pbi_e_tpgid: u32,
        pub pbi_nice: i32,
        pub pbi_start_tvsec: u64,
        pub pbi_start_tvusec: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct MachTimebaseInfo {
        pub numer: u32,
        pub denom: u32,
    }

    extern "C" {
        pub fn proc_pid_rusage(pid: c_int, flavor: c_int, buffer: *mut c_void) -> c_int;
        pub fn proc_pidinfo(
            pid: c_int,
            flavor: c_int,
            arg: u64,
            buffer: *mut c_void,
            buffersize: c_int,
        ) -> c_int;
        pub fn proc_listallpids(buffer: *mut c_void, buffersize: c_int) -> c_int;
        pub fn proc_name(pid: c_int, buffer: *mut c_void, buffersize: c_uint) -> c_int;
        pub fn mach_timebase_info(info: *mut MachTimebaseInfo) -> c_int;
    }
}

/// Direct libproc adapter for macOS.
#[cfg(target_os = "macos")]
#[derive(Debug, Default, Clone, Copy)]
pub struct LibprocSource;

#[cfg(target_os = "macos")]
impl LibprocSource {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "macos")]
impl ProcessDataSource for LibprocSource {
    fn list_all_pids(&self) -> Vec<u32> {
        // First call with NULL to size the buffer, then fetch.
        let count = unsafe { sys::proc_listallpids(std::ptr::null_mut(), 0) };
        if count <= 0 {
            return Vec::new();
        }
        let mut buffer = vec![0i32; count as usize];
        let bytes = (buffer.len() * std::mem::size_of::<i32>()) as libc::c_int;
        let actual = unsafe { sys::proc_listallpids(buffer.as_mut_ptr().cast(), bytes) };
        if actual <= 0 {
            return Vec::new();
        }
        buffer
            .into_iter()
            .take(actual as usize)
            .filter(|&pid| pid > 0)
            .map(|pid| pid as u32)
            .collect()
    }

    fn rusage(&self, pid: u32) -> Option<Rusage> {
        let mut raw: sys::RusageInfoV4 = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            sys::proc_pid_rusage(pid as i32, sys::RUSAGE_INFO_V4, (&mut raw as *mut _).cast())
        };
        if rc != 0 {
            return None;
        }
        Some(Rusage {
            user_time: raw.ri_user_time,
            system_time: raw.ri_system_time,
            pkg_idle_wkups: raw.ri_pkg_idle_wkups,
            interrupt_wkups: raw.ri_interrupt_wkups,
            pageins: raw.ri_pageins,
            phys_footprint: raw.ri_phys_footprint,
            lifetime_max_phys_footprint: raw.ri_lifetime_max_phys_footprint,
            diskio_bytesread: raw.ri_diskio_bytesread,
            diskio_byteswritten: raw.ri_diskio_byteswritten,
            billed_energy: raw.ri_billed_energy,
            instructions: raw.ri_instructions,
            cycles: raw.ri_cycles,
            runnable_time: raw.ri_runnable_time,
            qos_user_interactive: raw.ri_cpu_time_qos_user_interactive,
        })
    }

    fn task_info(&self, pid: u32) -> Option<TaskInfo> {
        let mut raw: sys::ProcTaskInfo = unsafe { std::mem::zeroed() };
        let size = std::mem::size_of::<sys::ProcTaskInfo>() as libc::c_int;
        let rc = unsafe {
            sys::proc_pidinfo(
                pid as i32,
                sys::PROC_PIDTASKINFO,
                0,
                (&mut raw as *mut _).cast(),
                size,
            )
        };
        if rc <= 0 {
            return None;
        }
        Some(TaskInfo {
            threadnum: raw.pti_threadnum.max(0) as u32,
            csw: raw.pti_csw.max(0) as u64,
            syscalls_mach: raw.pti_syscalls_mach.max(0) as u64,
            syscalls_unix: raw.pti_syscalls_unix.max(0) as u64,
            messages_sent: raw.pti_messages_sent.max(0) as u64,
            messages_received: raw.pti_messages_received.max(0) as u64,
            faults: raw.pti_faults.max(0) as u64,
            priority: raw.pti_priority,
        })
    }

    fn bsd_info(&self, pid: u32) -> Option<BsdInfo> {
        let mut raw: sys::ProcBsdInfo = unsafe { std::mem::zeroed() };
        let size = std::mem::size_of::<sys::ProcBsdInfo>() as libc::c_int;
        let rc = unsafe {
            sys::proc_pidinfo(
                pid as i32,
                sys::PROC_PIDTBSDINFO,
                0,
                (&mut raw as *mut _).cast(),
                size,
            )
        };
        if rc <= 0 {
            return None;
        }
        let comm_bytes: Vec<u8> = raw
            .pbi_comm
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        Some(BsdInfo {
            status: raw.pbi_status,
            ppid: raw.pbi_ppid,
            comm: String::from_utf8_lossy(&comm_bytes).into_owned(),
        })
    }

    fn process_name(&self, pid: u32) -> String {
        let mut buffer = [0u8; 2 * sys::MAXCOMLEN];
        let rc = unsafe {
            sys::proc_name(pid as i32, buffer.as_mut_ptr().cast(), buffer.len() as u32)
        };
        if rc <= 0 {
            return String::new();
        }
        let len = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
        String::from_utf8_lossy(&buffer[..len]).into_owned()
    }

    fn timebase(&self) -> Timebase {
        let mut info = sys::MachTimebaseInfo { numer: 1, denom: 1 };
        unsafe { sys::mach_timebase_info(&mut info) };
        Timebase {
            numer: info.numer,
            denom: info.denom,
        }
    }

    fn boot_time(&self) -> Result<i64> {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let mut size = std::mem::size_of::<libc::timeval>();
        let name = b"kern.boottime\0";
        let rc = unsafe {
            libc::sysctlbyname(
                name.as_ptr().cast(),
                (&mut tv as *mut libc::timeval).cast(),
                &mut size,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc != 0 {
            return Err(rh_common::Error::BootTime(
                "sysctl kern.boottime failed".into(),
            ));
        }
        Ok(tv.tv_sec as i64)
    }
}

// ---------------------------------------------------------------------------
// Mock implementation (tests and non-macOS builds)
// ---------------------------------------------------------------------------

/// One fabricated process inside a [`MockSource`].
#[derive(Debug, Clone, Default)]
pub struct MockProcess {
    pub rusage: Rusage,
    pub task: TaskInfo,
    pub bsd: BsdInfo,
    pub name: String,
}

/// In-memory process table implementing [`ProcessDataSource`].
///
/// Tests mutate the table between ticks to simulate counter growth,
/// process churn, and permission failures.
#[derive(Debug, Clone, Default)]
pub struct MockSource {
    processes: HashMap<u32, MockProcess>,
    /// PIDs listed by `list_all_pids` but absent from the info calls,
    /// simulating a process that died mid-tick or denied access.
    pub denied: Vec<u32>,
    pub boot_time: i64,
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            processes: HashMap::new(),
            denied: Vec::new(),
            boot_time: 1_700_000_000,
        }
    }

    pub fn insert(&mut self, pid: u32, proc_: MockProcess) {
        self.processes.insert(pid, proc_);
    }

    pub fn remove(&mut self, pid: u32) {
        self.processes.remove(&pid);
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut MockProcess> {
        self.processes.get_mut(&pid)
    }
}

impl ProcessDataSource for MockSource {
    fn list_all_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .processes
            .keys()
            .chain(self.denied.iter())
            .copied()
            .filter(|&pid| pid != 0)
            .collect();
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    fn rusage(&self, pid: u32) -> Option<Rusage> {
        self.processes.get(&pid).map(|p| p.rusage)
    }

    fn task_info(&self, pid: u32) -> Option<TaskInfo> {
        self.processes.get(&pid).map(|p| p.task)
    }

    fn bsd_info(&self, pid: u32) -> Option<BsdInfo> {
        self.processes.get(&pid).map(|p| p.bsd.clone())
    }

    fn process_name(&self, pid: u32) -> String {
        self.processes
            .get(&pid)
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }

    fn timebase(&self) -> Timebase {
        Timebase::IDENTITY
    }

    fn boot_time(&self) -> Result<i64> {
        Ok(self.boot_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timebase_identity_is_passthrough() {
        assert_eq!(Timebase::IDENTITY.abs_to_ns(12_345), 12_345);
    }

    #[test]
    fn timebase_apple_silicon_ratio() {
        let tb = Timebase {
            numer: 125,
            denom: 3,
        };
        // 3 ticks = 125 ns
        assert_eq!(tb.abs_to_ns(3), 125);
        assert_eq!(tb.abs_to_ns(6), 250);
        // Integer division truncates
        assert_eq!(tb.abs_to_ns(1), 41);
    }

    #[test]
    fn timebase_large_values_do_not_overflow() {
        let tb = Timebase {
            numer: 125,
            denom: 3,
        };
        // A week of CPU time in ticks
        let ticks = 7 * 24 * 3600 * 1_000_000_000u64 * 3 / 125;
        let ns = tb.abs_to_ns(ticks);
        assert!(ns > 0);
    }

    #[test]
    fn mock_lists_denied_pids_but_returns_no_info() {
        let mut source = MockSource::new();
        source.insert(10, MockProcess::default());
        source.denied.push(20);

        assert_eq!(source.list_all_pids(), vec![10, 20]);
        assert!(source.rusage(10).is_some());
        assert!(source.rusage(20).is_none());
        assert!(source.task_info(20).is_none());
        assert!(source.bsd_info(20).is_none());
    }

    #[test]
    fn mock_never_lists_pid_zero() {
        let mut source = MockSource::new();
        source.insert(0, MockProcess::default());
        assert!(source.list_all_pids().is_empty());
    }
}
