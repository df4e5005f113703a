//! Host introspection: clocks, CPU topology, memory geometry, stack traces.
//!
//! Everything here is informational and best-effort; none of it sits on the
//! submit/yield hot path. `framework_main` snapshots these values once at
//! startup into [`FrameworkHost`](crate::FrameworkHost).

use std::backtrace::Backtrace;
use std::fmt::Write as _;

/// Returns the counter of the real-time clock, in units of
/// [`rtc_frequency`] per second.
#[inline]
pub fn rtc_counter() -> u64 {
    #[cfg(unix)]
    {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        // SAFETY: `ts` is a valid out-pointer; CLOCK_MONOTONIC is always
        // supported on the targeted platforms.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
    #[cfg(not(unix))]
    {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64)
    }
}

/// Returns the frequency of the real-time clock in ticks per second.
#[inline]
pub fn rtc_frequency() -> u64 {
    1_000_000_000
}

/// CPU topology: logical threads, physical cores, packages.
#[derive(Debug, Clone, Copy)]
pub struct CpuInfo {
    pub thread_count: i32,
    pub core_count: i32,
    pub package_count: i32,
}

/// Queries system info about the CPU.
pub fn cpuinfo() -> CpuInfo {
    CpuInfo {
        thread_count: num_cpus::get() as i32,
        core_count: num_cpus::get_physical() as i32,
        package_count: package_count(),
    }
}

#[cfg(target_os = "linux")]
fn package_count() -> i32 {
    // Highest "physical id" in /proc/cpuinfo plus one; single package when
    // the field is absent (some ARM kernels).
    std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|text| {
            text.lines()
                .filter(|line| line.starts_with("physical id"))
                .filter_map(|line| line.rsplit(':').next()?.trim().parse::<i32>().ok())
                .max()
        })
        .map_or(1, |max_id| max_id + 1)
}

#[cfg(not(target_os = "linux"))]
fn package_count() -> i32 {
    1
}

/// Returns the VM page size in bytes.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf with a valid name has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
        4096
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// Bitmask of hugetlb entry sizes available on the host. Each supported size
/// contributes its byte value as a bit; sizes are powers of two, so the bits
/// never collide.
pub type HugepageSizes = u32;

pub const HUGEPAGE_SIZE_NONE: HugepageSizes = 0;
pub const HUGEPAGE_SIZE_64K: HugepageSizes = 64 << 10;
pub const HUGEPAGE_SIZE_2M: HugepageSizes = 1 << 21;
pub const HUGEPAGE_SIZE_1G: HugepageSizes = 1 << 30;

/// Translates a byte count to its `HugepageSizes` bit.
///
/// Returns [`HUGEPAGE_SIZE_NONE`] for non-power-of-two or sub-page values.
#[inline]
pub fn hugepage_size_from_bytes(bytes: usize) -> HugepageSizes {
    if !bytes.is_power_of_two() || bytes < 4096 || bytes > u32::MAX as usize {
        return HUGEPAGE_SIZE_NONE;
    }
    bytes as HugepageSizes
}

/// Queries available hugepage entry sizes and the total RAM of the host.
pub fn hugetlbinfo(out_total_ram: &mut usize) -> HugepageSizes {
    *out_total_ram = total_ram();

    #[cfg(target_os = "linux")]
    {
        let mut sizes = HUGEPAGE_SIZE_NONE;
        if let Ok(entries) = std::fs::read_dir("/sys/kernel/mm/hugepages") {
            for entry in entries.flatten() {
                // Directory names look like "hugepages-2048kB".
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(kb) = name
                    .strip_prefix("hugepages-")
                    .and_then(|rest| rest.strip_suffix("kB"))
                    .and_then(|kb| kb.parse::<usize>().ok())
                {
                    sizes |= hugepage_size_from_bytes(kb * 1024);
                }
            }
        }
        sizes
    }
    #[cfg(not(target_os = "linux"))]
    {
        HUGEPAGE_SIZE_NONE
    }
}

fn total_ram() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf with valid names has no preconditions.
        let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if pages > 0 && page > 0 {
            return pages as usize * page as usize;
        }
        0
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Dumps the current stack trace into `out`.
///
/// Returns the number of bytes written. Frame quality depends on the build's
/// debug info; release builds may produce bare addresses.
pub fn dump_stack_trace(out: &mut String) -> usize {
    let before = out.len();
    let trace = Backtrace::force_capture();
    let _ = write!(out, "{trace}");
    out.len() - before
}
