//! The exporter's own process metrics.
//!
//! On Linux these come from `/proc/self/stat`, `/proc/self/fd` and
//! `/proc/self/limits`. Elsewhere only the start time is reported.

use super::Collector;
use crate::buffer::MetricBuffer;
use crate::device::Device;
use crate::exposition::{desc, Label, Section};
use crate::query::GpuBackend;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// `USER_HZ`, the unit of the times in `/proc/<pid>/stat`.
const CLOCK_TICKS: f64 = 100.0;
const PAGE_SIZE: u64 = 4096;

/// Resource usage of the exporter process.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProcessStats {
    /// User plus system CPU time in seconds.
    pub cpu_seconds: f64,
    /// Virtual memory size in bytes.
    pub virtual_bytes: u64,
    /// Resident set size in bytes.
    pub resident_bytes: u64,
    /// Open file descriptors.
    pub open_fds: Option<u64>,
    /// Soft limit on open file descriptors.
    pub max_fds: Option<u64>,
}

impl ProcessStats {
    /// Parses the content of `/proc/<pid>/stat`.
    ///
    /// The command name may contain spaces and parentheses, so fields are
    /// counted from the last `)`.
    #[must_use]
    pub fn parse_stat(stat: &str) -> Option<Self> {
        let after_name = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = after_name.split_whitespace().collect();
        let field = |i: usize| fields.get(i).and_then(|s| s.parse::<u64>().ok());

        let utime = field(11)?;
        let stime = field(12)?;
        Some(Self {
            cpu_seconds: (utime + stime) as f64 / CLOCK_TICKS,
            virtual_bytes: field(20)?,
            resident_bytes: field(21)? * PAGE_SIZE,
            open_fds: None,
            max_fds: None,
        })
    }

    /// Soft `Max open files` limit from `/proc/<pid>/limits`.
    #[must_use]
    pub fn parse_max_fds(limits: &str) -> Option<u64> {
        limits
            .lines()
            .find(|l| l.starts_with("Max open files"))
            .and_then(|l| l.split_whitespace().nth(3))
            .and_then(|s| s.parse().ok())
    }

    /// Reads the current process.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn read() -> Option<Self> {
        let stat = match std::fs::read_to_string("/proc/self/stat") {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "cannot read /proc/self/stat");
                return None;
            }
        };
        let mut stats = Self::parse_stat(&stat)?;
        stats.open_fds = std::fs::read_dir("/proc/self/fd").ok().map(|d| d.count() as u64);
        stats.max_fds = std::fs::read_to_string("/proc/self/limits")
            .ok()
            .and_then(|l| Self::parse_max_fds(&l));
        Some(stats)
    }

    /// Reads the current process.
    #[cfg(not(target_os = "linux"))]
    #[must_use]
    pub fn read() -> Option<Self> {
        None
    }
}

/// Emits the `nvmex_process_*` families.
#[derive(Debug)]
pub struct ProcessCollector {
    pid: u32,
    started: u64,
}

impl Default for ProcessCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessCollector {
    /// Creates the collector, taking now as the process start.
    #[must_use]
    pub fn new() -> Self {
        let started = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        Self { pid: std::process::id(), started }
    }

    fn sections(&self, stats: Option<ProcessStats>) -> [Section; 6] {
        let pid: [Label<'_>; 1] = [("pid", &self.pid)];
        let mut cpu = Section::new(desc::PROCESS_CPU);
        let mut virt = Section::new(desc::PROCESS_VIRTUAL_MEMORY);
        let mut rss = Section::new(desc::PROCESS_RESIDENT_MEMORY);
        let mut open = Section::new(desc::PROCESS_OPEN_FDS);
        let mut max = Section::new(desc::PROCESS_MAX_FDS);
        if let Some(stats) = stats {
            cpu.sample(&pid, stats.cpu_seconds);
            virt.sample(&pid, stats.virtual_bytes);
            rss.sample(&pid, stats.resident_bytes);
            if let Some(n) = stats.open_fds {
                open.sample(&pid, n);
            }
            if let Some(n) = stats.max_fds {
                max.sample(&pid, n);
            }
        }
        let mut start = Section::new(desc::PROCESS_START);
        start.sample(&pid, self.started);
        [cpu, virt, rss, open, max, start]
    }
}

impl Collector for ProcessCollector {
    fn id(&self) -> &'static str {
        "process"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        _gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        if devices.is_empty() {
            return false;
        }
        super::flush_all(self.sections(ProcessStats::read()), out, compact)
    }
}
