//! Text exposition format.
//!
//! One sample per line:
//!
//! ```text
//! # HELP nvmex_fan_speed_pct Fan speed settings in percent.
//! # TYPE nvmex_fan_speed_pct gauge
//! nvmex_fan_speed_pct{gpu="0",value="intended",uuid="..."} 41
//! ```
//!
//! Families are assembled in a [`Section`] and flushed to the scrape buffer
//! in one piece, so a buffer never holds a partially formatted family.

use crate::buffer::MetricBuffer;
use std::fmt::{self, Write};

/// Metric type announced in the `# TYPE` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Value that can go up and down.
    Gauge,
    /// Monotonically increasing value.
    Counter,
}

impl MetricKind {
    /// Keyword used in the exposition.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
        }
    }
}

/// Name, description and type of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDesc {
    /// Metric name including the `nvmex_` prefix.
    pub name: &'static str,
    /// One line description.
    pub help: &'static str,
    /// Metric type.
    pub kind: MetricKind,
}

impl MetricDesc {
    const fn gauge(name: &'static str, help: &'static str) -> Self {
        Self { name, help, kind: MetricKind::Gauge }
    }

    const fn counter(name: &'static str, help: &'static str) -> Self {
        Self { name, help, kind: MetricKind::Counter }
    }

    /// Writes the `# HELP` and `# TYPE` lines.
    pub fn write_header(&self, out: &mut impl Write) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} {}", self.name, self.kind.as_str());
    }
}

// ============================================================================
// Metric families
// ============================================================================

/// Metric family descriptors.
pub mod desc {
    use super::MetricDesc;

    /// Software versions.
    pub const VERSION: MetricDesc =
        MetricDesc::gauge("nvmex_version", "Software version information.");
    /// Exporter process start.
    pub const PROCESS_START: MetricDesc = MetricDesc::gauge(
        "nvmex_process_start_time_seconds",
        "Start time of the exporter process since unix epoch in seconds.",
    );
    /// Exporter CPU time.
    pub const PROCESS_CPU: MetricDesc = MetricDesc::counter(
        "nvmex_process_cpu_seconds_total",
        "Total user and system CPU time spent by the exporter in seconds.",
    );
    /// Exporter virtual memory.
    pub const PROCESS_VIRTUAL_MEMORY: MetricDesc = MetricDesc::gauge(
        "nvmex_process_virtual_memory_bytes",
        "Virtual memory size of the exporter in bytes.",
    );
    /// Exporter resident memory.
    pub const PROCESS_RESIDENT_MEMORY: MetricDesc = MetricDesc::gauge(
        "nvmex_process_resident_memory_bytes",
        "Resident memory size of the exporter in bytes.",
    );
    /// Exporter open descriptors.
    pub const PROCESS_OPEN_FDS: MetricDesc =
        MetricDesc::gauge("nvmex_process_open_fds", "Number of open file descriptors.");
    /// Exporter descriptor limit.
    pub const PROCESS_MAX_FDS: MetricDesc =
        MetricDesc::gauge("nvmex_process_max_fds", "Maximum number of open file descriptors.");
    /// Per-device identity.
    pub const GPU_INFO: MetricDesc = MetricDesc::gauge("nvmex_gpu_info", "Misc. GPU information.");
    /// Clocks.
    pub const CLOCK: MetricDesc = MetricDesc::gauge("nvmex_clock_MHz", "GPU clock speeds in MHz.");
    /// Throttle reasons.
    pub const CLOCK_THROTTLE: MetricDesc = MetricDesc::gauge(
        "nvmex_clock_throttle_bitmask",
        "Current reasons for GPU clock throttling.",
    );
    /// BAR1 memory.
    pub const BAR1MEM: MetricDesc = MetricDesc::gauge("nvmex_bar1mem_B", "BAR1 memory in bytes.");
    /// Temperatures.
    pub const TEMPERATURE: MetricDesc = MetricDesc::gauge(
        "nvmex_temperature_C",
        "Device temperatures and thresholds in degrees celsius.",
    );
    /// Energy.
    pub const POWER_CONSUMPTION: MetricDesc = MetricDesc::counter(
        "nvmex_power_consumption_mJ",
        "Power consumption since last driver [re]load in millijoule.",
    );
    /// Performance state.
    pub const PERF_STATE: MetricDesc =
        MetricDesc::gauge("nvmex_perf_state", "Current performance state (0=max .. 15=min).");
    /// Power draw and limits.
    pub const POWER: MetricDesc =
        MetricDesc::gauge("nvmex_power_mW", "Power usage and limits in milliwatt.");
    /// Fan.
    pub const FAN: MetricDesc =
        MetricDesc::gauge("nvmex_fan_speed_pct", "Fan speed settings in percent.");
    /// Utilisation.
    pub const UTIL: MetricDesc =
        MetricDesc::gauge("nvmex_util_pct", "GPU device utilizations in percent.");
    /// PCIe throughput.
    pub const PCIE_UTIL: MetricDesc = MetricDesc::gauge(
        "nvmex_pcie_util_Bps",
        "PCIe utilization in bytes/s measured for 20 ms.",
    );
    /// PCIe replays.
    pub const PCIE_REPLAY: MetricDesc =
        MetricDesc::counter("nvmex_pcie_replay_total", "PCIe replay count.");
    /// PCIe link.
    pub const PCIE_LINK: MetricDesc =
        MetricDesc::gauge("nvmex_pcie_link", "PCIe link generation and width.");
    /// Policy violations.
    pub const VIOLATION: MetricDesc = MetricDesc::counter(
        "nvmex_violation_penalty_seconds",
        "How long a policy caused the GPU to be below application or base clocks.",
    );
    /// Device memory.
    pub const MEMORY: MetricDesc =
        MetricDesc::gauge("nvmex_memory_bytes", "Device memory in bytes.");
    /// ECC mode.
    pub const ECC_MODE: MetricDesc = MetricDesc::gauge(
        "nvmex_ecc_mode",
        "ECC mode of the device (0 .. disabled, 1 .. enabled).",
    );
    /// ECC error counters.
    pub const ECC_ERRORS: MetricDesc = MetricDesc::counter(
        "nvmex_ecc_errors",
        "ECC single and double bit errors (SBE and DBE) by volatile (since last driver load) \
         or persistent counter and location (L1/L2 cache, DEV memory, REG file, TEX memory, \
         CBU convergence barrier unit, ALL locations).",
    );
    /// Retired pages.
    pub const ECC_RETIRED_PAGES: MetricDesc = MetricDesc::counter(
        "nvmex_ecc_retired_pages",
        "Number of memory pages retired because of multiple single bit errors (sbe) or double \
         bit errors (dbe), and whether pages are pending retirement (pending).",
    );
    /// Remapped rows.
    pub const ECC_REMAPPED_ROWS: MetricDesc = MetricDesc::counter(
        "nvmex_ecc_remapped_rows",
        "Number of remapped rows ('pending','failure': 0 .. no, 1 .. yes).",
    );
    /// NVLink count.
    pub const NVLINK_LINKS: MetricDesc =
        MetricDesc::gauge("nvmex_nvlink_links", "Number of NVLinks present on the device.");
    /// NVLink bandwidth.
    pub const NVLINK_BANDWIDTH: MetricDesc = MetricDesc::gauge(
        "nvmex_nvlink_bandwidth_MBps",
        "Common NVLink bandwidth in MB/s for active links.",
    );
    /// NVLink traffic.
    pub const NVLINK_TRAFFIC: MetricDesc =
        MetricDesc::counter("nvmex_nvlink_traffic_bytes", "NVLink traffic counter in bytes.");
    /// NVLink errors.
    pub const NVLINK_ERRORS: MetricDesc =
        MetricDesc::counter("nvmex_nvlink_errors", "NVLink related errors and retries.");
    /// Encoder sessions.
    pub const ENC_STAT_SESSIONS: MetricDesc =
        MetricDesc::gauge("nvmex_enc_stat_sessions", "Number of active encoder sessions.");
    /// Encoder fps.
    pub const ENC_STAT_FPS: MetricDesc = MetricDesc::gauge(
        "nvmex_enc_stat_fps",
        "Trailing average encode frames per second of all active sessions.",
    );
    /// Encoder latency.
    pub const ENC_STAT_LATENCY: MetricDesc = MetricDesc::gauge(
        "nvmex_enc_stat_latency_us",
        "Average encode latency in microseconds.",
    );
    /// Per-session encoder fps.
    pub const ENC_SESSION_FPS: MetricDesc =
        MetricDesc::gauge("nvmex_enc_session_fps", "Moving average encode frames per second.");
    /// Per-session encoder latency.
    pub const ENC_SESSION_LATENCY: MetricDesc = MetricDesc::gauge(
        "nvmex_enc_session_latency_us",
        "Moving average encode latency in microseconds.",
    );
    /// Frame capture sessions.
    pub const FBC_STAT_SESSIONS: MetricDesc =
        MetricDesc::gauge("nvmex_fbc_stat_sessions", "Total number of frame capture sessions.");
    /// Frame capture fps.
    pub const FBC_STAT_FPS: MetricDesc = MetricDesc::gauge(
        "nvmex_fbc_stat_fps",
        "Moving average new frames captured per second.",
    );
    /// Frame capture latency.
    pub const FBC_STAT_LATENCY: MetricDesc = MetricDesc::gauge(
        "nvmex_fbc_stat_latency_us",
        "Moving average new frame capture latency in microseconds.",
    );
    /// Per-session frame capture fps.
    pub const FBC_SESSION_FPS: MetricDesc = MetricDesc::gauge(
        "nvmex_fbc_session_fps",
        "Moving average new frames captured per second.",
    );
    /// Per-session frame capture latency.
    pub const FBC_SESSION_LATENCY: MetricDesc = MetricDesc::gauge(
        "nvmex_fbc_session_latency_us",
        "Moving average new frame capture latency in microseconds.",
    );
    /// Collector run time.
    pub const SCRAPE_DURATION: MetricDesc = MetricDesc::gauge(
        "nvmex_scrape_duration_seconds",
        "Time spent in each collector during the last scrape.",
    );
    /// HTTP requests.
    pub const REQUEST_TOTAL: MetricDesc =
        MetricDesc::counter("nvmex_request_total", "Number of HTTP requests by URL.");
    /// HTTP responses.
    pub const RESPONSE_TOTAL: MetricDesc = MetricDesc::counter(
        "nvmex_response_total",
        "Number of metric responses sent and their total size in bytes.",
    );
}

// ============================================================================
// Sample formatting
// ============================================================================

/// A label name with its (unescaped) value.
pub type Label<'a> = (&'static str, &'a dyn fmt::Display);

/// Writer adapter escaping `\`, `"` and newlines of label values.
struct Escaped<'w, W: Write>(&'w mut W);

impl<W: Write> Write for Escaped<'_, W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut rest = s;
        while let Some(pos) = rest.find(['\\', '"', '\n']) {
            self.0.write_str(&rest[..pos])?;
            match rest.as_bytes()[pos] {
                b'\\' => self.0.write_str("\\\\")?,
                b'"' => self.0.write_str("\\\"")?,
                _ => self.0.write_str("\\n")?,
            }
            rest = &rest[pos + 1..];
        }
        self.0.write_str(rest)
    }
}

fn write_label(out: &mut impl Write, first: &mut bool, name: &str, value: &dyn fmt::Display) {
    if !*first {
        let _ = out.write_char(',');
    }
    *first = false;
    let _ = write!(out, "{name}=\"");
    let _ = write!(Escaped(&mut *out), "{value}");
    let _ = out.write_char('"');
}

/// Writes one sample line.
pub fn write_sample(
    out: &mut impl Write,
    name: &str,
    labels: &[Label<'_>],
    value: impl fmt::Display,
) {
    let _ = out.write_str(name);
    if !labels.is_empty() {
        let _ = out.write_char('{');
        let mut first = true;
        for (label, v) in labels {
            write_label(out, &mut first, label, *v);
        }
        let _ = out.write_char('}');
    }
    let _ = writeln!(out, " {value}");
}

/// Writes one per-device sample: `gpu` first, then `extra`, then `uuid`.
pub fn write_gpu_sample(
    out: &mut impl Write,
    name: &str,
    gpu: u32,
    uuid: &str,
    extra: &[Label<'_>],
    value: impl fmt::Display,
) {
    let _ = out.write_str(name);
    let _ = write!(out, "{{gpu=\"{gpu}\"");
    let mut first = false;
    for (label, v) in extra {
        write_label(out, &mut first, label, *v);
    }
    write_label(out, &mut first, "uuid", &uuid);
    let _ = writeln!(out, "}} {value}");
}

// ============================================================================
// Sections
// ============================================================================

/// The samples of one metric family, flushed as a unit.
#[derive(Debug)]
pub struct Section {
    desc: MetricDesc,
    body: String,
}

impl Section {
    /// Starts an empty section.
    #[must_use]
    pub fn new(desc: MetricDesc) -> Self {
        Self { desc, body: String::new() }
    }

    /// The family name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.desc.name
    }

    /// Adds a sample without device labels.
    pub fn sample(&mut self, labels: &[Label<'_>], value: impl fmt::Display) {
        write_sample(&mut self.body, self.desc.name, labels, value);
    }

    /// Adds a per-device sample.
    pub fn gpu_sample(
        &mut self,
        gpu: u32,
        uuid: &str,
        extra: &[Label<'_>],
        value: impl fmt::Display,
    ) {
        write_gpu_sample(&mut self.body, self.desc.name, gpu, uuid, extra, value);
    }

    /// Adds pre-formatted sample lines, e.g. a cached fragment.
    pub fn append_raw(&mut self, lines: &str) {
        self.body.push_str(lines);
    }

    /// Adds a `#` comment line (kept in compact mode).
    pub fn comment(&mut self, text: fmt::Arguments<'_>) {
        let _ = writeln!(self.body, "#  {text}");
    }

    /// Whether no line has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Appends header (unless `compact`) and body to `out`.
    ///
    /// An empty section appends nothing. Returns whether anything was appended.
    pub fn flush(self, out: &mut MetricBuffer, compact: bool) -> bool {
        if self.body.is_empty() {
            return false;
        }
        if !compact {
            self.desc.write_header(out);
        }
        out.append(&self.body);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_without_labels() {
        let mut out = String::new();
        write_sample(&mut out, "nvmex_x", &[], 5);
        assert_eq!(out, "nvmex_x 5\n");
    }

    #[test]
    fn test_sample_with_labels() {
        let mut out = String::new();
        write_sample(&mut out, "nvmex_x", &[("a", &"1"), ("b", &2)], 0.5);
        assert_eq!(out, "nvmex_x{a=\"1\",b=\"2\"} 0.5\n");
    }

    #[test]
    fn test_gpu_sample_label_order() {
        let mut out = String::new();
        write_gpu_sample(&mut out, "nvmex_fan_speed_pct", 1, "abc", &[("value", &"intended")], 41);
        assert_eq!(out, "nvmex_fan_speed_pct{gpu=\"1\",value=\"intended\",uuid=\"abc\"} 41\n");
    }

    #[test]
    fn test_gpu_sample_without_extra_labels() {
        let mut out = String::new();
        write_gpu_sample(&mut out, "nvmex_perf_state", 0, "u", &[], 2);
        assert_eq!(out, "nvmex_perf_state{gpu=\"0\",uuid=\"u\"} 2\n");
    }

    #[test]
    fn test_label_values_escaped() {
        let mut out = String::new();
        write_sample(&mut out, "m", &[("name", &"Tesla \"V\"\\100\nX")], 1);
        assert_eq!(out, "m{name=\"Tesla \\\"V\\\"\\\\100\\nX\"} 1\n");
    }

    #[test]
    fn test_section_flush_with_header() {
        let mut section = Section::new(desc::FAN);
        section.gpu_sample(0, "u0", &[("value", &"intended")], 30);

        let mut buf = MetricBuffer::new();
        assert!(section.flush(&mut buf, false));
        let text = buf.render();
        assert!(text.starts_with("# HELP nvmex_fan_speed_pct Fan speed"), "{}", text);
        assert!(text.contains("# TYPE nvmex_fan_speed_pct gauge\n"), "{}", text);
        assert!(text.ends_with("uuid=\"u0\"} 30\n"), "{}", text);
    }

    #[test]
    fn test_section_flush_compact_has_no_comments() {
        let mut section = Section::new(desc::VIOLATION);
        section.gpu_sample(0, "u0", &[("policy", &"POWER")], 1.5);

        let mut buf = MetricBuffer::new();
        section.flush(&mut buf, true);
        assert!(!buf.render().contains('#'));
    }

    #[test]
    fn test_empty_section_appends_nothing() {
        let section = Section::new(desc::MEMORY);
        let mut buf = MetricBuffer::new();
        assert!(!section.flush(&mut buf, false));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_counter_kind_in_header() {
        let mut out = String::new();
        desc::POWER_CONSUMPTION.write_header(&mut out);
        assert!(out.ends_with("# TYPE nvmex_power_consumption_mJ counter\n"));
    }

    #[test]
    fn test_all_names_prefixed() {
        for d in [desc::VERSION, desc::CLOCK, desc::ECC_ERRORS, desc::RESPONSE_TOTAL] {
            assert!(d.name.starts_with("nvmex_"), "{}", d.name);
        }
    }
}
