//! Metric collectors.
//!
//! One [`Collector`] per metric family group. Each walks the device list,
//! skips disabled devices and families known to be unsupported, and appends
//! its sections to the scrape buffer. A failing query never stops the walk.
//!
//! ```text
//! collectors/
//! ├── mod.rs          # Collector trait, registry
//! ├── scratch.rs      # grow-only session list
//! ├── version.rs      # software versions
//! ├── process.rs      # exporter cpu, memory, descriptors, start time
//! ├── gpu_info.rs     # name, bus, uuid
//! ├── clocks.rs       # clock envelopes, current clocks, throttling
//! ├── bar1.rs         # BAR1 memory
//! ├── temperature.rs  # temperatures and thresholds
//! ├── power.rs        # energy, p-state, draw and limits
//! ├── fan.rs          # fan speed
//! ├── utilization.rs  # gpu, memory, encoder, decoder
//! ├── pcie.rs         # throughput, replays, link
//! ├── violations.rs   # policy violation time
//! ├── memory.rs       # device memory
//! ├── ecc.rs          # ECC mode, errors, retired pages, remapped rows
//! ├── nvlink.rs       # NVLink links, bandwidth, traffic, errors
//! ├── encoder.rs      # encoder stats and sessions
//! └── fbc.rs          # frame capture stats and sessions
//! ```

mod bar1;
mod clocks;
mod ecc;
mod encoder;
mod fan;
mod fbc;
mod gpu_info;
mod memory;
mod nvlink;
mod pcie;
mod power;
mod process;
pub mod scratch;
mod temperature;
mod utilization;
mod version;
mod violations;

pub use bar1::Bar1Collector;
pub use clocks::ClockCollector;
pub use ecc::EccCollector;
pub use encoder::EncoderCollector;
pub use fan::FanCollector;
pub use fbc::FbcCollector;
pub use gpu_info::GpuInfoCollector;
pub use memory::MemoryCollector;
pub use nvlink::NvLinkCollector;
pub use pcie::PcieCollector;
pub use power::PowerCollector;
pub use process::{ProcessCollector, ProcessStats};
pub use temperature::TemperatureCollector;
pub use utilization::UtilizationCollector;
pub use version::VersionCollector;
pub use violations::ViolationCollector;

use crate::buffer::MetricBuffer;
use crate::capability::Family;
use crate::config::{MetricSelection, MetricToggle};
use crate::device::Device;
use crate::exposition::Section;
use crate::query::{DeviceHandle, FieldId, GpuBackend, QueryError};

/// Trait for metric collectors.
///
/// Collectors hold only their own scratch state; everything learned about a
/// device lives in its [`Device`] record.
pub trait Collector: Send {
    /// Identifier used in scrape-time metrics and logs.
    fn id(&self) -> &'static str;

    /// Appends this collector's sections to `out`.
    ///
    /// With `compact` set no `# HELP` / `# TYPE` lines are written. Returns
    /// whether anything was appended; with no devices nothing ever is.
    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool;
}

/// Builds the enabled collectors in exposition order.
#[must_use]
pub fn registry(selection: &MetricSelection) -> Vec<Box<dyn Collector>> {
    let on = |t| selection.is_enabled(t);
    let mut list: Vec<Box<dyn Collector>> = Vec::with_capacity(16);

    if on(MetricToggle::Version) {
        list.push(Box::new(VersionCollector::new()));
    }
    if on(MetricToggle::Process) {
        list.push(Box::new(ProcessCollector::new()));
    }
    if on(MetricToggle::GpuInfo) {
        list.push(Box::new(GpuInfoCollector));
    }
    if on(MetricToggle::Clock) {
        list.push(Box::new(ClockCollector));
    }
    if on(MetricToggle::Bar1Mem) {
        list.push(Box::new(Bar1Collector));
    }
    if on(MetricToggle::Temperature) {
        list.push(Box::new(TemperatureCollector));
    }
    if on(MetricToggle::Power) {
        list.push(Box::new(PowerCollector));
    }
    if on(MetricToggle::Fan) {
        list.push(Box::new(FanCollector));
    }
    if on(MetricToggle::Utilization) {
        list.push(Box::new(UtilizationCollector));
    }
    if on(MetricToggle::Pcie) {
        list.push(Box::new(PcieCollector));
    }
    if on(MetricToggle::Violation) {
        list.push(Box::new(ViolationCollector));
    }
    if on(MetricToggle::Memory) {
        list.push(Box::new(MemoryCollector));
    }
    if on(MetricToggle::Ecc) {
        list.push(Box::new(EccCollector));
    }
    if on(MetricToggle::NvLink) {
        list.push(Box::new(NvLinkCollector));
    }
    let (stats, sessions) = (on(MetricToggle::EncStat), on(MetricToggle::EncSession));
    if stats || sessions {
        list.push(Box::new(EncoderCollector::new(stats, sessions)));
    }
    let (stats, sessions) = (on(MetricToggle::FbcStat), on(MetricToggle::FbcSession));
    if stats || sessions {
        list.push(Box::new(FbcCollector::new(stats, sessions)));
    }
    list
}

/// Devices that can be queried, with their handle.
fn active(devices: &mut [Device]) -> impl Iterator<Item = (DeviceHandle, &mut Device)> {
    devices.iter_mut().filter_map(|d| d.handle.map(|h| (h, d)))
}

/// Queries generic field values as one `family`.
///
/// The family counts as answered if at least one field has a value;
/// otherwise the first field error decides. Individual missing fields come
/// back as `None`.
fn query_fields(
    dev: &mut Device,
    family: Family,
    gpu: &dyn GpuBackend,
    ids: &[FieldId],
) -> Option<Vec<Option<u64>>> {
    let values = dev.query(family, |h| {
        let values = gpu.field_values(h, ids)?;
        if values.iter().any(Result::is_ok) {
            Ok(values)
        } else {
            Err(values.into_iter().find_map(Result::err).unwrap_or(QueryError::NotSupported))
        }
    })?;
    Some(values.into_iter().map(Result::ok).collect())
}

/// Flushes `sections` in order. Returns whether any had content.
fn flush_all(sections: impl IntoIterator<Item = Section>, out: &mut MetricBuffer, compact: bool) -> bool {
    sections.into_iter().fold(false, |any, s| s.flush(out, compact) | any)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers shared by the collector tests.

    use super::Collector;
    use crate::buffer::MetricBuffer;
    use crate::device::{Device, DeviceTable};
    use crate::query::StubBackend;

    /// Enumerated table of `backend`.
    pub(crate) fn table(backend: &StubBackend) -> Vec<Device> {
        DeviceTable::enumerate(backend).unwrap().into_devices()
    }

    /// Runs `collector` once and returns the output.
    pub(crate) fn run(
        collector: &mut dyn Collector,
        backend: &StubBackend,
        devices: &mut [Device],
        compact: bool,
    ) -> (bool, String) {
        let mut out = MetricBuffer::new();
        let any = collector.collect(&mut out, compact, backend, devices);
        (any, out.into_string())
    }

    /// Lines of `text` that contain every needle.
    pub(crate) fn lines_with<'a>(text: &'a str, needles: &[&str]) -> Vec<&'a str> {
        text.lines().filter(|l| needles.iter().all(|n| l.contains(n))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order() {
        let ids: Vec<_> = registry(&MetricSelection::all()).iter().map(|c| c.id()).collect();
        assert_eq!(
            ids,
            vec![
                "version",
                "process",
                "gpuinfo",
                "clock",
                "bar1mem",
                "temperature",
                "power",
                "fan",
                "utilization",
                "pcie",
                "violation",
                "memory",
                "ecc",
                "nvlink",
                "encoder",
                "fbc",
            ]
        );
    }

    #[test]
    fn test_registry_skips_disabled() {
        let mut selection = MetricSelection::all();
        selection.disable_list("fan,ecc,encstat,encsession,fbcstat").unwrap();

        let ids: Vec<_> = registry(&selection).iter().map(|c| c.id()).collect();
        assert!(!ids.contains(&"fan"));
        assert!(!ids.contains(&"ecc"));
        assert!(!ids.contains(&"encoder"), "both encoder toggles are off");
        assert!(ids.contains(&"fbc"), "fbc sessions still enabled");
    }

    #[test]
    fn test_every_collector_is_noop_without_devices() {
        let backend = crate::query::StubBackend::with_full_devices(1);
        for mut c in registry(&MetricSelection::all()) {
            let mut out = MetricBuffer::new();
            assert!(!c.collect(&mut out, false, &backend, &mut []), "{} emitted output", c.id());
            assert!(out.is_empty(), "{} wrote to the buffer", c.id());
        }
    }
}
