//! PCIe throughput, replays and link state.

use super::{active, flush_all, Collector};
use crate::buffer::MetricBuffer;
use crate::cache::{StaticFamily, StaticFragment};
use crate::capability::Family;
use crate::device::Device;
use crate::exposition::{desc, write_gpu_sample, Section};
use crate::query::{DeviceHandle, GpuBackend, PcieDirection, PcieLinkAttr};

fn link(gpu: &dyn GpuBackend, h: DeviceHandle, index: u32, uuid: &str) -> StaticFragment {
    let mut frag = StaticFragment::default();
    for attr in PcieLinkAttr::ALL {
        if let Ok(v) = gpu.pcie_link(h, attr) {
            write_gpu_sample(
                &mut frag.text,
                desc::PCIE_LINK.name,
                index,
                uuid,
                &[("value", &attr.label())],
                v,
            );
            frag.supported += 1;
        }
    }
    frag
}

/// Emits `nvmex_pcie_util_Bps`, `nvmex_pcie_replay_total` and
/// `nvmex_pcie_link`.
#[derive(Debug, Default)]
pub struct PcieCollector;

impl Collector for PcieCollector {
    fn id(&self) -> &'static str {
        "pcie"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut util = Section::new(desc::PCIE_UTIL);
        let mut replay = Section::new(desc::PCIE_REPLAY);
        let mut links = Section::new(desc::PCIE_LINK);

        for (h, dev) in active(devices) {
            for (family, direction, dir) in [
                (Family::PcieTx, PcieDirection::Tx, "tx"),
                (Family::PcieRx, PcieDirection::Rx, "rx"),
            ] {
                // KB/s
                if let Some(kbps) = dev.query(family, |h| gpu.pcie_throughput(h, direction)) {
                    util.gpu_sample(dev.index, &dev.uuid, &[("value", &dir)], u64::from(kbps) * 1000);
                }
            }
            if let Some(n) = dev.query(Family::PcieReplay, |h| gpu.pcie_replay_counter(h)) {
                replay.gpu_sample(dev.index, &dev.uuid, &[], n);
            }

            let (index, uuid) = (dev.index, dev.uuid.as_str());
            let frag = dev.statics.get_or_init(StaticFamily::PcieLink, || link(gpu, h, index, uuid));
            links.append_raw(&frag.text);
        }
        flush_all([util, replay, links], out, compact)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{lines_with, run, table};
    use super::*;
    use crate::query::{QueryError, StubBackend};

    #[test]
    fn test_throughput_in_bytes() {
        let backend = StubBackend::with_full_devices(1);
        let mut devices = table(&backend);

        let (_, text) = run(&mut PcieCollector, &backend, &mut devices, true);
        assert!(lines_with(&text, &["value=\"tx\""])[0].ends_with("} 1000000"));
        assert!(lines_with(&text, &["value=\"rx\""])[0].ends_with("} 2000000"));
        assert!(lines_with(&text, &["nvmex_pcie_replay_total{"])[0].ends_with("} 0"));
    }

    #[test]
    fn test_link_labels() {
        let backend = StubBackend::with_full_devices(1);
        let mut devices = table(&backend);

        let (_, text) = run(&mut PcieCollector, &backend, &mut devices, true);
        let link: Vec<_> = lines_with(&text, &["nvmex_pcie_link{"]);
        assert_eq!(link.len(), 4);
        assert!(link[0].contains("value=\"Gen\"") && link[0].ends_with("} 3"));
        assert!(link[3].contains("value=\"maxWidth\"") && link[3].ends_with("} 16"));
    }

    #[test]
    fn test_link_header_only_with_data() {
        let mut backend = StubBackend::with_full_devices(2);
        for i in 0..2 {
            backend.device_mut(i).pcie_link = std::array::from_fn(|_| Err(QueryError::NotSupported));
        }
        let mut devices = table(&backend);

        let (_, text) = run(&mut PcieCollector, &backend, &mut devices, false);
        assert!(!text.contains("nvmex_pcie_link"));

        backend.device_mut(1).pcie_link[0] = Ok(4);
        let mut devices = table(&backend);
        let (_, text) = run(&mut PcieCollector, &backend, &mut devices, false);
        assert_eq!(lines_with(&text, &["# TYPE nvmex_pcie_link gauge"]).len(), 1);
        assert_eq!(lines_with(&text, &["nvmex_pcie_link{"]).len(), 1);
    }

    #[test]
    fn test_link_queried_once() {
        let backend = StubBackend::with_full_devices(1);
        let mut devices = table(&backend);
        let mut collector = PcieCollector;

        for _ in 0..3 {
            run(&mut collector, &backend, &mut devices, false);
        }
        assert_eq!(backend.calls(0, "pcie_link"), 4);
        assert_eq!(backend.calls(0, "pcie_throughput"), 6);
    }
}
