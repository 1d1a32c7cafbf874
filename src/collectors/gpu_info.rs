//! Per-device identity line.

use super::{active, Collector};
use crate::buffer::MetricBuffer;
use crate::cache::{StaticFamily, StaticFragment};
use crate::device::Device;
use crate::exposition::{desc, write_gpu_sample, Section};
use crate::query::GpuBackend;
use tracing::debug;

/// Emits `nvmex_gpu_info{gpu,name,bus,uuid} 1`.
#[derive(Debug, Default)]
pub struct GpuInfoCollector;

impl Collector for GpuInfoCollector {
    fn id(&self) -> &'static str {
        "gpuinfo"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut info = Section::new(desc::GPU_INFO);
        for (h, dev) in active(devices) {
            let (index, uuid, bus) = (dev.index, dev.uuid.as_str(), dev.bus_id.as_str());
            let frag = dev.statics.get_or_init(StaticFamily::DeviceInfo, || {
                let name = gpu.name(h).unwrap_or_else(|e| {
                    debug!(gpu = index, error = %e, "device name unavailable");
                    String::new()
                });
                let mut text = String::new();
                write_gpu_sample(
                    &mut text,
                    desc::GPU_INFO.name,
                    index,
                    uuid,
                    &[("name", &name), ("bus", &bus)],
                    1,
                );
                StaticFragment { text, supported: 1 }
            });
            info.append_raw(&frag.text);
        }
        info.flush(out, compact)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{run, table};
    use super::*;
    use crate::query::{QueryError, StubBackend};

    #[test]
    fn test_info_line() {
        let backend = StubBackend::with_full_devices(2);
        let mut devices = table(&backend);
        let (any, text) = run(&mut GpuInfoCollector, &backend, &mut devices, true);

        assert!(any);
        assert_eq!(
            text.lines().next().unwrap(),
            "nvmex_gpu_info{gpu=\"0\",name=\"Tesla V100-SXM2-16GB\",bus=\"00000000:18:00.0\",\
             uuid=\"8e3c1f0a-5b2d-4c6e-9f17-000000000000\"} 1"
        );
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_name_queried_once() {
        let backend = StubBackend::with_full_devices(1);
        let mut devices = table(&backend);
        let mut collector = GpuInfoCollector;

        for _ in 0..4 {
            run(&mut collector, &backend, &mut devices, false);
        }
        assert_eq!(backend.calls(0, "name"), 1);
    }

    #[test]
    fn test_missing_name_keeps_line() {
        let mut backend = StubBackend::with_full_devices(1);
        backend.device_mut(0).name = Err(QueryError::NotSupported);
        let mut devices = table(&backend);

        let (_, text) = run(&mut GpuInfoCollector, &backend, &mut devices, true);
        assert!(text.contains("name=\"\""), "{}", text);
    }

    #[test]
    fn test_placeholder_skipped() {
        let mut backend = StubBackend::with_full_devices(1);
        backend.devices.push(None);
        let mut devices = table(&backend);

        let (_, text) = run(&mut GpuInfoCollector, &backend, &mut devices, true);
        assert_eq!(text.lines().count(), 1);
    }
}
