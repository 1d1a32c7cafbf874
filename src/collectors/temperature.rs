//! Temperatures and fused thresholds.

use super::{active, query_fields, Collector};
use crate::buffer::MetricBuffer;
use crate::cache::{StaticFamily, StaticFragment};
use crate::capability::Family;
use crate::device::Device;
use crate::exposition::{desc, write_gpu_sample, Section};
use crate::query::{fields, DeviceHandle, GpuBackend, TemperatureThreshold};

fn thresholds(gpu: &dyn GpuBackend, h: DeviceHandle, index: u32, uuid: &str) -> StaticFragment {
    let mut frag = StaticFragment::default();
    for threshold in TemperatureThreshold::ALL {
        let Ok(celsius) = gpu.temperature_threshold(h, threshold) else {
            continue;
        };
        let (device, value) = threshold.labels();
        write_gpu_sample(
            &mut frag.text,
            desc::TEMPERATURE.name,
            index,
            uuid,
            &[("device", &device), ("value", &value)],
            celsius,
        );
        frag.supported += 1;
    }
    frag
}

/// Emits `nvmex_temperature_C`.
///
/// Memory temperature is read as a field value; boards without a memory
/// sensor report 0, which is dropped.
#[derive(Debug, Default)]
pub struct TemperatureCollector;

impl Collector for TemperatureCollector {
    fn id(&self) -> &'static str {
        "temperature"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut temperature = Section::new(desc::TEMPERATURE);
        for (h, dev) in active(devices) {
            if let Some(c) = dev.query(Family::Temperature, |h| gpu.temperature(h)) {
                temperature.gpu_sample(dev.index, &dev.uuid, &[("device", &"gpu"), ("value", &"now")], c);
            }

            let mem = query_fields(dev, Family::MemoryTemperature, gpu, &[fields::MEMORY_TEMP]);
            if let Some(c) = mem.and_then(|v| v.first().copied().flatten()).filter(|c| *c != 0) {
                temperature.gpu_sample(dev.index, &dev.uuid, &[("device", &"mem"), ("value", &"now")], c);
            }

            let (index, uuid) = (dev.index, dev.uuid.as_str());
            let frag = dev.statics.get_or_init(StaticFamily::TemperatureThresholds, || {
                thresholds(gpu, h, index, uuid)
            });
            temperature.append_raw(&frag.text);
        }
        temperature.flush(out, compact)
    }
}
