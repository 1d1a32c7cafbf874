//! Fan speed.

use super::{active, Collector};
use crate::buffer::MetricBuffer;
use crate::capability::Family;
use crate::device::Device;
use crate::exposition::{desc, Section};
use crate::query::GpuBackend;

/// Emits `nvmex_fan_speed_pct{value="intended"}`.
#[derive(Debug, Default)]
pub struct FanCollector;

impl Collector for FanCollector {
    fn id(&self) -> &'static str {
        "fan"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut fan = Section::new(desc::FAN);
        for (_, dev) in active(devices) {
            if let Some(pct) = dev.query(Family::Fan, |h| gpu.fan_speed(h)) {
                fan.gpu_sample(dev.index, &dev.uuid, &[("value", &"intended")], pct);
            }
        }
        fan.flush(out, compact)
    }
}
