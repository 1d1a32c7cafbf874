//! BAR1 memory.

use super::{active, Collector};
use crate::buffer::MetricBuffer;
use crate::capability::Family;
use crate::device::Device;
use crate::exposition::{desc, Section};
use crate::query::GpuBackend;

/// Emits `nvmex_bar1mem_B{sz=free|total|used}`.
#[derive(Debug, Default)]
pub struct Bar1Collector;

impl Collector for Bar1Collector {
    fn id(&self) -> &'static str {
        "bar1mem"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut bar1 = Section::new(desc::BAR1MEM);
        for (_, dev) in active(devices) {
            let Some(mem) = dev.query(Family::Bar1Memory, |h| gpu.bar1_memory(h)) else {
                continue;
            };
            for (sz, bytes) in [("free", mem.free), ("total", mem.total), ("used", mem.used)] {
                bar1.gpu_sample(dev.index, &dev.uuid, &[("sz", &sz)], bytes);
            }
        }
        bar1.flush(out, compact)
    }
}
