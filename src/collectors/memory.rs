//! Device memory.

use super::{active, Collector};
use crate::buffer::MetricBuffer;
use crate::capability::Family;
use crate::device::Device;
use crate::exposition::{desc, Section};
use crate::query::GpuBackend;

/// Emits `nvmex_memory_bytes{value=total|free|used}`.
#[derive(Debug, Default)]
pub struct MemoryCollector;

impl Collector for MemoryCollector {
    fn id(&self) -> &'static str {
        "memory"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut memory = Section::new(desc::MEMORY);
        for (_, dev) in active(devices) {
            if let Some(mem) = dev.query(Family::Memory, |h| gpu.memory(h)) {
                for (value, bytes) in [("total", mem.total), ("free", mem.free), ("used", mem.used)] {
                    memory.gpu_sample(dev.index, &dev.uuid, &[("value", &value)], bytes);
                }
            }
        }
        memory.flush(out, compact)
    }
}
