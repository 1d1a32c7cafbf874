//! Time spent below target clocks, per performance policy.

use super::{active, Collector};
use crate::buffer::MetricBuffer;
use crate::capability::MaskFamily;
use crate::device::Device;
use crate::exposition::{desc, Section};
use crate::query::{GpuBackend, PerfPolicy};

/// Emits `nvmex_violation_penalty_seconds{policy=...}`.
///
/// The driver counts nanoseconds; the exposition uses fractional seconds.
#[derive(Debug, Default)]
pub struct ViolationCollector;

impl Collector for ViolationCollector {
    fn id(&self) -> &'static str {
        "violation"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut violation = Section::new(desc::VIOLATION);
        for (_, dev) in active(devices) {
            if !dev.caps.violations.should_query() {
                continue;
            }
            for (bit, policy) in PerfPolicy::ALL.into_iter().enumerate() {
                if let Some(ns) = dev.query_bit(MaskFamily::Violations, bit, |h| gpu.violation_time(h, policy)) {
                    let seconds = ns as f64 / 1e9;
                    violation.gpu_sample(dev.index, &dev.uuid, &[("policy", &policy.label())], seconds);
                }
            }
        }
        violation.flush(out, compact)
    }
}
