//! Energy, performance state, power draw and limits.

use super::{active, flush_all, Collector};
use crate::buffer::MetricBuffer;
use crate::cache::{StaticFamily, StaticFragment};
use crate::capability::Family;
use crate::device::Device;
use crate::exposition::{desc, write_gpu_sample, Section};
use crate::query::{DeviceHandle, GpuBackend};

/// Default, min and max management limit; set by the board vendor.
fn rated_limits(gpu: &dyn GpuBackend, h: DeviceHandle, index: u32, uuid: &str) -> StaticFragment {
    let mut frag = StaticFragment::default();
    let mut line = |limit: &str, mw: u32| {
        write_gpu_sample(&mut frag.text, desc::POWER.name, index, uuid, &[("limit", &limit)], mw);
        frag.supported += 1;
    };
    if let Ok(mw) = gpu.power_management_default_limit(h) {
        line("default", mw);
    }
    if let Ok((min, max)) = gpu.power_limit_constraints(h) {
        line("min", min);
        line("max", max);
    }
    frag
}

/// Emits `nvmex_power_consumption_mJ`, `nvmex_perf_state` and
/// `nvmex_power_mW`.
#[derive(Debug, Default)]
pub struct PowerCollector;

impl Collector for PowerCollector {
    fn id(&self) -> &'static str {
        "power"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut energy = Section::new(desc::POWER_CONSUMPTION);
        let mut pstate = Section::new(desc::PERF_STATE);
        let mut power = Section::new(desc::POWER);

        for (h, dev) in active(devices) {
            if let Some(mj) = dev.query(Family::Energy, |h| gpu.total_energy_consumption(h)) {
                energy.gpu_sample(dev.index, &dev.uuid, &[], mj);
            }
            if let Some(p) = dev.query(Family::PerfState, |h| gpu.performance_state(h)) {
                pstate.gpu_sample(dev.index, &dev.uuid, &[], p);
            }

            if let Some(mw) = dev.query(Family::PowerUsage, |h| gpu.power_usage(h)) {
                power.gpu_sample(dev.index, &dev.uuid, &[("usage", &"now")], mw);
            }
            if let Some(mw) = dev.query(Family::PowerEnforcedLimit, |h| gpu.enforced_power_limit(h)) {
                power.gpu_sample(dev.index, &dev.uuid, &[("limit", &"enforced")], mw);
            }
            if let Some(mw) = dev.query(Family::PowerManagementLimit, |h| gpu.power_management_limit(h)) {
                power.gpu_sample(dev.index, &dev.uuid, &[("limit", &"throttle")], mw);
            }
            let (index, uuid) = (dev.index, dev.uuid.as_str());
            let frag = dev.statics.get_or_init(StaticFamily::PowerLimits, || rated_limits(gpu, h, index, uuid));
            power.append_raw(&frag.text);
        }
        flush_all([energy, pstate, power], out, compact)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{lines_with, run, table};
    use super::*;
    use crate::query::{QueryError, StubBackend};

    #[test]
    fn test_power_sections() {
        let backend = StubBackend::with_full_devices(1);
        let mut devices = table(&backend);

        let (any, text) = run(&mut PowerCollector, &backend, &mut devices, false);
        assert!(any);
        assert!(text.contains("# TYPE nvmex_power_consumption_mJ counter\n"));
        assert!(lines_with(&text, &["nvmex_power_consumption_mJ{"])[0].ends_with("} 123456789"));
        assert!(lines_with(&text, &["nvmex_perf_state{"])[0].ends_with("} 0"));
        assert!(lines_with(&text, &["usage=\"now\""])[0].ends_with("} 45123"));
        assert!(lines_with(&text, &["limit=\"throttle\""])[0].ends_with("} 300000"));
        assert!(lines_with(&text, &["limit=\"min\""])[0].ends_with("} 150000"));
    }

    #[test]
    fn test_limit_order() {
        let backend = StubBackend::with_full_devices(1);
        let mut devices = table(&backend);

        let (_, text) = run(&mut PowerCollector, &backend, &mut devices, true);
        let limits: Vec<_> = lines_with(&text, &["nvmex_power_mW{"])
            .iter()
            .map(|l| l.split('"').nth(3).unwrap().to_string())
            .collect();
        assert_eq!(limits, vec!["now", "enforced", "throttle", "default", "min", "max"]);
    }

    #[test]
    fn test_rated_limits_cached() {
        let backend = StubBackend::with_full_devices(1);
        let mut devices = table(&backend);
        let mut collector = PowerCollector;

        for _ in 0..3 {
            run(&mut collector, &backend, &mut devices, true);
        }
        assert_eq!(backend.calls(0, "power_limit_constraints"), 1);
        assert_eq!(backend.calls(0, "power_management_default_limit"), 1);
        assert_eq!(backend.calls(0, "power_usage"), 3);
    }

    #[test]
    fn test_energy_unsupported_keeps_other_sections() {
        let mut backend = StubBackend::with_full_devices(1);
        backend.device_mut(0).energy = Err(QueryError::NotSupported);
        let mut devices = table(&backend);

        let (_, text) = run(&mut PowerCollector, &backend, &mut devices, false);
        assert!(!text.contains("nvmex_power_consumption_mJ"));
        assert!(text.contains("# HELP nvmex_power_mW"));
    }
}
