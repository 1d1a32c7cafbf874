//! GPU, memory, encoder and decoder utilization.

use super::{active, Collector};
use crate::buffer::MetricBuffer;
use crate::capability::Family;
use crate::device::Device;
use crate::exposition::{desc, Section};
use crate::query::GpuBackend;

/// Emits `nvmex_util_pct{value=gpu|memory|decoder|encoder}`.
///
/// Encoder and decoder figures are averaged over a driver chosen period;
/// outside compact mode that period is noted in a comment line.
#[derive(Debug, Default)]
pub struct UtilizationCollector;

impl Collector for UtilizationCollector {
    fn id(&self) -> &'static str {
        "utilization"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut util = Section::new(desc::UTIL);
        for (_, dev) in active(devices) {
            if let Some(u) = dev.query(Family::Utilization, |h| gpu.utilization(h)) {
                util.gpu_sample(dev.index, &dev.uuid, &[("value", &"gpu")], u.gpu);
                util.gpu_sample(dev.index, &dev.uuid, &[("value", &"memory")], u.memory);
            }

            let decoder = dev.query(Family::DecoderUtilization, |h| gpu.decoder_utilization(h));
            let encoder = dev.query(Family::EncoderUtilization, |h| gpu.encoder_utilization(h));
            for (value, sampled) in [("decoder", decoder), ("encoder", encoder)] {
                let Some(s) = sampled else {
                    continue;
                };
                if !compact {
                    util.comment(format_args!("sample interval: {} ms", s.period_us / 1000));
                }
                util.gpu_sample(dev.index, &dev.uuid, &[("value", &value)], s.percent);
            }
        }
        util.flush(out, compact)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{lines_with, run, table};
    use super::*;
    use crate::query::{QueryError, SampledUtilization, StubBackend};

    #[test]
    fn test_utilization_lines() {
        let mut backend = StubBackend::with_full_devices(1);
        backend.device_mut(0).encoder_utilization =
            Ok(SampledUtilization { percent: 7, period_us: 167_000 });
        let mut devices = table(&backend);

        let (_, text) = run(&mut UtilizationCollector, &backend, &mut devices, false);
        assert!(lines_with(&text, &["value=\"gpu\""])[0].ends_with("} 12"));
        assert!(lines_with(&text, &["value=\"memory\""])[0].ends_with("} 3"));
        assert!(lines_with(&text, &["value=\"encoder\""])[0].ends_with("} 7"));
        assert_eq!(lines_with(&text, &["#  sample interval: 167 ms"]).len(), 2);
    }

    #[test]
    fn test_compact_has_no_interval_comment() {
        let backend = StubBackend::with_full_devices(1);
        let mut devices = table(&backend);

        let (_, text) = run(&mut UtilizationCollector, &backend, &mut devices, true);
        assert!(!text.contains('#'));
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn test_codec_utilization_unsupported() {
        let mut backend = StubBackend::with_full_devices(1);
        backend.device_mut(0).encoder_utilization = Err(QueryError::NotSupported);
        backend.device_mut(0).decoder_utilization = Err(QueryError::NotSupported);
        let mut devices = table(&backend);
        let mut collector = UtilizationCollector;

        run(&mut collector, &backend, &mut devices, false);
        let (_, text) = run(&mut collector, &backend, &mut devices, false);
        assert!(!text.contains("sample interval"));
        assert_eq!(backend.calls(0, "encoder_utilization"), 1);
        assert_eq!(backend.calls(0, "utilization"), 2);
    }
}
