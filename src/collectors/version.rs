//! Software versions.
//!
//! Formatted on the first scrape and re-emitted verbatim afterwards; none of
//! the values can change while the process runs.

use super::Collector;
use crate::buffer::MetricBuffer;
use crate::device::Device;
use crate::exposition::{desc, write_sample, Section};
use crate::query::GpuBackend;
use tracing::debug;

/// Formats the integer CUDA version (`12020`) as `12.2.0`.
fn cuda_version(v: i32) -> String {
    format!("{}.{}.{}", v / 1000, (v % 1000) / 10, v % 10)
}

/// Emits `nvmex_version`.
#[derive(Debug, Default)]
pub struct VersionCollector {
    body: Option<String>,
}

impl VersionCollector {
    /// Creates the collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn format(gpu: &dyn GpuBackend) -> String {
        let mut versions = String::new();
        let mut component = |name: &str, version: &str| {
            write_sample(
                &mut versions,
                desc::VERSION.name,
                &[("component", &name), ("version", &version)],
                1,
            );
        };
        component("nvmex", env!("CARGO_PKG_VERSION"));
        match gpu.driver_version() {
            Ok(v) => component("driver", v.as_str()),
            Err(e) => debug!(error = %e, "driver version unavailable"),
        }
        match gpu.nvml_version() {
            Ok(v) => component("nvml", v.as_str()),
            Err(e) => debug!(error = %e, "NVML version unavailable"),
        }
        match gpu.cuda_driver_version() {
            Ok(v) => component("cuda", cuda_version(v).as_str()),
            Err(e) => debug!(error = %e, "CUDA driver version unavailable"),
        }
        versions
    }
}

impl Collector for VersionCollector {
    fn id(&self) -> &'static str {
        "version"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        if devices.is_empty() {
            return false;
        }
        let body = self.body.get_or_insert_with(|| Self::format(gpu));
        let mut version = Section::new(desc::VERSION);
        version.append_raw(body);
        version.flush(out, compact)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{lines_with, run, table};
    use super::*;
    use crate::query::{QueryError, StubBackend};

    #[test]
    fn test_cuda_version_format() {
        assert_eq!(cuda_version(12_020), "12.2.0");
        assert_eq!(cuda_version(11_040), "11.4.0");
        assert_eq!(cuda_version(10_012), "10.1.2");
    }

    #[test]
    fn test_versions_emitted() {
        let backend = StubBackend::with_full_devices(1);
        let mut devices = table(&backend);
        let (any, text) = run(&mut VersionCollector::new(), &backend, &mut devices, false);

        assert!(any);
        assert!(text.contains("# TYPE nvmex_version gauge\n"));
        assert_eq!(lines_with(&text, &["component=\"driver\"", "version=\"535.104.05\""]).len(), 1);
        assert_eq!(lines_with(&text, &["component=\"cuda\"", "version=\"12.2.0\""]).len(), 1);
        assert_eq!(lines_with(&text, &["component=\"nvmex\""]).len(), 1);
        assert!(!text.contains("nvmex_process_"), "process metrics have their own toggle");
    }

    #[test]
    fn test_versions_formatted_once() {
        let mut backend = StubBackend::with_full_devices(1);
        let mut devices = table(&backend);
        let mut collector = VersionCollector::new();

        let (_, first) = run(&mut collector, &backend, &mut devices, true);
        backend.driver_version = Ok("999.0".to_string());
        let (_, second) = run(&mut collector, &backend, &mut devices, true);
        assert_eq!(first, second, "cached text must be reused verbatim");
    }

    #[test]
    fn test_missing_versions_are_skipped() {
        let mut backend = StubBackend::with_full_devices(1);
        backend.nvml_version = Err(QueryError::NotSupported);
        backend.cuda_version = Err(QueryError::Driver("old driver".into()));
        let mut devices = table(&backend);

        let (_, text) = run(&mut VersionCollector::new(), &backend, &mut devices, true);
        assert!(lines_with(&text, &["component=\"nvml\""]).is_empty());
        assert!(lines_with(&text, &["component=\"cuda\""]).is_empty());
        assert_eq!(lines_with(&text, &["component=\"driver\""]).len(), 1);
    }
}
