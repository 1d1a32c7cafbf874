//! Scrape orchestration.
//!
//! A [`Session`] owns everything that lives as long as the process: the
//! backend, the device table with its capability flags and static
//! fragments, and the collector list. One call to [`Session::scrape`] runs
//! every enabled collector once, in registry order, and returns the
//! rendered exposition.
//!
//! A session is not shareable between threads while scraping; callers
//! serving concurrent requests wrap it in a mutex.

use crate::buffer::MetricBuffer;
use crate::collectors::{registry, Collector};
use crate::config::{Config, MetricSelection, MetricToggle};
use crate::device::{Device, DeviceTable};
use crate::error::Result;
use crate::exposition::{desc, Section};
use crate::logging::TimingGuard;
use crate::query::GpuBackend;
use tracing::{debug, info, warn};

/// Output options of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeOptions {
    /// Omit `# HELP` / `# TYPE` lines.
    pub compact: bool,
    /// Append `nvmex_scrape_duration_seconds` per collector.
    pub scrape_time: bool,
    /// Append `nvmex_scrape_duration_seconds{collector="all"}`.
    pub scrape_time_all: bool,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self { compact: false, scrape_time: true, scrape_time_all: true }
    }
}

impl ScrapeOptions {
    /// Options as configured, with the metric selection applied.
    #[must_use]
    pub fn from_config(config: &Config, selection: &MetricSelection) -> Self {
        Self {
            compact: config.global.compact,
            scrape_time: selection.is_enabled(MetricToggle::ScrapeTime),
            scrape_time_all: config.global.scrape_time_all,
        }
    }
}

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeState {
    /// Waiting for the next scrape.
    Idle,
    /// Collectors are running.
    Collecting,
}

/// Process-lifetime collection state.
pub struct Session<B: GpuBackend> {
    backend: B,
    table: DeviceTable,
    collectors: Vec<Box<dyn Collector>>,
    options: ScrapeOptions,
    state: ScrapeState,
    last_len: usize,
    torn_down: bool,
}

impl<B: GpuBackend> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("devices", &self.table.len())
            .field("collectors", &self.collectors.iter().map(|c| c.id()).collect::<Vec<_>>())
            .field("options", &self.options)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<B: GpuBackend> Session<B> {
    /// Enumerates devices and builds the enabled collectors.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ExporterError::NoDevices`] if there is nothing to
    /// collect. The backend is shut down before returning the error.
    pub fn new(mut backend: B, options: ScrapeOptions, selection: &MetricSelection) -> Result<Self> {
        let table = match DeviceTable::enumerate(&backend) {
            Ok(table) => table,
            Err(e) => {
                if let Err(err) = backend.shutdown() {
                    debug!(error = %err, "backend shutdown failed");
                }
                return Err(e);
            }
        };
        let collectors = registry(selection);
        info!(
            devices = table.len(),
            collectors = collectors.len(),
            compact = options.compact,
            "collection session ready"
        );
        Ok(Self {
            backend,
            table,
            collectors,
            options,
            state: ScrapeState::Idle,
            last_len: 0,
            torn_down: false,
        })
    }

    /// Runs one scrape.
    pub fn scrape(&mut self) -> String {
        self.scrape_with(|_, _| {})
    }

    /// Runs one scrape; `tail` may append extra families at the end. It
    /// receives the buffer and the compact flag. Verbose output ends with a
    /// blank line.
    pub fn scrape_with(&mut self, tail: impl FnOnce(&mut MetricBuffer, bool)) -> String {
        debug_assert_eq!(self.state, ScrapeState::Idle);
        self.state = ScrapeState::Collecting;
        let scrape = TimingGuard::new("scrape");

        let compact = self.options.compact;
        let mut out = MetricBuffer::with_capacity(self.last_len.max(4096));
        let mut durations = Section::new(desc::SCRAPE_DURATION);
        let devices = self.table.devices_mut();

        for collector in &mut self.collectors {
            let guard = TimingGuard::new(collector.id());
            let any = collector.collect(&mut out, compact, &self.backend, devices);
            let elapsed = guard.finish();
            if self.options.scrape_time && !devices.is_empty() {
                durations.sample(&[("collector", &collector.id())], elapsed.as_secs_f64());
            }
            if !any {
                debug!(collector = collector.id(), "no samples");
            }
        }
        let total = scrape.finish();
        if self.options.scrape_time_all && !devices.is_empty() {
            durations.sample(&[("collector", &"all")], total.as_secs_f64());
        }
        durations.flush(&mut out, compact);
        tail(&mut out, compact);
        if !compact {
            out.append("\n");
        }

        debug!(bytes = out.len(), ms = total.as_secs_f64() * 1000.0, "scrape done");
        self.last_len = out.len();
        self.state = ScrapeState::Idle;
        out.into_string()
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The backend, mutable. Stub backends are rescripted this way in tests.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// All devices, including placeholders.
    pub fn devices(&self) -> &[Device] {
        self.table.devices()
    }

    /// Output options.
    pub fn options(&self) -> ScrapeOptions {
        self.options
    }

    /// Current state.
    pub fn state(&self) -> ScrapeState {
        self.state
    }

    /// Releases devices and shuts the backend down. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.table.teardown();
        match self.backend.shutdown() {
            Ok(()) => info!("GPU management library shut down"),
            Err(e) => warn!(error = %e, "GPU management library shutdown failed"),
        }
    }
}

impl<B: GpuBackend> Drop for Session<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}
