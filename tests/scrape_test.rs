//! End-to-end scrape properties against the scripted backend.
//!
//! Run with: cargo test --test scrape_test

#![allow(clippy::unwrap_used)]

use nvmex::capability::{Capability, Family};
use nvmex::config::{MetricSelection, MetricToggle};
use nvmex::query::{EccMode, QueryError, StubBackend};
use nvmex::scrape::{ScrapeOptions, Session};
use proptest::prelude::*;

const QUIET: ScrapeOptions = ScrapeOptions { compact: false, scrape_time: false, scrape_time_all: false };

fn session(backend: StubBackend, options: ScrapeOptions) -> Session<StubBackend> {
    Session::new(backend, options, &MetricSelection::all()).unwrap()
}

fn lines_for<'a>(text: &'a str, metric: &str, gpu: u32) -> Vec<&'a str> {
    let prefix = format!("{metric}{{gpu=\"{gpu}\"");
    text.lines().filter(|l| l.starts_with(&prefix)).collect()
}

// ============================================================================
// Capability stickiness
// ============================================================================

#[test]
fn test_unsupported_family_never_queried_again() {
    let mut backend = StubBackend::with_full_devices(2);
    let dev = backend.device_mut(1);
    dev.fan_speed = Err(QueryError::NotSupported);
    dev.temperature = Err(QueryError::NotSupported);
    dev.ecc_mode = Err(QueryError::NotSupported);
    dev.pcie_replay = Err(QueryError::NotSupported);
    let mut s = session(backend, QUIET);

    for _ in 0..5 {
        let text = s.scrape();
        assert!(lines_for(&text, "nvmex_fan_speed_pct", 1).is_empty());
        assert_eq!(lines_for(&text, "nvmex_fan_speed_pct", 0).len(), 1);
    }

    let backend = s.backend();
    assert_eq!(backend.calls(1, "fan_speed"), 1);
    assert_eq!(backend.calls(1, "temperature"), 1);
    assert_eq!(backend.calls(1, "ecc_mode"), 1);
    assert_eq!(backend.calls(1, "pcie_replay_counter"), 1);
    assert_eq!(backend.calls(0, "fan_speed"), 5, "supported families are read every scrape");

    let dev = &s.devices()[1];
    assert_eq!(dev.caps.get(Family::Fan), Capability::Unsupported);
    assert_eq!(dev.caps.get(Family::Temperature), Capability::Unsupported);
    assert_eq!(s.devices()[0].caps.get(Family::Fan), Capability::Supported);
}

#[test]
fn test_lost_device_is_retried() {
    let mut backend = StubBackend::with_full_devices(1);
    backend.device_mut(0).power_usage = Err(QueryError::GpuLost);
    let mut s = session(backend, QUIET);

    s.scrape();
    s.scrape();
    assert_eq!(s.backend().calls(0, "power_usage"), 2);
    assert_eq!(s.devices()[0].caps.get(Family::PowerUsage), Capability::Undetermined);
}

// ============================================================================
// Static attributes
// ============================================================================

#[test]
fn test_static_fragments_computed_once() {
    let mut s = session(StubBackend::with_full_devices(2), QUIET);
    for _ in 0..4 {
        s.scrape();
    }

    let backend = s.backend();
    for gpu in 0..2 {
        assert_eq!(backend.calls(gpu, "name"), 1);
        assert_eq!(backend.calls(gpu, "supported_memory_clocks"), 1);
        assert_eq!(backend.calls(gpu, "supported_graphics_clocks"), 1);
        assert_eq!(backend.calls(gpu, "temperature_threshold"), 4);
        assert_eq!(backend.calls(gpu, "power_limit_constraints"), 1);
        assert_eq!(backend.calls(gpu, "power_management_default_limit"), 1);
        assert_eq!(backend.calls(gpu, "pcie_link"), 4);
    }
}

#[test]
fn test_static_fragment_survives_later_failure() {
    let mut s = session(StubBackend::with_full_devices(1), QUIET);
    let first = s.scrape();
    s.backend_mut().device_mut(0).name = Err(QueryError::GpuLost);
    let second = s.scrape();

    let info = |t: &str| lines_for(t, "nvmex_gpu_info", 0).join("\n");
    assert_eq!(info(&first), info(&second));
    assert!(info(&second).contains("name=\"Tesla V100-SXM2-16GB\""));
}

// ============================================================================
// Idempotence
// ============================================================================

#[test]
fn test_unchanged_state_renders_identically() {
    // Process usage moves between scrapes; GPU state does not.
    let mut selection = MetricSelection::all();
    selection.disable(MetricToggle::Process);
    let mut s = Session::new(StubBackend::with_full_devices(3), QUIET, &selection).unwrap();
    let first = s.scrape();
    let second = s.scrape();
    assert_eq!(first, second);
    assert!(first.ends_with("\n\n"));
}

// ============================================================================
// Transient failures
// ============================================================================

#[test]
fn test_transient_failure_on_one_device() {
    let mut backend = StubBackend::with_full_devices(3);
    backend.device_mut(1).fan_speed = Err(QueryError::Driver("busy".to_string()));
    let mut s = session(backend, QUIET);

    let text = s.scrape();
    assert_eq!(lines_for(&text, "nvmex_fan_speed_pct", 0).len(), 1);
    assert!(lines_for(&text, "nvmex_fan_speed_pct", 1).is_empty());
    assert_eq!(lines_for(&text, "nvmex_fan_speed_pct", 2).len(), 1);
    assert_eq!(s.devices()[1].caps.get(Family::Fan), Capability::Undetermined);

    s.backend_mut().device_mut(1).fan_speed = Ok(55);
    let text = s.scrape();
    let line = lines_for(&text, "nvmex_fan_speed_pct", 1);
    assert_eq!(line.len(), 1);
    assert!(line[0].ends_with("} 55"));
    assert_eq!(s.devices()[1].caps.get(Family::Fan), Capability::Supported);
}

#[test]
fn test_insufficient_size_keeps_scrape_complete() {
    let mut backend = StubBackend::with_full_devices(1);
    backend.device_mut(0).memory = Err(QueryError::InsufficientSize);
    let mut s = session(backend, QUIET);

    let text = s.scrape();
    assert!(!text.contains("nvmex_memory_bytes"));
    assert!(!text.contains("# HELP nvmex_memory_bytes"), "no header for an empty family");
    assert!(text.contains("nvmex_ecc_mode{"));
    assert!(text.lines().all(|l| l.is_empty() || l.starts_with('#') || l.contains("} ")));
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_ecc_mode_scenario() {
    let mut backend = StubBackend::with_full_devices(2);
    backend.device_mut(0).ecc_mode = Ok(EccMode { current: true, pending: false });
    backend.device_mut(1).ecc_mode = Err(QueryError::NotSupported);
    let mut s = session(backend, QUIET);
    let uuid0 = s.devices()[0].uuid.clone();

    for _ in 0..3 {
        let text = s.scrape();
        assert!(text.contains(&format!("nvmex_ecc_mode{{gpu=\"0\",mode=\"current\",uuid=\"{uuid0}\"}} 1\n")));
        assert!(text.contains(&format!("nvmex_ecc_mode{{gpu=\"0\",mode=\"pending\",uuid=\"{uuid0}\"}} 0\n")));
        assert!(lines_for(&text, "nvmex_ecc_mode", 1).is_empty());
    }
    assert_eq!(s.devices()[1].caps.get(Family::EccMode), Capability::Unsupported);
    assert_eq!(s.backend().calls(1, "ecc_mode"), 1);
}

#[test]
fn test_memory_clock_envelope_scenario() {
    let mut backend = StubBackend::with_full_devices(1);
    backend.device_mut(0).supported_memory_clocks = Ok((3..=12).map(|n| n * 100).chain([1215]).rev().collect());
    backend.device_mut(0).max_clock[2] = Ok(1215);
    let mut s = session(backend, QUIET);

    let text = s.scrape();
    let mem = |value: &str| {
        let needle = format!("domain=\"MEM\",value=\"{value}\"");
        text.lines().find(|l| l.contains(&needle)).map(str::to_string).unwrap()
    };
    assert!(mem("max").ends_with("} 1215"));
    assert!(mem("min").ends_with("} 300"));
}

#[test]
fn test_uuid_prefix_stripped() {
    let mut s = session(StubBackend::with_full_devices(1), QUIET);
    let text = s.scrape();
    assert!(text.contains("uuid=\"8e3c1f0a-5b2d-4c6e-9f17-000000000000\""));
    assert!(!text.contains("uuid=\"GPU-"));
}

// ============================================================================
// Compact mode
// ============================================================================

fn selection_from_bits(bits: u32) -> MetricSelection {
    let mut selection = MetricSelection::none();
    for (i, toggle) in MetricToggle::ALL.iter().enumerate() {
        if bits & (1 << i) != 0 {
            selection.enable(*toggle);
        }
    }
    selection
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_compact_is_verbose_without_comments(bits in 0u32..(1 << MetricToggle::ALL.len()), devices in 1u32..4) {
        let selection = selection_from_bits(bits);
        let mut verbose = Session::new(
            StubBackend::with_full_devices(devices),
            ScrapeOptions { compact: false, scrape_time: false, scrape_time_all: false },
            &selection,
        ).unwrap();
        let mut compact = Session::new(
            StubBackend::with_full_devices(devices),
            ScrapeOptions { compact: true, scrape_time: false, scrape_time_all: false },
            &selection,
        ).unwrap();

        let verbose = verbose.scrape();
        let compact = compact.scrape();
        // Process samples differ between the two sessions; the blank
        // terminator line is verbose only.
        let gpu = |l: &&str| !l.is_empty() && !l.starts_with("nvmex_process_");
        let data: Vec<&str> = verbose.lines().filter(|l| !l.starts_with('#')).filter(gpu).collect();
        let compact_lines: Vec<&str> = compact.lines().filter(gpu).collect();
        prop_assert_eq!(compact_lines, data);
        prop_assert!(!compact.contains("# HELP"));
        prop_assert!(!compact.contains("# TYPE"));
    }
}
