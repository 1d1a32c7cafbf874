//! Scriptable in-memory backend.
//!
//! Every result is a public field that tests set directly and may change
//! between scrapes. Unset results default to `NotSupported`. Each query is
//! counted per device so tests can assert how often the driver was hit.

use super::{
    fields, ClockDomain, CodecStats, DeviceHandle, EccMode, EncoderSession, FbcSession, FieldId,
    GpuBackend, MemoryUsage, PcieDirection, PcieLinkAttr, PerfPolicy, QueryError, QueryResult,
    RemappedRows, RetirementCause, SampledUtilization, TemperatureThreshold, Utilization,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

fn ns<T>() -> QueryResult<T> {
    Err(QueryError::NotSupported)
}

fn ns_array<T, const N: usize>() -> [QueryResult<T>; N] {
    std::array::from_fn(|_| ns())
}

/// Scripted results of one device.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct StubDevice {
    pub uuid: QueryResult<String>,
    pub bus_id: QueryResult<String>,
    pub name: QueryResult<String>,

    /// Indexed by [`ClockDomain::index`].
    pub clock: [QueryResult<u32>; 4],
    pub applications_clock: [QueryResult<u32>; 4],
    pub default_applications_clock: [QueryResult<u32>; 4],
    pub max_clock: [QueryResult<u32>; 4],
    pub max_customer_boost_clock: [QueryResult<u32>; 4],
    pub supported_memory_clocks: QueryResult<Vec<u32>>,
    /// Graphics clocks keyed by memory clock; a missing key is `NotSupported`.
    pub supported_graphics_clocks: BTreeMap<u32, QueryResult<Vec<u32>>>,
    pub throttle_reasons: QueryResult<u64>,

    pub memory: QueryResult<MemoryUsage>,
    pub bar1_memory: QueryResult<MemoryUsage>,

    pub temperature: QueryResult<u32>,
    /// Indexed like [`TemperatureThreshold::ALL`].
    pub thresholds: [QueryResult<u32>; 4],
    /// Error of the whole field request, if any.
    pub field_request: Option<QueryError>,
    /// Per-field results; a missing id is `NotSupported`.
    pub fields: BTreeMap<FieldId, QueryResult<u64>>,

    pub energy: QueryResult<u64>,
    pub perf_state: QueryResult<u32>,
    pub power_usage: QueryResult<u32>,
    pub enforced_power_limit: QueryResult<u32>,
    pub power_management_limit: QueryResult<u32>,
    pub power_default_limit: QueryResult<u32>,
    pub power_constraints: QueryResult<(u32, u32)>,

    pub fan_speed: QueryResult<u32>,
    pub utilization: QueryResult<Utilization>,
    pub encoder_utilization: QueryResult<SampledUtilization>,
    pub decoder_utilization: QueryResult<SampledUtilization>,

    pub pcie_tx: QueryResult<u32>,
    pub pcie_rx: QueryResult<u32>,
    pub pcie_replay: QueryResult<u32>,
    /// Indexed like [`PcieLinkAttr::ALL`].
    pub pcie_link: [QueryResult<u32>; 4],

    /// Indexed like [`PerfPolicy::ALL`].
    pub violations: [QueryResult<u64>; 8],
    pub ecc_mode: QueryResult<EccMode>,
    pub retired_sbe: QueryResult<u32>,
    pub retired_dbe: QueryResult<u32>,
    pub retired_pending: QueryResult<bool>,
    pub remapped_rows: QueryResult<RemappedRows>,

    pub encoder_stats: QueryResult<CodecStats>,
    pub encoder_sessions: QueryResult<Vec<EncoderSession>>,
    pub fbc_stats: QueryResult<CodecStats>,
    pub fbc_sessions: QueryResult<Vec<FbcSession>>,
}

impl Default for StubDevice {
    fn default() -> Self {
        Self {
            uuid: ns(),
            bus_id: ns(),
            name: ns(),
            clock: ns_array(),
            applications_clock: ns_array(),
            default_applications_clock: ns_array(),
            max_clock: ns_array(),
            max_customer_boost_clock: ns_array(),
            supported_memory_clocks: ns(),
            supported_graphics_clocks: BTreeMap::new(),
            throttle_reasons: ns(),
            memory: ns(),
            bar1_memory: ns(),
            temperature: ns(),
            thresholds: ns_array(),
            field_request: None,
            fields: BTreeMap::new(),
            energy: ns(),
            perf_state: ns(),
            power_usage: ns(),
            enforced_power_limit: ns(),
            power_management_limit: ns(),
            power_default_limit: ns(),
            power_constraints: ns(),
            fan_speed: ns(),
            utilization: ns(),
            encoder_utilization: ns(),
            decoder_utilization: ns(),
            pcie_tx: ns(),
            pcie_rx: ns(),
            pcie_replay: ns(),
            pcie_link: ns_array(),
            violations: ns_array(),
            ecc_mode: ns(),
            retired_sbe: ns(),
            retired_dbe: ns(),
            retired_pending: ns(),
            remapped_rows: ns(),
            encoder_stats: ns(),
            encoder_sessions: ns(),
            fbc_stats: ns(),
            fbc_sessions: ns(),
        }
    }
}

impl StubDevice {
    /// A device that only answers identity queries.
    #[must_use]
    pub fn with_uuid(uuid: &str) -> Self {
        Self { uuid: Ok(uuid.to_string()), ..Self::default() }
    }

    /// A data centre GPU answering every query.
    #[must_use]
    pub fn full(index: u32) -> Self {
        const GIB: u64 = 1 << 30;
        let mut values = BTreeMap::new();
        values.insert(fields::MEMORY_TEMP, Ok(38));
        for id in fields::ECC_FIRST..=fields::ECC_LAST {
            values.insert(FieldId(id), Ok(0));
        }
        values.insert(fields::NVLINK_LINK_COUNT, Ok(6));
        values.insert(fields::NVLINK_SPEED_MBPS_COMMON, Ok(25_781));
        for id in [
            fields::NVLINK_CRC_FLIT_ERROR_TOTAL,
            fields::NVLINK_CRC_DATA_ERROR_TOTAL,
            fields::NVLINK_REPLAY_ERROR_TOTAL,
            fields::NVLINK_RECOVERY_ERROR_TOTAL,
        ] {
            values.insert(id, Ok(0));
        }
        values.insert(fields::NVLINK_THROUGHPUT_DATA_TX, Ok(1_024));
        values.insert(fields::NVLINK_THROUGHPUT_DATA_RX, Ok(2_048));
        values.insert(fields::NVLINK_THROUGHPUT_RAW_TX, Ok(1_100));
        values.insert(fields::NVLINK_THROUGHPUT_RAW_RX, Ok(2_200));

        let mut graphics = BTreeMap::new();
        graphics.insert(877, Ok(vec![1530, 1380, 1005, 135]));

        let mut violations: [QueryResult<u64>; 8] = std::array::from_fn(|_| Ok(0));
        violations[0] = Ok(1_500_000_000);

        Self {
            uuid: Ok(format!("GPU-8e3c1f0a-5b2d-4c6e-9f17-00000000{index:04x}")),
            bus_id: Ok(format!("00000000:{:02X}:00.0", 0x18 + index)),
            name: Ok("Tesla V100-SXM2-16GB".to_string()),
            clock: [Ok(1380), Ok(1380), Ok(877), Ok(1237)],
            applications_clock: [Ok(1312), Ok(1312), Ok(877), Ok(1237)],
            default_applications_clock: [Ok(1312), Ok(1312), Ok(877), Ok(1237)],
            max_clock: [Ok(1530), Ok(1530), Ok(877), Ok(1372)],
            max_customer_boost_clock: ns_array(),
            supported_memory_clocks: Ok(vec![877]),
            supported_graphics_clocks: graphics,
            throttle_reasons: Ok(0x1),
            memory: Ok(MemoryUsage { free: 15 * GIB, total: 16 * GIB, used: GIB }),
            bar1_memory: Ok(MemoryUsage { free: 16 * GIB - (4 << 20), total: 16 * GIB, used: 4 << 20 }),
            temperature: Ok(41),
            thresholds: [Ok(85), Ok(84), Ok(87), Ok(95)],
            field_request: None,
            fields: values,
            energy: Ok(123_456_789),
            perf_state: Ok(0),
            power_usage: Ok(45_123),
            enforced_power_limit: Ok(300_000),
            power_management_limit: Ok(300_000),
            power_default_limit: Ok(300_000),
            power_constraints: Ok((150_000, 300_000)),
            fan_speed: Ok(30),
            utilization: Ok(Utilization { gpu: 12, memory: 3 }),
            encoder_utilization: Ok(SampledUtilization { percent: 0, period_us: 167_000 }),
            decoder_utilization: Ok(SampledUtilization { percent: 0, period_us: 167_000 }),
            pcie_tx: Ok(1_000),
            pcie_rx: Ok(2_000),
            pcie_replay: Ok(0),
            pcie_link: [Ok(3), Ok(3), Ok(16), Ok(16)],
            violations,
            ecc_mode: Ok(EccMode { current: true, pending: true }),
            retired_sbe: Ok(0),
            retired_dbe: Ok(0),
            retired_pending: Ok(false),
            remapped_rows: ns(),
            encoder_stats: Ok(CodecStats::default()),
            encoder_sessions: Ok(Vec::new()),
            fbc_stats: Ok(CodecStats::default()),
            fbc_sessions: Ok(Vec::new()),
        }
    }
}

/// In-memory [`GpuBackend`].
#[derive(Debug)]
pub struct StubBackend {
    /// `None` entries fail handle acquisition.
    pub devices: Vec<Option<StubDevice>>,
    /// Kernel module version.
    pub driver_version: QueryResult<String>,
    /// Management library version.
    pub nvml_version: QueryResult<String>,
    /// CUDA driver version, integer form.
    pub cuda_version: QueryResult<i32>,
    calls: RefCell<HashMap<(u32, &'static str), u32>>,
    shut_down: bool,
}

impl StubBackend {
    /// Backend with the given devices and typical version strings.
    #[must_use]
    pub fn new(devices: Vec<StubDevice>) -> Self {
        Self {
            devices: devices.into_iter().map(Some).collect(),
            driver_version: Ok("535.104.05".to_string()),
            nvml_version: Ok("12.535.104.05".to_string()),
            cuda_version: Ok(12_020),
            calls: RefCell::new(HashMap::new()),
            shut_down: false,
        }
    }

    /// `count` fully populated devices.
    #[must_use]
    pub fn with_full_devices(count: u32) -> Self {
        Self::new((0..count).map(StubDevice::full).collect())
    }

    /// Mutable access to the scripted results of device `index`.
    ///
    /// # Panics
    ///
    /// Panics if there is no such device.
    pub fn device_mut(&mut self, index: usize) -> &mut StubDevice {
        match self.devices.get_mut(index) {
            Some(Some(dev)) => dev,
            _ => panic!("no stub device at index {index}"),
        }
    }

    /// How often `query` was issued against device `index`.
    #[must_use]
    pub fn calls(&self, index: u32, query: &str) -> u32 {
        self.calls
            .borrow()
            .iter()
            .filter(|((i, q), _)| *i == index && *q == query)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Whether [`GpuBackend::shutdown`] was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn dev(&self, handle: DeviceHandle, query: &'static str) -> QueryResult<&StubDevice> {
        *self.calls.borrow_mut().entry((handle.raw(), query)).or_insert(0) += 1;
        if self.shut_down {
            return Err(QueryError::Uninitialized);
        }
        match self.devices.get(handle.raw() as usize) {
            Some(Some(dev)) => Ok(dev),
            _ => Err(QueryError::GpuLost),
        }
    }
}

impl GpuBackend for StubBackend {
    fn device_count(&self) -> QueryResult<u32> {
        if self.shut_down {
            return Err(QueryError::Uninitialized);
        }
        Ok(self.devices.len() as u32)
    }

    fn device_handle(&self, index: u32) -> QueryResult<DeviceHandle> {
        match self.devices.get(index as usize) {
            Some(Some(_)) if !self.shut_down => Ok(DeviceHandle::new(index)),
            Some(None) => Err(QueryError::NoPermission),
            _ => Err(QueryError::Uninitialized),
        }
    }

    fn driver_version(&self) -> QueryResult<String> {
        self.driver_version.clone()
    }

    fn nvml_version(&self) -> QueryResult<String> {
        self.nvml_version.clone()
    }

    fn cuda_driver_version(&self) -> QueryResult<i32> {
        self.cuda_version.clone()
    }

    fn shutdown(&mut self) -> QueryResult<()> {
        if self.shut_down {
            return Err(QueryError::Uninitialized);
        }
        self.shut_down = true;
        Ok(())
    }

    fn uuid(&self, dev: DeviceHandle) -> QueryResult<String> {
        self.dev(dev, "uuid")?.uuid.clone()
    }

    fn bus_id(&self, dev: DeviceHandle) -> QueryResult<String> {
        self.dev(dev, "bus_id")?.bus_id.clone()
    }

    fn name(&self, dev: DeviceHandle) -> QueryResult<String> {
        self.dev(dev, "name")?.name.clone()
    }

    fn clock(&self, dev: DeviceHandle, domain: ClockDomain) -> QueryResult<u32> {
        self.dev(dev, "clock")?.clock[domain.index()].clone()
    }

    fn applications_clock(&self, dev: DeviceHandle, domain: ClockDomain) -> QueryResult<u32> {
        self.dev(dev, "applications_clock")?.applications_clock[domain.index()].clone()
    }

    fn default_applications_clock(
        &self,
        dev: DeviceHandle,
        domain: ClockDomain,
    ) -> QueryResult<u32> {
        self.dev(dev, "default_applications_clock")?.default_applications_clock[domain.index()]
            .clone()
    }

    fn max_clock(&self, dev: DeviceHandle, domain: ClockDomain) -> QueryResult<u32> {
        self.dev(dev, "max_clock")?.max_clock[domain.index()].clone()
    }

    fn max_customer_boost_clock(
        &self,
        dev: DeviceHandle,
        domain: ClockDomain,
    ) -> QueryResult<u32> {
        self.dev(dev, "max_customer_boost_clock")?.max_customer_boost_clock[domain.index()].clone()
    }

    fn supported_memory_clocks(&self, dev: DeviceHandle) -> QueryResult<Vec<u32>> {
        self.dev(dev, "supported_memory_clocks")?.supported_memory_clocks.clone()
    }

    fn supported_graphics_clocks(&self, dev: DeviceHandle, mem_mhz: u32) -> QueryResult<Vec<u32>> {
        self.dev(dev, "supported_graphics_clocks")?
            .supported_graphics_clocks
            .get(&mem_mhz)
            .cloned()
            .unwrap_or_else(ns)
    }

    fn throttle_reasons(&self, dev: DeviceHandle) -> QueryResult<u64> {
        self.dev(dev, "throttle_reasons")?.throttle_reasons.clone()
    }

    fn memory(&self, dev: DeviceHandle) -> QueryResult<MemoryUsage> {
        self.dev(dev, "memory")?.memory.clone()
    }

    fn bar1_memory(&self, dev: DeviceHandle) -> QueryResult<MemoryUsage> {
        self.dev(dev, "bar1_memory")?.bar1_memory.clone()
    }

    fn temperature(&self, dev: DeviceHandle) -> QueryResult<u32> {
        self.dev(dev, "temperature")?.temperature.clone()
    }

    fn temperature_threshold(
        &self,
        dev: DeviceHandle,
        threshold: TemperatureThreshold,
    ) -> QueryResult<u32> {
        let idx = TemperatureThreshold::ALL.iter().position(|t| *t == threshold).unwrap_or(0);
        self.dev(dev, "temperature_threshold")?.thresholds[idx].clone()
    }

    fn field_values(
        &self,
        dev: DeviceHandle,
        ids: &[FieldId],
    ) -> QueryResult<Vec<QueryResult<u64>>> {
        let d = self.dev(dev, "field_values")?;
        if let Some(e) = &d.field_request {
            return Err(e.clone());
        }
        Ok(ids.iter().map(|id| d.fields.get(id).cloned().unwrap_or_else(ns)).collect())
    }

    fn total_energy_consumption(&self, dev: DeviceHandle) -> QueryResult<u64> {
        self.dev(dev, "total_energy_consumption")?.energy.clone()
    }

    fn performance_state(&self, dev: DeviceHandle) -> QueryResult<u32> {
        self.dev(dev, "performance_state")?.perf_state.clone()
    }

    fn power_usage(&self, dev: DeviceHandle) -> QueryResult<u32> {
        self.dev(dev, "power_usage")?.power_usage.clone()
    }

    fn enforced_power_limit(&self, dev: DeviceHandle) -> QueryResult<u32> {
        self.dev(dev, "enforced_power_limit")?.enforced_power_limit.clone()
    }

    fn power_management_limit(&self, dev: DeviceHandle) -> QueryResult<u32> {
        self.dev(dev, "power_management_limit")?.power_management_limit.clone()
    }

    fn power_management_default_limit(&self, dev: DeviceHandle) -> QueryResult<u32> {
        self.dev(dev, "power_management_default_limit")?.power_default_limit.clone()
    }

    fn power_limit_constraints(&self, dev: DeviceHandle) -> QueryResult<(u32, u32)> {
        self.dev(dev, "power_limit_constraints")?.power_constraints.clone()
    }

    fn fan_speed(&self, dev: DeviceHandle) -> QueryResult<u32> {
        self.dev(dev, "fan_speed")?.fan_speed.clone()
    }

    fn utilization(&self, dev: DeviceHandle) -> QueryResult<Utilization> {
        self.dev(dev, "utilization")?.utilization.clone()
    }

    fn encoder_utilization(&self, dev: DeviceHandle) -> QueryResult<SampledUtilization> {
        self.dev(dev, "encoder_utilization")?.encoder_utilization.clone()
    }

    fn decoder_utilization(&self, dev: DeviceHandle) -> QueryResult<SampledUtilization> {
        self.dev(dev, "decoder_utilization")?.decoder_utilization.clone()
    }

    fn pcie_throughput(&self, dev: DeviceHandle, direction: PcieDirection) -> QueryResult<u32> {
        let d = self.dev(dev, "pcie_throughput")?;
        match direction {
            PcieDirection::Tx => d.pcie_tx.clone(),
            PcieDirection::Rx => d.pcie_rx.clone(),
        }
    }

    fn pcie_replay_counter(&self, dev: DeviceHandle) -> QueryResult<u32> {
        self.dev(dev, "pcie_replay_counter")?.pcie_replay.clone()
    }

    fn pcie_link(&self, dev: DeviceHandle, attr: PcieLinkAttr) -> QueryResult<u32> {
        let idx = PcieLinkAttr::ALL.iter().position(|a| *a == attr).unwrap_or(0);
        self.dev(dev, "pcie_link")?.pcie_link[idx].clone()
    }

    fn violation_time(&self, dev: DeviceHandle, policy: PerfPolicy) -> QueryResult<u64> {
        let idx = PerfPolicy::ALL.iter().position(|p| *p == policy).unwrap_or(0);
        self.dev(dev, "violation_time")?.violations[idx].clone()
    }

    fn ecc_mode(&self, dev: DeviceHandle) -> QueryResult<EccMode> {
        self.dev(dev, "ecc_mode")?.ecc_mode.clone()
    }

    fn retired_pages(&self, dev: DeviceHandle, cause: RetirementCause) -> QueryResult<u32> {
        let d = self.dev(dev, "retired_pages")?;
        match cause {
            RetirementCause::MultipleSingleBit => d.retired_sbe.clone(),
            RetirementCause::DoubleBit => d.retired_dbe.clone(),
        }
    }

    fn retired_pages_pending(&self, dev: DeviceHandle) -> QueryResult<bool> {
        self.dev(dev, "retired_pages_pending")?.retired_pending.clone()
    }

    fn remapped_rows(&self, dev: DeviceHandle) -> QueryResult<RemappedRows> {
        self.dev(dev, "remapped_rows")?.remapped_rows.clone()
    }

    fn encoder_stats(&self, dev: DeviceHandle) -> QueryResult<CodecStats> {
        self.dev(dev, "encoder_stats")?.encoder_stats.clone()
    }

    fn encoder_sessions(
        &self,
        dev: DeviceHandle,
        out: &mut Vec<EncoderSession>,
    ) -> QueryResult<()> {
        let sessions = self.dev(dev, "encoder_sessions")?.encoder_sessions.as_ref().map_err(Clone::clone)?;
        out.clear();
        out.extend_from_slice(sessions);
        Ok(())
    }

    fn fbc_stats(&self, dev: DeviceHandle) -> QueryResult<CodecStats> {
        self.dev(dev, "fbc_stats")?.fbc_stats.clone()
    }

    fn fbc_sessions(&self, dev: DeviceHandle, out: &mut Vec<FbcSession>) -> QueryResult<()> {
        let sessions = self.dev(dev, "fbc_sessions")?.fbc_sessions.as_ref().map_err(Clone::clone)?;
        out.clear();
        out.extend_from_slice(sessions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_device_is_unsupported() {
        let backend = StubBackend::new(vec![StubDevice::default()]);
        let h = backend.device_handle(0).unwrap();

        assert_eq!(backend.fan_speed(h), Err(QueryError::NotSupported));
        assert_eq!(backend.uuid(h), Err(QueryError::NotSupported));
    }

    #[test]
    fn test_calls_are_counted() {
        let backend = StubBackend::with_full_devices(2);
        let h = backend.device_handle(1).unwrap();

        backend.fan_speed(h).unwrap();
        backend.fan_speed(h).unwrap();
        backend.memory(h).unwrap();

        assert_eq!(backend.calls(1, "fan_speed"), 2);
        assert_eq!(backend.calls(1, "memory"), 1);
        assert_eq!(backend.calls(0, "fan_speed"), 0);
    }

    #[test]
    fn test_missing_handle() {
        let mut backend = StubBackend::with_full_devices(1);
        backend.devices.push(None);

        assert_eq!(backend.device_count().unwrap(), 2);
        assert_eq!(backend.device_handle(1), Err(QueryError::NoPermission));
    }

    #[test]
    fn test_field_values_partial() {
        let backend = StubBackend::with_full_devices(1);
        let h = backend.device_handle(0).unwrap();

        let values = backend.field_values(h, &[fields::MEMORY_TEMP, FieldId(9999)]).unwrap();
        assert_eq!(values, vec![Ok(38), Err(QueryError::NotSupported)]);
    }

    #[test]
    fn test_sessions_refill_vector() {
        let mut backend = StubBackend::with_full_devices(1);
        backend.device_mut(0).encoder_sessions =
            Ok(vec![EncoderSession { session_id: 7, ..EncoderSession::default() }]);
        let h = backend.device_handle(0).unwrap();

        let mut out = vec![EncoderSession::default(); 3];
        backend.encoder_sessions(h, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].session_id, 7);
    }

    #[test]
    fn test_shutdown_uninitializes() {
        let mut backend = StubBackend::with_full_devices(1);
        let h = backend.device_handle(0).unwrap();

        backend.shutdown().unwrap();
        assert!(backend.is_shut_down());
        assert_eq!(backend.memory(h), Err(QueryError::Uninitialized));
        assert_eq!(backend.shutdown(), Err(QueryError::Uninitialized));
    }
}
