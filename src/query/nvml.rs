//! NVML backend built on `nvml-wrapper`.
//!
//! The wrapper's `Device` borrows the library handle, so devices are looked
//! up by index on every call instead of being stored. `device_by_index` is a
//! table lookup inside the driver.

use super::{
    ClockDomain, Codec, CodecStats, DeviceHandle, EccMode, EncoderSession, FbcSession,
    FbcSessionType, FieldId, GpuBackend, MemoryUsage, PcieDirection, PcieLinkAttr, PerfPolicy,
    QueryError, QueryResult, RemappedRows, RetirementCause, SampledUtilization,
    TemperatureThreshold, Utilization,
};
use nvml_wrapper::enum_wrappers::device::{
    Clock, EncoderType, FbcSessionType as NvFbcSessionType, PcieUtilCounter, PerformancePolicy,
    PerformanceState, RetirementCause as NvRetirementCause, TemperatureSensor,
    TemperatureThreshold as NvThreshold,
};
use nvml_wrapper::enums::device::SampleValue;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::structs::device::FieldId as NvFieldId;
use nvml_wrapper::{Device, Nvml};
use tracing::{debug, info};

impl From<NvmlError> for QueryError {
    fn from(e: NvmlError) -> Self {
        match e {
            NvmlError::NotSupported => Self::NotSupported,
            NvmlError::GpuLost => Self::GpuLost,
            NvmlError::NoPermission => Self::NoPermission,
            NvmlError::InsufficientSize(_) => Self::InsufficientSize,
            NvmlError::Uninitialized => Self::Uninitialized,
            other => Self::Driver(other.to_string()),
        }
    }
}

fn clock(domain: ClockDomain) -> Clock {
    match domain {
        ClockDomain::Graphics => Clock::Graphics,
        ClockDomain::Sm => Clock::SM,
        ClockDomain::Mem => Clock::Memory,
        ClockDomain::Video => Clock::Video,
    }
}

fn policy(policy: PerfPolicy) -> PerformancePolicy {
    match policy {
        PerfPolicy::Power => PerformancePolicy::Power,
        PerfPolicy::Thermal => PerformancePolicy::Thermal,
        PerfPolicy::SyncBoost => PerformancePolicy::SyncBoost,
        PerfPolicy::BoardLimit => PerformancePolicy::BoardLimit,
        PerfPolicy::LowUtilization => PerformancePolicy::LowUtilization,
        PerfPolicy::Reliability => PerformancePolicy::Reliability,
        PerfPolicy::TotalAppClocks => PerformancePolicy::TotalAppClocks,
        PerfPolicy::TotalBaseClocks => PerformancePolicy::TotalBaseClocks,
    }
}

fn pstate(state: PerformanceState) -> QueryResult<u32> {
    Ok(match state {
        PerformanceState::Zero => 0,
        PerformanceState::One => 1,
        PerformanceState::Two => 2,
        PerformanceState::Three => 3,
        PerformanceState::Four => 4,
        PerformanceState::Five => 5,
        PerformanceState::Six => 6,
        PerformanceState::Seven => 7,
        PerformanceState::Eight => 8,
        PerformanceState::Nine => 9,
        PerformanceState::Ten => 10,
        PerformanceState::Eleven => 11,
        PerformanceState::Twelve => 12,
        PerformanceState::Thirteen => 13,
        PerformanceState::Fourteen => 14,
        PerformanceState::Fifteen => 15,
        PerformanceState::Unknown => return Err(QueryError::NotSupported),
    })
}

fn sample_u64(value: SampleValue) -> QueryResult<u64> {
    match value {
        SampleValue::U32(v) => Ok(u64::from(v)),
        SampleValue::U64(v) => Ok(v),
        SampleValue::I64(v) => u64::try_from(v).map_err(|e| QueryError::Driver(e.to_string())),
        SampleValue::F64(v) if v >= 0.0 => Ok(v as u64),
        SampleValue::F64(v) => Err(QueryError::Driver(format!("negative field value {v}"))),
    }
}

/// Backend talking to the installed NVIDIA driver.
pub struct NvmlBackend {
    nvml: Option<Nvml>,
}

impl std::fmt::Debug for NvmlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmlBackend").field("initialized", &self.nvml.is_some()).finish()
    }
}

impl NvmlBackend {
    /// Loads and initializes the management library.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ExporterError::BackendInit`] if the library is
    /// missing or refuses to initialize.
    pub fn init() -> crate::Result<Self> {
        let nvml = Nvml::init().map_err(|e| crate::ExporterError::BackendInit(e.to_string()))?;
        info!("GPU management library initialized");
        Ok(Self { nvml: Some(nvml) })
    }

    fn lib(&self) -> QueryResult<&Nvml> {
        self.nvml.as_ref().ok_or(QueryError::Uninitialized)
    }

    fn device(&self, dev: DeviceHandle) -> QueryResult<Device<'_>> {
        Ok(self.lib()?.device_by_index(dev.raw())?)
    }
}

impl GpuBackend for NvmlBackend {
    fn device_count(&self) -> QueryResult<u32> {
        Ok(self.lib()?.device_count()?)
    }

    fn device_handle(&self, index: u32) -> QueryResult<DeviceHandle> {
        self.lib()?.device_by_index(index)?;
        Ok(DeviceHandle::new(index))
    }

    fn driver_version(&self) -> QueryResult<String> {
        Ok(self.lib()?.sys_driver_version()?)
    }

    fn nvml_version(&self) -> QueryResult<String> {
        Ok(self.lib()?.sys_nvml_version()?)
    }

    fn cuda_driver_version(&self) -> QueryResult<i32> {
        Ok(self.lib()?.sys_cuda_driver_version()?)
    }

    fn shutdown(&mut self) -> QueryResult<()> {
        match self.nvml.take() {
            Some(nvml) => Ok(nvml.shutdown()?),
            None => {
                debug!("GPU management library already shut down");
                Ok(())
            }
        }
    }

    fn uuid(&self, dev: DeviceHandle) -> QueryResult<String> {
        Ok(self.device(dev)?.uuid()?)
    }

    fn bus_id(&self, dev: DeviceHandle) -> QueryResult<String> {
        Ok(self.device(dev)?.pci_info()?.bus_id)
    }

    fn name(&self, dev: DeviceHandle) -> QueryResult<String> {
        Ok(self.device(dev)?.name()?)
    }

    fn clock(&self, dev: DeviceHandle, domain: ClockDomain) -> QueryResult<u32> {
        Ok(self.device(dev)?.clock_info(clock(domain))?)
    }

    fn applications_clock(&self, dev: DeviceHandle, domain: ClockDomain) -> QueryResult<u32> {
        Ok(self.device(dev)?.applications_clock(clock(domain))?)
    }

    fn default_applications_clock(
        &self,
        dev: DeviceHandle,
        domain: ClockDomain,
    ) -> QueryResult<u32> {
        Ok(self.device(dev)?.default_applications_clock(clock(domain))?)
    }

    fn max_clock(&self, dev: DeviceHandle, domain: ClockDomain) -> QueryResult<u32> {
        Ok(self.device(dev)?.max_clock_info(clock(domain))?)
    }

    fn max_customer_boost_clock(
        &self,
        dev: DeviceHandle,
        domain: ClockDomain,
    ) -> QueryResult<u32> {
        Ok(self.device(dev)?.max_customer_boost_clock(clock(domain))?)
    }

    fn supported_memory_clocks(&self, dev: DeviceHandle) -> QueryResult<Vec<u32>> {
        Ok(self.device(dev)?.supported_memory_clocks()?)
    }

    fn supported_graphics_clocks(&self, dev: DeviceHandle, mem_mhz: u32) -> QueryResult<Vec<u32>> {
        Ok(self.device(dev)?.supported_graphics_clocks(mem_mhz)?)
    }

    fn throttle_reasons(&self, dev: DeviceHandle) -> QueryResult<u64> {
        Ok(self.device(dev)?.current_throttle_reasons()?.bits())
    }

    fn memory(&self, dev: DeviceHandle) -> QueryResult<MemoryUsage> {
        let m = self.device(dev)?.memory_info()?;
        Ok(MemoryUsage { free: m.free, total: m.total, used: m.used })
    }

    fn bar1_memory(&self, dev: DeviceHandle) -> QueryResult<MemoryUsage> {
        let m = self.device(dev)?.bar1_memory_info()?;
        Ok(MemoryUsage { free: m.free, total: m.total, used: m.used })
    }

    fn temperature(&self, dev: DeviceHandle) -> QueryResult<u32> {
        Ok(self.device(dev)?.temperature(TemperatureSensor::Gpu)?)
    }

    fn temperature_threshold(
        &self,
        dev: DeviceHandle,
        threshold: TemperatureThreshold,
    ) -> QueryResult<u32> {
        let t = match threshold {
            TemperatureThreshold::GpuMax => NvThreshold::GpuMax,
            TemperatureThreshold::Slowdown => NvThreshold::Slowdown,
            TemperatureThreshold::Shutdown => NvThreshold::Shutdown,
            TemperatureThreshold::MemMax => NvThreshold::MemoryMax,
        };
        Ok(self.device(dev)?.temperature_threshold(t)?)
    }

    fn field_values(
        &self,
        dev: DeviceHandle,
        ids: &[FieldId],
    ) -> QueryResult<Vec<QueryResult<u64>>> {
        let request: Vec<NvFieldId> = ids.iter().map(|id| NvFieldId(id.0)).collect();
        let samples = self.device(dev)?.field_values_for(&request)?;
        Ok(samples
            .into_iter()
            .map(|sample| {
                let sample = sample?;
                sample_u64(sample.value?)
            })
            .collect())
    }

    fn total_energy_consumption(&self, dev: DeviceHandle) -> QueryResult<u64> {
        Ok(self.device(dev)?.total_energy_consumption()?)
    }

    fn performance_state(&self, dev: DeviceHandle) -> QueryResult<u32> {
        pstate(self.device(dev)?.performance_state()?)
    }

    fn power_usage(&self, dev: DeviceHandle) -> QueryResult<u32> {
        Ok(self.device(dev)?.power_usage()?)
    }

    fn enforced_power_limit(&self, dev: DeviceHandle) -> QueryResult<u32> {
        Ok(self.device(dev)?.enforced_power_limit()?)
    }

    fn power_management_limit(&self, dev: DeviceHandle) -> QueryResult<u32> {
        Ok(self.device(dev)?.power_management_limit()?)
    }

    fn power_management_default_limit(&self, dev: DeviceHandle) -> QueryResult<u32> {
        Ok(self.device(dev)?.power_management_limit_default()?)
    }

    fn power_limit_constraints(&self, dev: DeviceHandle) -> QueryResult<(u32, u32)> {
        let c = self.device(dev)?.power_management_limit_constraints()?;
        Ok((c.min_limit, c.max_limit))
    }

    fn fan_speed(&self, dev: DeviceHandle) -> QueryResult<u32> {
        Ok(self.device(dev)?.fan_speed(0)?)
    }

    fn utilization(&self, dev: DeviceHandle) -> QueryResult<Utilization> {
        let u = self.device(dev)?.utilization_rates()?;
        Ok(Utilization { gpu: u.gpu, memory: u.memory })
    }

    fn encoder_utilization(&self, dev: DeviceHandle) -> QueryResult<SampledUtilization> {
        let u = self.device(dev)?.encoder_utilization()?;
        Ok(SampledUtilization { percent: u.utilization, period_us: u.sampling_period })
    }

    fn decoder_utilization(&self, dev: DeviceHandle) -> QueryResult<SampledUtilization> {
        let u = self.device(dev)?.decoder_utilization()?;
        Ok(SampledUtilization { percent: u.utilization, period_us: u.sampling_period })
    }

    fn pcie_throughput(&self, dev: DeviceHandle, direction: PcieDirection) -> QueryResult<u32> {
        let counter = match direction {
            PcieDirection::Tx => PcieUtilCounter::Send,
            PcieDirection::Rx => PcieUtilCounter::Receive,
        };
        Ok(self.device(dev)?.pcie_throughput(counter)?)
    }

    fn pcie_replay_counter(&self, dev: DeviceHandle) -> QueryResult<u32> {
        Ok(self.device(dev)?.pcie_replay_counter()?)
    }

    fn pcie_link(&self, dev: DeviceHandle, attr: PcieLinkAttr) -> QueryResult<u32> {
        let device = self.device(dev)?;
        Ok(match attr {
            PcieLinkAttr::Generation => device.current_pcie_link_gen()?,
            PcieLinkAttr::MaxGeneration => device.max_pcie_link_gen()?,
            PcieLinkAttr::Width => device.current_pcie_link_width()?,
            PcieLinkAttr::MaxWidth => device.max_pcie_link_width()?,
        })
    }

    fn violation_time(&self, dev: DeviceHandle, p: PerfPolicy) -> QueryResult<u64> {
        Ok(self.device(dev)?.violation_status(policy(p))?.violation_time)
    }

    fn ecc_mode(&self, dev: DeviceHandle) -> QueryResult<EccMode> {
        let state = self.device(dev)?.is_ecc_enabled()?;
        Ok(EccMode { current: state.currently_enabled, pending: state.pending_enabled })
    }

    fn retired_pages(&self, dev: DeviceHandle, cause: RetirementCause) -> QueryResult<u32> {
        let cause = match cause {
            RetirementCause::MultipleSingleBit => NvRetirementCause::MultipleSingleBitEccErrors,
            RetirementCause::DoubleBit => NvRetirementCause::DoubleBitEccError,
        };
        let pages = self.device(dev)?.retired_pages(cause)?;
        u32::try_from(pages.len()).map_err(|e| QueryError::Driver(e.to_string()))
    }

    fn retired_pages_pending(&self, dev: DeviceHandle) -> QueryResult<bool> {
        Ok(self.device(dev)?.are_pages_pending_retired()?)
    }

    fn remapped_rows(&self, dev: DeviceHandle) -> QueryResult<RemappedRows> {
        let rows = self.device(dev)?.remapped_rows()?;
        Ok(RemappedRows {
            correctable: rows.corr_rows,
            uncorrectable: rows.unc_rows,
            pending: rows.is_pending,
            failure: rows.failure_occurred,
        })
    }

    fn encoder_stats(&self, dev: DeviceHandle) -> QueryResult<CodecStats> {
        let s = self.device(dev)?.encoder_stats()?;
        Ok(CodecStats {
            sessions: s.session_count,
            average_fps: s.average_fps,
            average_latency_us: s.average_latency,
        })
    }

    fn encoder_sessions(
        &self,
        dev: DeviceHandle,
        out: &mut Vec<EncoderSession>,
    ) -> QueryResult<()> {
        let sessions = self.device(dev)?.encoder_sessions()?;
        out.clear();
        out.extend(sessions.into_iter().map(|s| EncoderSession {
            session_id: s.session_id,
            pid: s.pid,
            vgpu_instance: s.vgpu_instance.unwrap_or(0),
            codec: match s.codec_type {
                EncoderType::H264 => Codec::H264,
                EncoderType::HEVC => Codec::Hevc,
                #[allow(unreachable_patterns)]
                _ => Codec::Unknown,
            },
            h_resolution: s.hres,
            v_resolution: s.vres,
            average_fps: s.average_fps,
            average_latency_us: s.average_latency,
        }));
        Ok(())
    }

    fn fbc_stats(&self, dev: DeviceHandle) -> QueryResult<CodecStats> {
        let s = self.device(dev)?.fbc_stats()?;
        Ok(CodecStats {
            sessions: s.sessions_count,
            average_fps: s.average_fps,
            average_latency_us: s.average_latency,
        })
    }

    fn fbc_sessions(&self, dev: DeviceHandle, out: &mut Vec<FbcSession>) -> QueryResult<()> {
        let sessions = self.device(dev)?.fbc_sessions_info()?;
        out.clear();
        out.extend(sessions.into_iter().map(|s| FbcSession {
            session_id: s.session_id,
            pid: s.pid,
            vgpu_instance: s.vgpu_instance.unwrap_or(0),
            display_ordinal: s.display_ordinal,
            session_type: match s.session_type {
                NvFbcSessionType::ToSys => FbcSessionType::ToSys,
                NvFbcSessionType::Cuda => FbcSessionType::Cuda,
                NvFbcSessionType::Vid => FbcSessionType::Vid,
                NvFbcSessionType::HwEnc => FbcSessionType::HwEnc,
                _ => FbcSessionType::Unknown,
            },
            session_flags: s.session_flags.bits(),
            h_max_resolution: s.hres_max,
            v_max_resolution: s.vres_max,
            h_resolution: s.hres,
            v_resolution: s.vres,
            average_fps: s.average_fps,
            average_latency_us: s.average_latency,
        }));
        Ok(())
    }
}

impl Drop for NvmlBackend {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            debug!(error = %e, "GPU management library shutdown on drop failed");
        }
    }
}
