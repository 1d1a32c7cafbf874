//! Query layer between the collectors and the GPU management library.
//!
//! Every driver call the collectors make goes through [`GpuBackend`]. The
//! trait keeps the engine independent of NVML so it can be driven by the
//! scriptable [`StubBackend`] in tests, and lets the NVML specifics (handle
//! lifetimes, wrapper enums, UUID prefixes) stay in one place.
//!
//! ```text
//! query/
//! ├── mod.rs    # This file - trait, value types, error taxonomy
//! ├── nvml.rs   # nvml-wrapper backend (feature `nvidia`)
//! └── stub.rs   # scripted backend with call counters
//! ```

use thiserror::Error;

#[cfg(feature = "nvidia")]
#[cfg_attr(docsrs, doc(cfg(feature = "nvidia")))]
pub mod nvml;
pub mod stub;

#[cfg(feature = "nvidia")]
pub use self::nvml::NvmlBackend;
pub use self::stub::{StubBackend, StubDevice};

// ============================================================================
// Errors
// ============================================================================

/// Failure reported by a single query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The device or driver does not implement this query.
    #[error("not supported")]
    NotSupported,

    /// The device fell off the bus or otherwise became unreachable.
    #[error("GPU is lost")]
    GpuLost,

    /// The caller lacks the privilege for this query.
    #[error("insufficient permissions")]
    NoPermission,

    /// The supplied buffer was too small for the result.
    #[error("insufficient buffer size")]
    InsufficientSize,

    /// The library is not (or no longer) initialized.
    #[error("library not initialized")]
    Uninitialized,

    /// Any other driver failure.
    #[error("{0}")]
    Driver(String),
}

/// How a query result affects the capability state of its family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The query succeeded.
    Success,
    /// The measurement will never be available on this device.
    Unavailable,
    /// The measurement failed this time and may work on the next scrape.
    Transient,
}

impl QueryError {
    /// Classifies the error for the capability state.
    ///
    /// Only an explicit "not supported" is permanent. A lost device is
    /// retried like any other transient failure.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::NotSupported => Outcome::Unavailable,
            _ => Outcome::Transient,
        }
    }
}

/// Result of a single query.
pub type QueryResult<T> = std::result::Result<T, QueryError>;

// ============================================================================
// Value types
// ============================================================================

/// Opaque reference to one device, issued by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u32);

impl DeviceHandle {
    /// Wraps a backend-specific device reference.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the backend-specific device reference.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Clock domains, in exposition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockDomain {
    /// Graphics engine clock.
    Graphics,
    /// Streaming multiprocessor clock.
    Sm,
    /// Memory clock.
    Mem,
    /// Video encoder/decoder clock.
    Video,
}

impl ClockDomain {
    /// All domains.
    pub const ALL: [ClockDomain; 4] = [Self::Graphics, Self::Sm, Self::Mem, Self::Video];

    /// Label value used in the exposition.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Graphics => "GRAPHICS",
            Self::Sm => "SM",
            Self::Mem => "MEM",
            Self::Video => "VIDEO",
        }
    }

    /// Position in [`ClockDomain::ALL`].
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Temperature thresholds fused into the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemperatureThreshold {
    /// Maximum GPU operating temperature.
    GpuMax,
    /// Temperature at which the GPU starts to slow down.
    Slowdown,
    /// Temperature at which the GPU shuts down.
    Shutdown,
    /// Maximum memory operating temperature.
    MemMax,
}

impl TemperatureThreshold {
    /// All thresholds, in exposition order.
    pub const ALL: [TemperatureThreshold; 4] =
        [Self::GpuMax, Self::Slowdown, Self::Shutdown, Self::MemMax];

    /// `(device, value)` label values.
    #[must_use]
    pub fn labels(self) -> (&'static str, &'static str) {
        match self {
            Self::GpuMax => ("gpu", "max"),
            Self::Slowdown => ("gpu", "slowdown"),
            Self::Shutdown => ("gpu", "shutdown"),
            Self::MemMax => ("mem", "max"),
        }
    }
}

/// Direction of PCIe traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PcieDirection {
    /// Device to host.
    Tx,
    /// Host to device.
    Rx,
}

/// PCIe link attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PcieLinkAttr {
    /// Current link generation.
    Generation,
    /// Maximum link generation.
    MaxGeneration,
    /// Current link width.
    Width,
    /// Maximum link width.
    MaxWidth,
}

impl PcieLinkAttr {
    /// All attributes, in exposition order.
    pub const ALL: [PcieLinkAttr; 4] =
        [Self::Generation, Self::MaxGeneration, Self::Width, Self::MaxWidth];

    /// Label value used in the exposition.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Generation => "Gen",
            Self::MaxGeneration => "maxGen",
            Self::Width => "Width",
            Self::MaxWidth => "maxWidth",
        }
    }
}

/// Performance policies that can hold clocks below their targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PerfPolicy {
    /// Power capping.
    Power,
    /// Thermal capping.
    Thermal,
    /// Boost synchronisation across a group.
    SyncBoost,
    /// Board limit.
    BoardLimit,
    /// Low utilisation.
    LowUtilization,
    /// Board reliability limit.
    Reliability,
    /// Total time below application clocks.
    TotalAppClocks,
    /// Total time below base clocks.
    TotalBaseClocks,
}

impl PerfPolicy {
    /// All policies; the index is the bit in the violation capability mask.
    pub const ALL: [PerfPolicy; 8] = [
        Self::Power,
        Self::Thermal,
        Self::SyncBoost,
        Self::BoardLimit,
        Self::LowUtilization,
        Self::Reliability,
        Self::TotalAppClocks,
        Self::TotalBaseClocks,
    ];

    /// Label value used in the exposition.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Power => "POWER",
            Self::Thermal => "THERMAL",
            Self::SyncBoost => "SYNC_BOOST",
            Self::BoardLimit => "BOARD_LIMIT",
            Self::LowUtilization => "LOW_UTIL",
            Self::Reliability => "RELIABILITY",
            Self::TotalAppClocks => "TOTAL_APP_CLOCKS",
            Self::TotalBaseClocks => "TOTAL_BASE_CLOCKS",
        }
    }
}

/// Why a memory page was retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetirementCause {
    /// Multiple single bit ECC errors.
    MultipleSingleBit,
    /// A double bit ECC error.
    DoubleBit,
}

/// Free/total/used triple in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryUsage {
    /// Unallocated bytes.
    pub free: u64,
    /// Total bytes.
    pub total: u64,
    /// Allocated bytes.
    pub used: u64,
}

/// GPU and memory controller utilisation in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Utilization {
    /// GPU busy percentage.
    pub gpu: u32,
    /// Memory controller busy percentage.
    pub memory: u32,
}

/// Utilisation with the sampling period it was measured over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampledUtilization {
    /// Busy percentage.
    pub percent: u32,
    /// Sampling period in microseconds.
    pub period_us: u32,
}

/// ECC mode of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EccMode {
    /// ECC currently enabled.
    pub current: bool,
    /// ECC enabled after the next reboot.
    pub pending: bool,
}

/// Row remapping counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemappedRows {
    /// Rows remapped for correctable errors.
    pub correctable: u32,
    /// Rows remapped for uncorrectable errors.
    pub uncorrectable: u32,
    /// A remapping is pending.
    pub pending: bool,
    /// A remapping failed.
    pub failure: bool,
}

/// Aggregate statistics of encoder or frame capture sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecStats {
    /// Number of active sessions.
    pub sessions: u32,
    /// Average frames per second across sessions.
    pub average_fps: u32,
    /// Average latency in microseconds.
    pub average_latency_us: u32,
}

/// Video codec of an encoder session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// H.264
    H264,
    /// H.265
    Hevc,
    /// Anything else.
    #[default]
    Unknown,
}

impl Codec {
    /// Label value used in the exposition.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Unknown => "unknown",
        }
    }
}

/// One active encoder session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncoderSession {
    /// Session id.
    pub session_id: u32,
    /// Owning process.
    pub pid: u32,
    /// Owning vGPU instance, 0 if none.
    pub vgpu_instance: u32,
    /// Codec.
    pub codec: Codec,
    /// Horizontal resolution.
    pub h_resolution: u32,
    /// Vertical resolution.
    pub v_resolution: u32,
    /// Moving average frames per second.
    pub average_fps: u32,
    /// Moving average latency in microseconds.
    pub average_latency_us: u32,
}

/// Kind of frame capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FbcSessionType {
    /// Unknown.
    #[default]
    Unknown,
    /// Capture to system memory.
    ToSys,
    /// Capture to CUDA memory.
    Cuda,
    /// Capture to video memory.
    Vid,
    /// Capture into the hardware encoder.
    HwEnc,
}

impl FbcSessionType {
    /// Label value used in the exposition.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::ToSys => "tosys",
            Self::Cuda => "cuda",
            Self::Vid => "vid",
            Self::HwEnc => "hwenc",
        }
    }
}

/// One active frame capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FbcSession {
    /// Session id.
    pub session_id: u32,
    /// Owning process.
    pub pid: u32,
    /// Owning vGPU instance, 0 if none.
    pub vgpu_instance: u32,
    /// Display the session captures.
    pub display_ordinal: u32,
    /// Session kind.
    pub session_type: FbcSessionType,
    /// Raw session flags.
    pub session_flags: u32,
    /// Maximum horizontal resolution.
    pub h_max_resolution: u32,
    /// Maximum vertical resolution.
    pub v_max_resolution: u32,
    /// Horizontal resolution.
    pub h_resolution: u32,
    /// Vertical resolution.
    pub v_resolution: u32,
    /// Moving average frames per second.
    pub average_fps: u32,
    /// Moving average latency in microseconds.
    pub average_latency_us: u32,
}

/// Identifier of a generic field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

/// Field identifiers used by the collectors (values from `nvml.h`).
pub mod fields {
    use super::FieldId;

    /// First ECC error counter (`NVML_FI_DEV_ECC_CURRENT`+1 ... total SBE volatile).
    pub const ECC_FIRST: u32 = 3;
    /// Last ECC error counter (DBE aggregate CBU).
    pub const ECC_LAST: u32 = 28;
    /// NVLink flow control CRC errors, all lanes.
    pub const NVLINK_CRC_FLIT_ERROR_TOTAL: FieldId = FieldId(38);
    /// NVLink data CRC errors, all lanes.
    pub const NVLINK_CRC_DATA_ERROR_TOTAL: FieldId = FieldId(45);
    /// NVLink replay errors, all lanes.
    pub const NVLINK_REPLAY_ERROR_TOTAL: FieldId = FieldId(52);
    /// NVLink recovery errors, all lanes.
    pub const NVLINK_RECOVERY_ERROR_TOTAL: FieldId = FieldId(59);
    /// Memory temperature.
    pub const MEMORY_TEMP: FieldId = FieldId(82);
    /// Common NVLink speed of active links in MB/s.
    pub const NVLINK_SPEED_MBPS_COMMON: FieldId = FieldId(90);
    /// Number of NVLinks present.
    pub const NVLINK_LINK_COUNT: FieldId = FieldId(91);
    /// NVLink data TX in KiB.
    pub const NVLINK_THROUGHPUT_DATA_TX: FieldId = FieldId(138);
    /// NVLink data RX in KiB.
    pub const NVLINK_THROUGHPUT_DATA_RX: FieldId = FieldId(139);
    /// NVLink data + protocol TX in KiB.
    pub const NVLINK_THROUGHPUT_RAW_TX: FieldId = FieldId(140);
    /// NVLink data + protocol RX in KiB.
    pub const NVLINK_THROUGHPUT_RAW_RX: FieldId = FieldId(141);
}

// ============================================================================
// Backend trait
// ============================================================================

/// Driver queries the collectors issue.
///
/// Implementations must return quickly; there is no timeout layer above.
/// Session enumeration fills a caller-owned vector so that the caller decides
/// about allocation and reuse.
pub trait GpuBackend: Send {
    // -- system -------------------------------------------------------------

    /// Number of devices, including ones the caller may not query further.
    fn device_count(&self) -> QueryResult<u32>;
    /// Handle of the device at `index`.
    fn device_handle(&self, index: u32) -> QueryResult<DeviceHandle>;
    /// Kernel module version.
    fn driver_version(&self) -> QueryResult<String>;
    /// Management library version.
    fn nvml_version(&self) -> QueryResult<String>;
    /// CUDA driver version as `major * 1000 + minor * 10 + patch`.
    fn cuda_driver_version(&self) -> QueryResult<i32>;
    /// Releases the library. Further queries fail with `Uninitialized`.
    fn shutdown(&mut self) -> QueryResult<()>;

    // -- identity -----------------------------------------------------------

    /// Raw UUID, possibly with a vendor prefix.
    fn uuid(&self, dev: DeviceHandle) -> QueryResult<String>;
    /// PCI bus id.
    fn bus_id(&self, dev: DeviceHandle) -> QueryResult<String>;
    /// Product name.
    fn name(&self, dev: DeviceHandle) -> QueryResult<String>;

    // -- clocks -------------------------------------------------------------

    /// Current clock in MHz.
    fn clock(&self, dev: DeviceHandle, domain: ClockDomain) -> QueryResult<u32>;
    /// Applications clock in MHz.
    fn applications_clock(&self, dev: DeviceHandle, domain: ClockDomain) -> QueryResult<u32>;
    /// Default applications clock in MHz.
    fn default_applications_clock(&self, dev: DeviceHandle, domain: ClockDomain)
        -> QueryResult<u32>;
    /// Maximum clock in MHz.
    fn max_clock(&self, dev: DeviceHandle, domain: ClockDomain) -> QueryResult<u32>;
    /// Customer defined maximum boost clock in MHz.
    fn max_customer_boost_clock(&self, dev: DeviceHandle, domain: ClockDomain)
        -> QueryResult<u32>;
    /// Supported memory clocks in MHz, as ordered by the driver.
    fn supported_memory_clocks(&self, dev: DeviceHandle) -> QueryResult<Vec<u32>>;
    /// Supported graphics clocks for the given memory clock.
    fn supported_graphics_clocks(&self, dev: DeviceHandle, mem_mhz: u32)
        -> QueryResult<Vec<u32>>;
    /// Current clock throttle reasons bitmask.
    fn throttle_reasons(&self, dev: DeviceHandle) -> QueryResult<u64>;

    // -- memory -------------------------------------------------------------

    /// Device memory.
    fn memory(&self, dev: DeviceHandle) -> QueryResult<MemoryUsage>;
    /// BAR1 memory.
    fn bar1_memory(&self, dev: DeviceHandle) -> QueryResult<MemoryUsage>;

    // -- temperature --------------------------------------------------------

    /// GPU core temperature in °C.
    fn temperature(&self, dev: DeviceHandle) -> QueryResult<u32>;
    /// A temperature threshold in °C.
    fn temperature_threshold(&self, dev: DeviceHandle, threshold: TemperatureThreshold)
        -> QueryResult<u32>;
    /// Generic field values; the outer error fails the whole request.
    fn field_values(&self, dev: DeviceHandle, ids: &[FieldId])
        -> QueryResult<Vec<QueryResult<u64>>>;

    // -- power --------------------------------------------------------------

    /// Energy in mJ since the driver was last loaded.
    fn total_energy_consumption(&self, dev: DeviceHandle) -> QueryResult<u64>;
    /// Performance state, 0 (max) .. 15 (min).
    fn performance_state(&self, dev: DeviceHandle) -> QueryResult<u32>;
    /// Power draw in mW.
    fn power_usage(&self, dev: DeviceHandle) -> QueryResult<u32>;
    /// Enforced power limit in mW.
    fn enforced_power_limit(&self, dev: DeviceHandle) -> QueryResult<u32>;
    /// Power management limit in mW.
    fn power_management_limit(&self, dev: DeviceHandle) -> QueryResult<u32>;
    /// Default power management limit in mW.
    fn power_management_default_limit(&self, dev: DeviceHandle) -> QueryResult<u32>;
    /// `(min, max)` power management limit constraints in mW.
    fn power_limit_constraints(&self, dev: DeviceHandle) -> QueryResult<(u32, u32)>;

    // -- fan / utilization --------------------------------------------------

    /// Intended fan speed in percent.
    fn fan_speed(&self, dev: DeviceHandle) -> QueryResult<u32>;
    /// GPU and memory utilisation.
    fn utilization(&self, dev: DeviceHandle) -> QueryResult<Utilization>;
    /// Encoder utilisation.
    fn encoder_utilization(&self, dev: DeviceHandle) -> QueryResult<SampledUtilization>;
    /// Decoder utilisation.
    fn decoder_utilization(&self, dev: DeviceHandle) -> QueryResult<SampledUtilization>;

    // -- pcie ---------------------------------------------------------------

    /// PCIe throughput in KB/s.
    fn pcie_throughput(&self, dev: DeviceHandle, direction: PcieDirection) -> QueryResult<u32>;
    /// PCIe replay counter.
    fn pcie_replay_counter(&self, dev: DeviceHandle) -> QueryResult<u32>;
    /// PCIe link generation or width.
    fn pcie_link(&self, dev: DeviceHandle, attr: PcieLinkAttr) -> QueryResult<u32>;

    // -- violations / ecc ---------------------------------------------------

    /// Violation time of a policy in nanoseconds.
    fn violation_time(&self, dev: DeviceHandle, policy: PerfPolicy) -> QueryResult<u64>;
    /// ECC mode.
    fn ecc_mode(&self, dev: DeviceHandle) -> QueryResult<EccMode>;
    /// Number of pages retired for a cause.
    fn retired_pages(&self, dev: DeviceHandle, cause: RetirementCause) -> QueryResult<u32>;
    /// Pages are pending retirement.
    fn retired_pages_pending(&self, dev: DeviceHandle) -> QueryResult<bool>;
    /// Row remapping counters.
    fn remapped_rows(&self, dev: DeviceHandle) -> QueryResult<RemappedRows>;

    // -- encoder / frame capture --------------------------------------------

    /// Encoder statistics.
    fn encoder_stats(&self, dev: DeviceHandle) -> QueryResult<CodecStats>;
    /// Active encoder sessions; `out` is cleared and refilled.
    fn encoder_sessions(&self, dev: DeviceHandle, out: &mut Vec<EncoderSession>)
        -> QueryResult<()>;
    /// Frame capture statistics.
    fn fbc_stats(&self, dev: DeviceHandle) -> QueryResult<CodecStats>;
    /// Active frame capture sessions; `out` is cleared and refilled.
    fn fbc_sessions(&self, dev: DeviceHandle, out: &mut Vec<FbcSession>) -> QueryResult<()>;
}
