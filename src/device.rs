//! Device handle table.
//!
//! Built once at session start. Every device the driver reports keeps its
//! index for the whole run, including devices whose handle could not be
//! obtained: they stay in the table as disabled placeholders.

use crate::cache::StaticCache;
use crate::capability::{CapabilitySet, Family, MaskFamily};
use crate::error::{ExporterError, Result};
use crate::query::{DeviceHandle, GpuBackend, Outcome, QueryError, QueryResult};
use tracing::{debug, info, warn};

/// Vendor prefixes stripped from UUIDs.
const UUID_PREFIXES: [&str; 2] = ["GPU-", "MIG-"];

/// Returns the UUID without its vendor prefix.
#[must_use]
pub fn canonical_uuid(raw: &str) -> &str {
    UUID_PREFIXES.iter().find_map(|p| raw.strip_prefix(p)).unwrap_or(raw)
}

/// One physical device and its per-process state.
#[derive(Debug)]
pub struct Device {
    /// Position in the table.
    pub index: u32,
    /// UUID without vendor prefix; empty if unknown.
    pub uuid: String,
    /// PCI bus id; empty if unknown.
    pub bus_id: String,
    /// `None` for a disabled placeholder.
    pub handle: Option<DeviceHandle>,
    /// Capability flags.
    pub caps: CapabilitySet,
    /// Static fragments.
    pub statics: StaticCache,
    pub(crate) nvlink_warned: bool,
}

impl Device {
    /// Creates a device record.
    #[must_use]
    pub fn new(index: u32, uuid: &str, bus_id: &str, handle: Option<DeviceHandle>) -> Self {
        Self {
            index,
            uuid: canonical_uuid(uuid).to_string(),
            bus_id: bus_id.to_string(),
            handle,
            caps: CapabilitySet::default(),
            statics: StaticCache::default(),
            nvlink_warned: false,
        }
    }

    /// Whether queries may be issued at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.handle.is_some()
    }

    /// Runs `query` unless `family` is known unsupported, then records the
    /// outcome. Returns the value on success.
    pub fn query<T>(
        &mut self,
        family: Family,
        query: impl FnOnce(DeviceHandle) -> QueryResult<T>,
    ) -> Option<T> {
        let handle = self.handle?;
        if !self.caps.should_query(family) {
            return None;
        }
        self.record(family, query(handle))
    }

    /// Records the outcome of an already issued query of `family`.
    pub fn record<T>(&mut self, family: Family, result: QueryResult<T>) -> Option<T> {
        match result {
            Ok(v) => {
                self.caps.record(family, Outcome::Success);
                Some(v)
            }
            Err(e) => {
                let disabled = self.caps.record(family, e.outcome());
                self.log_failure(family.name(), &e, disabled);
                None
            }
        }
    }

    /// Like [`Device::query`] for member `bit` of a mask family.
    pub fn query_bit<T>(
        &mut self,
        family: MaskFamily,
        bit: usize,
        query: impl FnOnce(DeviceHandle) -> QueryResult<T>,
    ) -> Option<T> {
        let handle = self.handle?;
        if !self.caps.mask(family).should_query_bit(bit) {
            return None;
        }
        match query(handle) {
            Ok(v) => {
                self.caps.mask_mut(family).record(bit, Outcome::Success);
                Some(v)
            }
            Err(e) => {
                let disabled = self.caps.mask_mut(family).record(bit, e.outcome());
                self.log_failure(family.name(), &e, disabled);
                None
            }
        }
    }

    fn log_failure(&self, what: &str, err: &QueryError, disabled: bool) {
        if disabled {
            debug!(gpu = self.index, "{what}: not supported, no longer queried");
        } else {
            debug!(gpu = self.index, error = %err, "{what}: query failed");
        }
    }
}

/// All devices of a session.
#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: Vec<Device>,
}

impl DeviceTable {
    /// Enumerates every device the backend reports.
    ///
    /// Failures to resolve UUID or bus id leave the field empty. A device
    /// without handle is kept as a disabled placeholder.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError::NoDevices`] if the backend reports no device
    /// or cannot be asked.
    pub fn enumerate(gpu: &dyn GpuBackend) -> Result<Self> {
        let count = match gpu.device_count() {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "unable to get the number of GPU devices");
                return Err(ExporterError::NoDevices);
            }
        };
        if count == 0 {
            return Err(ExporterError::NoDevices);
        }

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = match gpu.device_handle(index) {
                Ok(handle) => {
                    let uuid = gpu.uuid(handle).unwrap_or_else(|e| {
                        warn!(gpu = index, error = %e, "unable to get UUID");
                        String::new()
                    });
                    let bus = gpu.bus_id(handle).unwrap_or_else(|e| {
                        warn!(gpu = index, error = %e, "unable to get PCI bus id");
                        String::new()
                    });
                    Device::new(index, &uuid, &bus, Some(handle))
                }
                Err(e) => {
                    warn!(gpu = index, error = %e, "unable to get device handle, device disabled");
                    Device::new(index, "", "", None)
                }
            };
            info!(gpu = index, uuid = %device.uuid, bus = %device.bus_id, "device found");
            devices.push(device);
        }

        Ok(Self { devices })
    }

    /// Consumes the table, returning its records.
    #[cfg(test)]
    pub(crate) fn into_devices(self) -> Vec<Device> {
        self.devices
    }

    /// Number of devices, including placeholders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the table is empty (only after teardown).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// All devices.
    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// All devices, mutable.
    pub fn devices_mut(&mut self) -> &mut [Device] {
        &mut self.devices
    }

    /// Releases handles and fragments. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        for dev in &mut self.devices {
            dev.handle = None;
            dev.statics.clear();
        }
        self.devices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::query::{StubBackend, StubDevice};

    #[test]
    fn test_canonical_uuid() {
        assert_eq!(canonical_uuid("GPU-1234-abcd"), "1234-abcd");
        assert_eq!(canonical_uuid("MIG-99"), "99");
        assert_eq!(canonical_uuid("plain"), "plain");
        assert_eq!(canonical_uuid(""), "");
    }

    #[test]
    fn test_enumerate_keeps_placeholders() {
        let mut backend = StubBackend::new(vec![StubDevice::with_uuid("GPU-a")]);
        backend.devices.push(None);
        backend.devices.push(Some(StubDevice::with_uuid("GPU-c")));

        let table = DeviceTable::enumerate(&backend).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.devices()[0].uuid, "a");
        assert!(!table.devices()[1].is_enabled(), "placeholder must be disabled");
        assert_eq!(table.devices()[1].index, 1);
        assert_eq!(table.devices()[2].uuid, "c");
    }

    #[test]
    fn test_enumerate_missing_identity_is_empty() {
        let backend = StubBackend::new(vec![StubDevice::default()]);
        let table = DeviceTable::enumerate(&backend).unwrap();

        assert!(table.devices()[0].uuid.is_empty());
        assert!(table.devices()[0].bus_id.is_empty());
        assert!(table.devices()[0].is_enabled());
    }

    #[test]
    fn test_enumerate_no_devices() {
        let backend = StubBackend::new(Vec::new());
        let err = DeviceTable::enumerate(&backend).unwrap_err();
        assert!(matches!(err, ExporterError::NoDevices));
    }

    #[test]
    fn test_query_skips_unsupported() {
        let mut dev = Device::new(0, "GPU-x", "", Some(DeviceHandle::new(0)));
        let mut calls = 0;

        for _ in 0..3 {
            let v: Option<u32> = dev.query(Family::Fan, |_| {
                calls += 1;
                Err(QueryError::NotSupported)
            });
            assert!(v.is_none());
        }
        assert_eq!(calls, 1, "unsupported family must not be queried again");
        assert_eq!(dev.caps.get(Family::Fan), Capability::Unsupported);
    }

    #[test]
    fn test_query_retries_transient() {
        let mut dev = Device::new(0, "", "", Some(DeviceHandle::new(0)));

        assert!(dev.query::<u32>(Family::Memory, |_| Err(QueryError::GpuLost)).is_none());
        assert_eq!(dev.caps.get(Family::Memory), Capability::Undetermined);

        assert_eq!(dev.query(Family::Memory, |_| Ok(5u32)), Some(5));
        assert_eq!(dev.caps.get(Family::Memory), Capability::Supported);
    }

    #[test]
    fn test_query_without_handle() {
        let mut dev = Device::new(3, "", "", None);
        let v = dev.query(Family::Fan, |_| -> QueryResult<u32> { unreachable!("no handle") });
        assert!(v.is_none());
    }

    #[test]
    fn test_query_bit() {
        let mut dev = Device::new(0, "", "", Some(DeviceHandle::new(0)));

        assert!(dev.query_bit::<u64>(MaskFamily::Violations, 2, |_| Err(QueryError::NotSupported)).is_none());
        assert!(!dev.caps.violations.should_query_bit(2));
        assert_eq!(dev.query_bit(MaskFamily::Violations, 0, |_| Ok(9u64)), Some(9));
    }

    #[test]
    fn test_teardown_idempotent() {
        let backend = StubBackend::with_full_devices(2);
        let mut table = DeviceTable::enumerate(&backend).unwrap();

        table.teardown();
        table.teardown();
        assert!(table.is_empty());
    }
}
