//! NVLink topology, traffic and error counters.
//!
//! Link count and common speed are read once. Devices without links are
//! skipped entirely afterwards.

use super::{active, flush_all, Collector};
use crate::buffer::MetricBuffer;
use crate::cache::{StaticFamily, StaticFragment};
use crate::capability::Family;
use crate::device::Device;
use crate::exposition::{desc, write_gpu_sample, Section};
use crate::query::{fields, DeviceHandle, FieldId, GpuBackend, QueryError};
use tracing::{debug, warn};

const ERRORS: [(FieldId, &str); 4] = [
    (fields::NVLINK_CRC_FLIT_ERROR_TOTAL, "crc-flow-control"),
    (fields::NVLINK_CRC_DATA_ERROR_TOTAL, "crc-data"),
    (fields::NVLINK_REPLAY_ERROR_TOTAL, "replay"),
    (fields::NVLINK_RECOVERY_ERROR_TOTAL, "recovery"),
];

/// KiB counters: `(field, type, value)`.
const TRAFFIC: [(FieldId, &str, &str); 4] = [
    (fields::NVLINK_THROUGHPUT_DATA_TX, "data", "tx"),
    (fields::NVLINK_THROUGHPUT_DATA_RX, "data", "rx"),
    (fields::NVLINK_THROUGHPUT_RAW_TX, "raw", "tx"),
    (fields::NVLINK_THROUGHPUT_RAW_RX, "raw", "rx"),
];

/// Formats link count and bandwidth. The count fragment is only supported
/// when the device has at least one link.
fn topology(gpu: &dyn GpuBackend, h: DeviceHandle, index: u32, uuid: &str) -> (StaticFragment, StaticFragment) {
    let ids = [fields::NVLINK_LINK_COUNT, fields::NVLINK_SPEED_MBPS_COMMON];
    let (count, speed) = match gpu.field_values(h, &ids) {
        Ok(v) => (
            v.first().and_then(|r| r.as_ref().ok().copied()).unwrap_or(0),
            v.get(1).and_then(|r| r.as_ref().ok().copied()).unwrap_or(0),
        ),
        Err(e) => {
            debug!(gpu = index, error = %e, "NVLink topology unavailable");
            (0, 0)
        }
    };

    let mut links = StaticFragment::default();
    let mut bandwidth = StaticFragment::default();
    if count > 0 {
        write_gpu_sample(&mut links.text, desc::NVLINK_LINKS.name, index, uuid, &[], count);
        links.supported = 1;
        if speed > 0 {
            write_gpu_sample(&mut bandwidth.text, desc::NVLINK_BANDWIDTH.name, index, uuid, &[], speed);
            bandwidth.supported = 1;
        }
    }
    (links, bandwidth)
}

/// Reads `ids` as `family`, warning once per device about missing privileges.
fn counters(dev: &mut Device, family: Family, gpu: &dyn GpuBackend, ids: &[FieldId]) -> Option<Vec<Option<u64>>> {
    let mut denied = false;
    let values = dev.query(family, |h| {
        let values = gpu.field_values(h, ids)?;
        if values.iter().any(Result::is_ok) {
            return Ok(values);
        }
        let err = values.into_iter().find_map(Result::err).unwrap_or(QueryError::NotSupported);
        denied = err == QueryError::NoPermission;
        Err(err)
    });
    if denied && !dev.nvlink_warned {
        warn!(gpu = dev.index, "no permission to read NVLink counters");
        dev.nvlink_warned = true;
    }
    Some(values?.into_iter().map(Result::ok).collect())
}

/// Emits the `nvmex_nvlink_*` families.
#[derive(Debug, Default)]
pub struct NvLinkCollector;

impl Collector for NvLinkCollector {
    fn id(&self) -> &'static str {
        "nvlink"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut links = Section::new(desc::NVLINK_LINKS);
        let mut bandwidth = Section::new(desc::NVLINK_BANDWIDTH);
        let mut traffic = Section::new(desc::NVLINK_TRAFFIC);
        let mut errors = Section::new(desc::NVLINK_ERRORS);
        let error_ids = ERRORS.map(|(id, _)| id);
        let traffic_ids = TRAFFIC.map(|(id, _, _)| id);

        for (h, dev) in active(devices) {
            if dev.statics.get(StaticFamily::NvLinkCount).is_none() {
                let (count, speed) = topology(gpu, h, dev.index, &dev.uuid);
                dev.statics.get_or_init(StaticFamily::NvLinkCount, || count);
                dev.statics.get_or_init(StaticFamily::NvLinkBandwidth, || speed);
            }
            match dev.statics.get(StaticFamily::NvLinkCount) {
                Some(frag) if frag.is_supported() => links.append_raw(&frag.text),
                _ => continue,
            }
            if let Some(frag) = dev.statics.get(StaticFamily::NvLinkBandwidth) {
                bandwidth.append_raw(&frag.text);
            }

            if let Some(values) = counters(dev, Family::NvLinkTraffic, gpu, &traffic_ids) {
                for ((_, kind, direction), v) in TRAFFIC.iter().zip(values) {
                    if let Some(kib) = v {
                        traffic.gpu_sample(
                            dev.index,
                            &dev.uuid,
                            &[("link", &"all"), ("type", kind), ("value", direction)],
                            kib << 10,
                        );
                    }
                }
            }
            if let Some(values) = counters(dev, Family::NvLinkErrors, gpu, &error_ids) {
                for ((_, kind), v) in ERRORS.iter().zip(values) {
                    if let Some(n) = v {
                        errors.gpu_sample(dev.index, &dev.uuid, &[("type", kind)], n);
                    }
                }
            }
        }
        flush_all([links, bandwidth, traffic, errors], out, compact)
    }
}
