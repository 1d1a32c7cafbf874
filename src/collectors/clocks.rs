//! Clock speeds per domain.
//!
//! The envelope of each domain (default applications clock, max, min) is
//! fixed by the board and computed once for all four domains together, so
//! the supported-clock lists are read a single time. Memory and graphics
//! limits come from those lists, reconciled with the boost clocks; SM and
//! video only have boost clocks.

use super::{active, flush_all, Collector};
use crate::buffer::MetricBuffer;
use crate::cache::{StaticFamily, StaticFragment};
use crate::capability::{Family, MaskFamily};
use crate::device::Device;
use crate::exposition::{desc, write_gpu_sample, Section};
use crate::query::{ClockDomain, DeviceHandle, GpuBackend};
use tracing::{debug, warn};

/// Cache slot of each domain, indexed like [`ClockDomain::ALL`].
const DOMAIN_FAMILIES: [StaticFamily; 4] = [
    StaticFamily::ClocksGraphics,
    StaticFamily::ClocksSm,
    StaticFamily::ClocksMem,
    StaticFamily::ClocksVideo,
];

/// Max clock, falling back to the customer boost clock if unset.
fn boost_clock(gpu: &dyn GpuBackend, h: DeviceHandle, domain: ClockDomain) -> Option<u32> {
    match gpu.max_clock(h, domain) {
        Ok(mhz) if mhz != 0 => Some(mhz),
        _ => gpu.max_customer_boost_clock(h, domain).ok().filter(|mhz| *mhz != 0),
    }
}

/// Picks the maximum of a domain from its clock list and boost clock.
fn reconcile_max(
    index: u32,
    domain: ClockDomain,
    listed: Option<u32>,
    boost: Option<u32>,
) -> Option<u32> {
    match (listed, boost) {
        (Some(l), Some(b)) if l != b => {
            warn!(
                gpu = index,
                domain = domain.label(),
                listed = l,
                boost = b,
                "supported clocks disagree with boost clock, using the larger"
            );
            Some(l.max(b))
        }
        (Some(l), _) => Some(l),
        (None, b) => b,
    }
}

fn bounds(list: Option<&Vec<u32>>) -> (Option<u32>, Option<u32>) {
    list.map_or((None, None), |l| (l.iter().max().copied(), l.iter().min().copied()))
}

/// Formats the envelope of every domain.
fn envelope(gpu: &dyn GpuBackend, h: DeviceHandle, index: u32, uuid: &str) -> [StaticFragment; 4] {
    let mem_list = gpu
        .supported_memory_clocks(h)
        .map_err(|e| debug!(gpu = index, error = %e, "supported memory clocks unavailable"))
        .ok();
    let (mem_max, mem_min) = bounds(mem_list.as_ref());
    let gfx_list = mem_max.and_then(|mem| {
        gpu.supported_graphics_clocks(h, mem)
            .map_err(|e| debug!(gpu = index, error = %e, "supported graphics clocks unavailable"))
            .ok()
    });
    let (gfx_max, gfx_min) = bounds(gfx_list.as_ref());

    ClockDomain::ALL.map(|domain| {
        let (listed_max, min) = match domain {
            ClockDomain::Mem => (mem_max, mem_min),
            ClockDomain::Graphics => (gfx_max, gfx_min),
            ClockDomain::Sm | ClockDomain::Video => (None, None),
        };
        let default = gpu.default_applications_clock(h, domain).ok();
        let max = reconcile_max(index, domain, listed_max, boost_clock(gpu, h, domain));

        let mut frag = StaticFragment::default();
        for (value, mhz) in [("default", default), ("max", max), ("min", min)] {
            if let Some(mhz) = mhz {
                write_gpu_sample(
                    &mut frag.text,
                    desc::CLOCK.name,
                    index,
                    uuid,
                    &[("domain", &domain.label()), ("value", &value)],
                    mhz,
                );
                frag.supported += 1;
            }
        }
        frag
    })
}

/// Emits `nvmex_clock_MHz` and `nvmex_clock_throttle_bitmask`.
#[derive(Debug, Default)]
pub struct ClockCollector;

impl Collector for ClockCollector {
    fn id(&self) -> &'static str {
        "clock"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut clock = Section::new(desc::CLOCK);
        let mut throttle = Section::new(desc::CLOCK_THROTTLE);

        for (h, dev) in active(devices) {
            if dev.statics.get(StaticFamily::ClocksGraphics).is_none() {
                let frags = envelope(gpu, h, dev.index, &dev.uuid);
                for (family, frag) in DOMAIN_FAMILIES.into_iter().zip(frags) {
                    dev.statics.get_or_init(family, || frag);
                }
            }

            for domain in ClockDomain::ALL {
                if let Some(frag) = dev.statics.get(DOMAIN_FAMILIES[domain.index()]) {
                    clock.append_raw(&frag.text);
                }
                let now = dev.query_bit(MaskFamily::ClockNow, domain.index(), |h| gpu.clock(h, domain));
                if let Some(mhz) = now {
                    clock.gpu_sample(dev.index, &dev.uuid, &[("domain", &domain.label()), ("value", &"now")], mhz);
                }
                let set = dev.query_bit(MaskFamily::ClockSet, domain.index(), |h| {
                    gpu.applications_clock(h, domain)
                });
                if let Some(mhz) = set {
                    clock.gpu_sample(dev.index, &dev.uuid, &[("domain", &domain.label()), ("value", &"set")], mhz);
                }
            }

            if let Some(mask) = dev.query(Family::ClockThrottle, |h| gpu.throttle_reasons(h)) {
                throttle.gpu_sample(dev.index, &dev.uuid, &[], mask);
            }
        }
        flush_all([clock, throttle], out, compact)
    }
}
