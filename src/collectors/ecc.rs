//! ECC mode, error counters, retired pages and remapped rows.

use super::{active, flush_all, query_fields, Collector};
use crate::buffer::MetricBuffer;
use crate::capability::Family;
use crate::device::Device;
use crate::exposition::{desc, Section};
use crate::query::{FieldId, GpuBackend, RetirementCause};

/// One ECC error counter field and its labels.
struct EccCounter {
    id: u32,
    kind: &'static str,
    counter: &'static str,
    loc: &'static str,
}

macro_rules! ecc_counters {
    ($($id:literal => $kind:literal $counter:literal $loc:literal),+ $(,)?) => {
        [$(EccCounter { id: $id, kind: $kind, counter: $counter, loc: $loc }),+]
    };
}

/// Field ids `ECC_FIRST..=ECC_LAST`.
const COUNTERS: [EccCounter; 26] = ecc_counters! {
    3 => "sbe" "volatile" "ALL",
    4 => "dbe" "volatile" "ALL",
    5 => "sbe" "persistent" "ALL",
    6 => "dbe" "persistent" "ALL",
    7 => "sbe" "volatile" "L1",
    8 => "dbe" "volatile" "L1",
    9 => "sbe" "volatile" "L2",
    10 => "dbe" "volatile" "L2",
    11 => "sbe" "volatile" "DEV",
    12 => "dbe" "volatile" "DEV",
    13 => "sbe" "volatile" "REG",
    14 => "dbe" "volatile" "REG",
    15 => "sbe" "volatile" "TEX",
    16 => "dbe" "volatile" "TEX",
    17 => "dbe" "volatile" "CBU",
    18 => "sbe" "persistent" "L1",
    19 => "dbe" "persistent" "L1",
    20 => "sbe" "persistent" "L2",
    21 => "dbe" "persistent" "L2",
    22 => "sbe" "persistent" "DEV",
    23 => "dbe" "persistent" "DEV",
    24 => "sbe" "persistent" "REG",
    25 => "dbe" "persistent" "REG",
    26 => "sbe" "persistent" "TEX",
    27 => "dbe" "persistent" "TEX",
    28 => "dbe" "persistent" "CBU",
};

fn counter_ids() -> Vec<FieldId> {
    COUNTERS.iter().map(|c| FieldId(c.id)).collect()
}

/// Emits `nvmex_ecc_mode`, `nvmex_ecc_errors`, `nvmex_ecc_retired_pages`
/// and `nvmex_ecc_remapped_rows`.
///
/// Error counters are only read while ECC is currently enabled.
#[derive(Debug, Default)]
pub struct EccCollector;

impl Collector for EccCollector {
    fn id(&self) -> &'static str {
        "ecc"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut mode = Section::new(desc::ECC_MODE);
        let mut errors = Section::new(desc::ECC_ERRORS);
        let mut retired = Section::new(desc::ECC_RETIRED_PAGES);
        let mut remapped = Section::new(desc::ECC_REMAPPED_ROWS);
        let ids = counter_ids();

        for (_, dev) in active(devices) {
            let ecc = dev.query(Family::EccMode, |h| gpu.ecc_mode(h));
            if let Some(ecc) = ecc {
                mode.gpu_sample(dev.index, &dev.uuid, &[("mode", &"current")], u8::from(ecc.current));
                mode.gpu_sample(dev.index, &dev.uuid, &[("mode", &"pending")], u8::from(ecc.pending));
            }

            if ecc.is_some_and(|e| e.current) {
                if let Some(values) = query_fields(dev, Family::EccErrors, gpu, &ids) {
                    for (c, v) in COUNTERS.iter().zip(values) {
                        let Some(v) = v else {
                            continue;
                        };
                        errors.gpu_sample(
                            dev.index,
                            &dev.uuid,
                            &[("type", &c.kind), ("counter", &c.counter), ("loc", &c.loc)],
                            v,
                        );
                    }
                }
            }

            let sbe = dev.query(Family::RetiredPagesSbe, |h| {
                gpu.retired_pages(h, RetirementCause::MultipleSingleBit)
            });
            if let Some(n) = sbe {
                retired.gpu_sample(dev.index, &dev.uuid, &[("type", &"sbe")], n);
            }
            let dbe = dev.query(Family::RetiredPagesDbe, |h| gpu.retired_pages(h, RetirementCause::DoubleBit));
            if let Some(n) = dbe {
                retired.gpu_sample(dev.index, &dev.uuid, &[("type", &"dbe")], n);
            }
            if let Some(p) = dev.query(Family::RetiredPagesPending, |h| gpu.retired_pages_pending(h)) {
                retired.gpu_sample(dev.index, &dev.uuid, &[("type", &"pending")], u8::from(p));
            }

            if let Some(rows) = dev.query(Family::RemappedRows, |h| gpu.remapped_rows(h)) {
                for (kind, n) in [
                    ("uncorrectable", rows.uncorrectable),
                    ("correctable", rows.correctable),
                    ("pending", u32::from(rows.pending)),
                    ("failure", u32::from(rows.failure)),
                ] {
                    remapped.gpu_sample(dev.index, &dev.uuid, &[("type", &kind)], n);
                }
            }
        }
        flush_all([mode, errors, retired, remapped], out, compact)
    }
}
