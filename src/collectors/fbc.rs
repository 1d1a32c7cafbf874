//! Frame buffer capture statistics and sessions.

use super::scratch::Scratch;
use super::{active, flush_all, Collector};
use crate::buffer::MetricBuffer;
use crate::capability::Family;
use crate::device::Device;
use crate::exposition::{desc, Label, Section};
use crate::query::{FbcSession, GpuBackend};
use tracing::warn;

/// Emits the `nvmex_fbc_stat_*` and `nvmex_fbc_session_*` families.
#[derive(Debug)]
pub struct FbcCollector {
    stats: bool,
    sessions: bool,
    scratch: Scratch<FbcSession>,
}

impl FbcCollector {
    /// Creates the collector with the given parts enabled.
    #[must_use]
    pub fn new(stats: bool, sessions: bool) -> Self {
        Self { stats, sessions, scratch: Scratch::default() }
    }
}

impl Collector for FbcCollector {
    fn id(&self) -> &'static str {
        "fbc"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut sessions = Section::new(desc::FBC_STAT_SESSIONS);
        let mut fps = Section::new(desc::FBC_STAT_FPS);
        let mut latency = Section::new(desc::FBC_STAT_LATENCY);
        let mut session_fps = Section::new(desc::FBC_SESSION_FPS);
        let mut session_latency = Section::new(desc::FBC_SESSION_LATENCY);

        for (_, dev) in active(devices) {
            let Some(stats) = dev.query(Family::FbcStats, |h| gpu.fbc_stats(h)) else {
                continue;
            };
            if self.stats {
                sessions.gpu_sample(dev.index, &dev.uuid, &[], stats.sessions);
                fps.gpu_sample(dev.index, &dev.uuid, &[], stats.average_fps);
                latency.gpu_sample(dev.index, &dev.uuid, &[], stats.average_latency_us);
            }
            if !self.sessions || stats.sessions == 0 {
                continue;
            }

            let list = match self.scratch.ensure(stats.sessions as usize) {
                Ok(list) => list,
                Err(e) => {
                    warn!(
                        gpu = dev.index,
                        sessions = stats.sessions,
                        error = %e,
                        "cannot allocate frame capture session list"
                    );
                    continue;
                }
            };
            if dev.query(Family::FbcSessions, |h| gpu.fbc_sessions(h, &mut *list)).is_none() {
                continue;
            }
            for s in list.iter() {
                let labels: [Label<'_>; 10] = [
                    ("stype", &s.session_type.label()),
                    ("hres", &s.h_resolution),
                    ("hresmax", &s.h_max_resolution),
                    ("vres", &s.v_resolution),
                    ("vresmax", &s.v_max_resolution),
                    ("sid", &s.session_id),
                    ("sflags", &s.session_flags),
                    ("display", &s.display_ordinal),
                    ("pid", &s.pid),
                    ("vgpu", &s.vgpu_instance),
                ];
                session_fps.gpu_sample(dev.index, &dev.uuid, &labels, s.average_fps);
                session_latency.gpu_sample(dev.index, &dev.uuid, &labels, s.average_latency_us);
            }
        }
        flush_all([sessions, fps, latency, session_fps, session_latency], out, compact)
    }
}
