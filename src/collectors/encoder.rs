//! Hardware encoder statistics and sessions.

use super::scratch::Scratch;
use super::{active, flush_all, Collector};
use crate::buffer::MetricBuffer;
use crate::capability::Family;
use crate::device::Device;
use crate::exposition::{desc, Label, Section};
use crate::query::{EncoderSession, GpuBackend};
use tracing::warn;

/// Emits the `nvmex_enc_stat_*` and `nvmex_enc_session_*` families.
///
/// Session lines need the aggregate stats for the session count, so stats
/// are queried whenever either part is enabled.
#[derive(Debug)]
pub struct EncoderCollector {
    stats: bool,
    sessions: bool,
    scratch: Scratch<EncoderSession>,
}

impl EncoderCollector {
    /// Creates the collector with the given parts enabled.
    #[must_use]
    pub fn new(stats: bool, sessions: bool) -> Self {
        Self { stats, sessions, scratch: Scratch::default() }
    }
}

impl Collector for EncoderCollector {
    fn id(&self) -> &'static str {
        "encoder"
    }

    fn collect(
        &mut self,
        out: &mut MetricBuffer,
        compact: bool,
        gpu: &dyn GpuBackend,
        devices: &mut [Device],
    ) -> bool {
        let mut sessions = Section::new(desc::ENC_STAT_SESSIONS);
        let mut fps = Section::new(desc::ENC_STAT_FPS);
        let mut latency = Section::new(desc::ENC_STAT_LATENCY);
        let mut session_fps = Section::new(desc::ENC_SESSION_FPS);
        let mut session_latency = Section::new(desc::ENC_SESSION_LATENCY);

        for (_, dev) in active(devices) {
            let Some(stats) = dev.query(Family::EncoderStats, |h| gpu.encoder_stats(h)) else {
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
                        "cannot allocate encoder session list"
                    );
                    continue;
                }
            };
            if dev.query(Family::EncoderSessions, |h| gpu.encoder_sessions(h, &mut *list)).is_none() {
                continue;
            }
            for s in list.iter() {
                let labels: [Label<'_>; 6] = [
                    ("codec", &s.codec.label()),
                    ("hres", &s.h_resolution),
                    ("vres", &s.v_resolution),
                    ("sid", &s.session_id),
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

#[cfg(test)]
mod tests {
    use super::super::testing::{lines_with, run, table};
    use super::*;
    use crate::query::{Codec, CodecStats, QueryError, StubBackend};

    fn busy_backend() -> StubBackend {
        let mut backend = StubBackend::with_full_devices(2);
        let dev = backend.device_mut(0);
        dev.encoder_stats = Ok(CodecStats { sessions: 2, average_fps: 60, average_latency_us: 900 });
        dev.encoder_sessions = Ok(vec![
            EncoderSession {
                session_id: 1,
                pid: 4242,
                codec: Codec::H264,
                h_resolution: 1920,
                v_resolution: 1080,
                average_fps: 60,
                average_latency_us: 800,
                ..EncoderSession::default()
            },
            EncoderSession {
                session_id: 2,
                pid: 4243,
                codec: Codec::Hevc,
                h_resolution: 3840,
                v_resolution: 2160,
                average_fps: 30,
                average_latency_us: 1000,
                ..EncoderSession::default()
            },
        ]);
        backend
    }

    #[test]
    fn test_stats_and_sessions() {
        let backend = busy_backend();
        let mut devices = table(&backend);

        let (any, text) = run(&mut EncoderCollector::new(true, true), &backend, &mut devices, true);
        assert!(any);
        assert_eq!(lines_with(&text, &["nvmex_enc_stat_sessions{"]).len(), 2);
        assert!(lines_with(&text, &["nvmex_enc_stat_fps{gpu=\"0\""])[0].ends_with("} 60"));
        let hevc = lines_with(&text, &["nvmex_enc_session_fps{", "codec=\"hevc\""]);
        assert_eq!(hevc.len(), 1);
        assert!(hevc[0].contains("hres=\"3840\",vres=\"2160\",sid=\"2\",pid=\"4243\",vgpu=\"0\",uuid="));
        assert!(hevc[0].ends_with("} 30"));
        assert_eq!(lines_with(&text, &["nvmex_enc_session_latency_us{"]).len(), 2);
    }

    #[test]
    fn test_sessions_not_listed_when_idle() {
        let backend = busy_backend();
        let mut devices = table(&backend);

        run(&mut EncoderCollector::new(true, true), &backend, &mut devices, true);
        assert_eq!(backend.calls(1, "encoder_sessions"), 0, "device 1 has no sessions");
        assert_eq!(backend.calls(0, "encoder_sessions"), 1);
    }

    #[test]
    fn test_sessions_only() {
        let backend = busy_backend();
        let mut devices = table(&backend);

        let (_, text) = run(&mut EncoderCollector::new(false, true), &backend, &mut devices, false);
        assert!(!text.contains("nvmex_enc_stat_"));
        assert_eq!(lines_with(&text, &["nvmex_enc_session_fps{"]).len(), 2);
    }

    #[test]
    fn test_stats_only() {
        let backend = busy_backend();
        let mut devices = table(&backend);

        let (_, text) = run(&mut EncoderCollector::new(true, false), &backend, &mut devices, false);
        assert!(!text.contains("nvmex_enc_session_"));
        assert_eq!(backend.calls(0, "encoder_sessions"), 0);
    }

    #[test]
    fn test_scratch_reused_across_scrapes() {
        let backend = busy_backend();
        let mut devices = table(&backend);
        let mut collector = EncoderCollector::new(true, true);

        run(&mut collector, &backend, &mut devices, true);
        let cap = collector.scratch.capacity();
        run(&mut collector, &backend, &mut devices, true);
        assert_eq!(collector.scratch.capacity(), cap);
    }

    #[test]
    fn test_session_failure_keeps_stats() {
        let mut backend = busy_backend();
        backend.device_mut(0).encoder_sessions = Err(QueryError::InsufficientSize);
        let mut devices = table(&backend);

        let (_, text) = run(&mut EncoderCollector::new(true, true), &backend, &mut devices, true);
        assert!(!text.contains("nvmex_enc_session_"));
        assert_eq!(lines_with(&text, &["nvmex_enc_stat_sessions{gpu=\"0\""]).len(), 1);
    }
}
