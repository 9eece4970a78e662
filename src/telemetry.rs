//! Normalized treadmill telemetry shared between the client, the FTMS
//! server, and the control facade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::bluetooth::codec::StatsReply;

/// Belt state as reported by the treadmill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BeltState {
    Idle,
    Running,
    Paused,
    Unknown,
}

impl BeltState {
    /// Map the wire byte onto a belt state. `1` (running) and `5` (stopped)
    /// are the values the R-series is known to send; everything unrecognized
    /// is propagated as [`BeltState::Unknown`].
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 | 5 => Self::Idle,
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Unknown,
        }
    }
}

/// Most recent normalized treadmill reading.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub speed_kmh: f64,
    pub distance_m: u32,
    pub elapsed_s: u32,
    pub belt_state: BeltState,
    #[serde(skip)]
    pub updated_at: Instant,
}

impl Telemetry {
    fn from_reply(reply: &StatsReply) -> Self {
        Self {
            speed_kmh: reply.speed_kmh(),
            distance_m: reply.distance_m(),
            elapsed_s: u32::from(reply.elapsed_s),
            belt_state: reply.belt_state,
            updated_at: Instant::now(),
        }
    }

    /// Belt state with `Unknown` resolved for FTMS consumers: running if the
    /// belt is moving, idle otherwise.
    #[must_use]
    pub fn effective_belt_state(&self) -> BeltState {
        match self.belt_state {
            BeltState::Unknown if self.speed_kmh > 0.0 => BeltState::Running,
            BeltState::Unknown => BeltState::Idle,
            other => other,
        }
    }
}

/// Shared telemetry cell: one writer (the client's notification task), any
/// number of readers. Readers always see a whole record, never a torn one.
#[derive(Clone, Default)]
pub struct TelemetryCell {
    inner: Arc<RwLock<Option<Telemetry>>>,
    codec_errors: Arc<AtomicU64>,
}

impl TelemetryCell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Option<Telemetry> {
        self.inner.read().await.clone()
    }

    /// Fold a stats reply into the cell. Distance and elapsed time are
    /// clamped monotonically: duplicate or out-of-order replies within a
    /// session never move the counters backwards.
    pub async fn apply(&self, reply: &StatsReply) {
        let mut guard = self.inner.write().await;
        let next = match guard.as_ref() {
            Some(prev) => Telemetry {
                distance_m: prev.distance_m.max(reply.distance_m()),
                elapsed_s: prev.elapsed_s.max(u32::from(reply.elapsed_s)),
                ..Telemetry::from_reply(reply)
            },
            None => Telemetry::from_reply(reply),
        };
        *guard = Some(next);
    }

    /// Clear the cell for a new connection episode.
    pub async fn reset(&self) {
        *self.inner.write().await = None;
    }

    pub fn record_codec_error(&self) {
        self.codec_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn codec_error_count(&self) -> u64 {
        self.codec_errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::codec::SpeedEncoding;

    fn reply(speed_decikmh: u16, distance_dam: u32, elapsed_s: u16) -> StatsReply {
        StatsReply {
            belt_state: BeltState::Running,
            speed_decikmh,
            distance_dam,
            elapsed_s,
            speed_encoding: SpeedEncoding::Wide,
        }
    }

    #[test]
    fn belt_state_mapping() {
        assert_eq!(BeltState::from_raw(0), BeltState::Idle);
        assert_eq!(BeltState::from_raw(1), BeltState::Running);
        assert_eq!(BeltState::from_raw(2), BeltState::Paused);
        assert_eq!(BeltState::from_raw(5), BeltState::Idle);
        assert_eq!(BeltState::from_raw(9), BeltState::Unknown);
    }

    #[test]
    fn effective_belt_state_resolves_unknown_by_speed() {
        let mut t = Telemetry {
            speed_kmh: 3.0,
            distance_m: 0,
            elapsed_s: 0,
            belt_state: BeltState::Unknown,
            updated_at: Instant::now(),
        };
        assert_eq!(t.effective_belt_state(), BeltState::Running);
        t.speed_kmh = 0.0;
        assert_eq!(t.effective_belt_state(), BeltState::Idle);
        t.belt_state = BeltState::Paused;
        assert_eq!(t.effective_belt_state(), BeltState::Paused);
    }

    #[tokio::test]
    async fn counters_never_decrease_within_a_session() {
        let cell = TelemetryCell::new();
        cell.apply(&reply(30, 120, 60)).await;
        // A stale frame arrives late.
        cell.apply(&reply(28, 100, 55)).await;

        let t = cell.snapshot().await.unwrap();
        assert_eq!(t.distance_m, 1200);
        assert_eq!(t.elapsed_s, 60);
        // Speed is instantaneous, not monotonic.
        assert!((t.speed_kmh - 2.8).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn reset_starts_a_new_session() {
        let cell = TelemetryCell::new();
        cell.apply(&reply(30, 500, 300)).await;
        cell.reset().await;
        assert!(cell.snapshot().await.is_none());

        // After reset the counters may restart from zero.
        cell.apply(&reply(10, 1, 2)).await;
        let t = cell.snapshot().await.unwrap();
        assert_eq!(t.distance_m, 10);
        assert_eq!(t.elapsed_s, 2);
    }

    #[tokio::test]
    async fn codec_error_counter() {
        let cell = TelemetryCell::new();
        assert_eq!(cell.codec_error_count(), 0);
        cell.record_codec_error();
        cell.record_codec_error();
        assert_eq!(cell.codec_error_count(), 2);
    }
}
