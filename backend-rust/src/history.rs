//! # history
//!
//! Rolling per-vehicle speed window, process-local. Capacity is five
//! samples with FIFO eviction; the rear-end predictor reads the last two
//! to estimate deceleration.

use std::collections::VecDeque;

use dashmap::DashMap;

pub const HISTORY_CAPACITY: usize = 5;

/// How long an idle vehicle's window survives before the sweeper drops it.
const RETENTION_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedPoint {
    pub speed_mps: f64,
    /// Server receive time, epoch milliseconds.
    pub recorded_at_ms: i64,
}

#[derive(Default)]
pub struct SpeedHistory {
    inner: DashMap<String, VecDeque<SpeedPoint>>,
}

impl SpeedHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, id: &str, speed_mps: f64, recorded_at_ms: i64) {
        let mut window = self.inner.entry(id.to_string()).or_default();
        if window.len() == HISTORY_CAPACITY {
            window.pop_front();
        }
        window.push_back(SpeedPoint {
            speed_mps,
            recorded_at_ms,
        });
    }

    /// Oldest-to-newest copy of the vehicle's window.
    pub fn latest(&self, id: &str) -> Vec<SpeedPoint> {
        self.inner
            .get(id)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop windows whose newest sample is past retention.
    pub fn sweep(&self, now_ms: i64) {
        self.inner.retain(|_, w| {
            w.back()
                .map(|p| now_ms - p.recorded_at_ms < RETENTION_MS)
                .unwrap_or(false)
        });
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}
