use std::time::Duration;

use serde::{Deserialize, Serialize};
use voxelcore_common::BlockKey;

use crate::scheduler::Action;

/// Streaming configuration: radii, per-tick budgets, worker sizing and
/// retry backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// World units around a viewer inside which blocks are kept resident.
    pub view_radius: f32,
    /// Distance under which blocks are wanted at LOD 0. Each further
    /// doubling of distance allows one coarser level.
    pub lod0_radius: f32,
    /// Maximum requests dispatched per tick.
    pub dispatch_budget: usize,
    /// Maximum generate and mesh jobs outstanding on the worker pool.
    pub max_in_flight: usize,
    /// Worker threads; 0 lets the pool pick from available cores.
    pub worker_threads: usize,
    /// Ticks before the first retry of a failed block; doubles per attempt.
    pub retry_base_ticks: u64,
    /// Upper bound on the retry delay.
    pub retry_max_ticks: u64,
    /// Ticks kept by the frame timer.
    pub frame_history: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            view_radius: 192.0,
            lod0_radius: 48.0,
            dispatch_budget: 16,
            max_in_flight: 32,
            worker_threads: 0,
            retry_base_ticks: 4,
            retry_max_ticks: 256,
            frame_history: 120,
        }
    }
}

impl StreamConfig {
    /// Delay before retry number `attempts` (1-based).
    pub fn backoff(&self, attempts: u32) -> u64 {
        let shift = attempts.saturating_sub(1).min(32);
        self.retry_base_ticks
            .saturating_mul(1u64 << shift)
            .min(self.retry_max_ticks)
    }
}

/// What one scheduling pass did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: u64,
    pub dispatched: Vec<(BlockKey, Action)>,
    pub generated: usize,
    pub loaded: usize,
    pub meshed: usize,
    pub evicted: usize,
    pub coarsened: usize,
    pub discarded: usize,
    pub failed: usize,
    pub corrupt: usize,
    pub deferred_evictions: usize,
    pub cancelled_evictions: usize,
    pub queued: usize,
    pub in_flight: usize,
    /// Desired leaves near the viewers.
    pub needed: usize,
    /// Desired leaves with a current mesh.
    pub ready: usize,
    pub frame_time: Duration,
}

impl TickReport {
    /// Whether the scheduler has nothing left to do for the current viewers.
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.in_flight == 0 && self.dispatched.is_empty()
    }
}

/// Running totals across ticks for instrumentation.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub ticks: u64,
    pub generated: u64,
    pub loaded: u64,
    pub meshed: u64,
    pub evicted: u64,
    pub discarded: u64,
    pub failed: u64,
    pub corrupt: u64,
    pub deferred_evictions: u64,
    pub cancelled_evictions: u64,
}

impl StreamStats {
    pub fn absorb(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.generated += report.generated as u64;
        self.loaded += report.loaded as u64;
        self.meshed += report.meshed as u64;
        self.evicted += report.evicted as u64;
        self.discarded += report.discarded as u64;
        self.failed += report.failed as u64;
        self.corrupt += report.corrupt as u64;
        self.deferred_evictions += report.deferred_evictions as u64;
        self.cancelled_evictions += report.cancelled_evictions as u64;
    }
}

/// Frame time tracker for instrumentation.
#[derive(Debug)]
pub struct FrameTimer {
    history: Vec<Duration>,
    capacity: usize,
    index: usize,
    filled: bool,
}

impl FrameTimer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: vec![Duration::ZERO; capacity],
            capacity,
            index: 0,
            filled: false,
        }
    }

    pub fn record(&mut self, dt: Duration) {
        self.history[self.index] = dt;
        self.index = (self.index + 1) % self.capacity;
        if self.index == 0 {
            self.filled = true;
        }
    }

    fn window(&self) -> &[Duration] {
        &self.history[..self.count()]
    }

    pub fn average(&self) -> Duration {
        let window = self.window();
        if window.is_empty() {
            return Duration::ZERO;
        }
        window.iter().sum::<Duration>() / window.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.window().iter().copied().max().unwrap_or(Duration::ZERO)
    }

    pub fn min(&self) -> Duration {
        self.window().iter().copied().min().unwrap_or(Duration::ZERO)
    }

    pub fn count(&self) -> usize {
        if self.filled {
            self.capacity
        } else {
            self.index
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_config_defaults() {
        let config = StreamConfig::default();
        assert!(config.lod0_radius < config.view_radius);
        assert!(config.dispatch_budget > 0);
        assert!(config.max_in_flight >= config.dispatch_budget);
    }

    #[test]
    fn config_reads_partial_json() {
        let config: StreamConfig = serde_json::from_str(r#"{ "dispatch_budget": 3 }"#).unwrap();
        assert_eq!(config.dispatch_budget, 3);
        assert_eq!(config.view_radius, StreamConfig::default().view_radius);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = StreamConfig {
            retry_base_ticks: 2,
            retry_max_ticks: 10,
            ..StreamConfig::default()
        };
        assert_eq!(config.backoff(1), 2);
        assert_eq!(config.backoff(2), 4);
        assert_eq!(config.backoff(3), 8);
        assert_eq!(config.backoff(4), 10);
        assert_eq!(config.backoff(60), 10);
    }

    #[test]
    fn stats_accumulate_reports() {
        let mut stats = StreamStats::default();
        let report = TickReport {
            generated: 3,
            meshed: 2,
            ..TickReport::default()
        };
        stats.absorb(&report);
        stats.absorb(&report);
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.generated, 6);
        assert_eq!(stats.meshed, 4);
    }

    #[test]
    fn frame_timer_tracks_history() {
        let mut timer = FrameTimer::new(3);
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(20));
        timer.record(Duration::from_millis(30));

        assert_eq!(timer.count(), 3);
        assert_eq!(timer.average(), Duration::from_millis(20));
        assert_eq!(timer.max(), Duration::from_millis(30));
        assert_eq!(timer.min(), Duration::from_millis(10));
    }

    #[test]
    fn frame_timer_wraps_around() {
        let mut timer = FrameTimer::new(2);
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(20));
        timer.record(Duration::from_millis(30)); // overwrites first

        assert_eq!(timer.count(), 2);
        assert_eq!(timer.average(), Duration::from_millis(25));
    }
}
