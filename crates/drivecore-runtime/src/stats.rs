//! Iteration latency and frame-drop accounting.
//!
//! The first [`STATS_WARMUP_ITERATIONS`] iterations only move the frame-id
//! baseline; latency and drops are accumulated from the iteration after.
//! [`RuntimeStats::mean_latency`] nevertheless divides by the total
//! iteration count, warmup included.
//!
//! A frame receive that times out after warmup is one drop.  Drops already
//! booked for stalls are taken off the frame-id gap seen when frames resume.

use std::time::Duration;

use serde::Serialize;
use tracing::warn;

/// Iterations excluded from drop and latency accumulation.
pub const STATS_WARMUP_ITERATIONS: u64 = 10;

/// Snapshot of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RuntimeStats {
    pub first_frame_id: u32,
    pub last_frame_id: u32,
    pub frame_drop_count: u64,
    pub iteration_count: u64,
    pub cumulative_latency: Duration,
    /// Frame receives that hit the timeout, warmup included.
    pub stalled_receives: u64,
}

impl RuntimeStats {
    /// Mean latency over every iteration, warmup included.
    pub fn mean_latency(&self) -> Duration {
        match u32::try_from(self.iteration_count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.cumulative_latency / n,
            Err(_) => Duration::from_secs_f64(self.cumulative_latency.as_secs_f64() / self.iteration_count as f64),
        }
    }

    /// Dropped frames as a percentage of the frame ids spanned since warmup,
    /// or `0.0` before the id has advanced.
    pub fn drop_percent(&self) -> f32 {
        let span = i64::from(self.last_frame_id) - i64::from(self.first_frame_id);
        if span <= 0 {
            return 0.0;
        }
        (100.0 * self.frame_drop_count as f64 / span as f64) as f32
    }
}

#[derive(Debug, Default)]
pub struct StatsTracker {
    stats: RuntimeStats,
    /// Stall drops not yet matched against a frame-id gap.
    unmatched_stalls: u64,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for iteration `iteration_index` (1-based) that processed
    /// `frame_id` in `elapsed`.
    ///
    /// After warmup, a frame id that does not advance counts as a single
    /// drop and leaves the baseline where it was.
    pub fn record(&mut self, iteration_index: u64, frame_id: u32, elapsed: Duration) {
        let s = &mut self.stats;
        s.iteration_count = s.iteration_count.max(iteration_index);

        if iteration_index <= STATS_WARMUP_ITERATIONS {
            s.first_frame_id = s.last_frame_id;
            s.last_frame_id = frame_id;
            return;
        }

        s.cumulative_latency += elapsed;
        if frame_id > s.last_frame_id {
            let gap = u64::from(frame_id - s.last_frame_id - 1);
            s.frame_drop_count += gap.saturating_sub(self.unmatched_stalls);
            s.last_frame_id = frame_id;
            self.unmatched_stalls = 0;
        } else {
            warn!(frame_id, last_frame_id = s.last_frame_id, "frame id did not advance");
            s.frame_drop_count += 1;
        }
    }

    /// Seed the frame-id baseline with the frame consumed before the first
    /// iteration.
    pub fn prime(&mut self, frame_id: u32) {
        self.stats.last_frame_id = frame_id;
    }

    /// Note a frame receive that timed out.  Counts as a drop once warmup
    /// is over.
    pub fn record_stall(&mut self) {
        let s = &mut self.stats;
        s.stalled_receives += 1;
        if s.iteration_count >= STATS_WARMUP_ITERATIONS {
            s.frame_drop_count += 1;
            self.unmatched_stalls += 1;
        }
    }

    pub fn snapshot(&self) -> RuntimeStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn drop_percent_matches_worked_example() {
        let stats = RuntimeStats {
            first_frame_id: 10,
            last_frame_id: 110,
            frame_drop_count: 5,
            ..Default::default()
        };
        assert_eq!(stats.drop_percent(), 5.0);
    }

    #[test]
    fn drop_percent_is_defined_without_progress() {
        let stats = RuntimeStats {
            first_frame_id: 42,
            last_frame_id: 42,
            frame_drop_count: 3,
            ..Default::default()
        };
        assert_eq!(stats.drop_percent(), 0.0);
        assert_eq!(RuntimeStats::default().drop_percent(), 0.0);
    }

    #[test]
    fn warmup_gaps_never_count() {
        let mut tracker = StatsTracker::new();
        // Huge gaps during the first ten iterations.
        for i in 1..=STATS_WARMUP_ITERATIONS {
            tracker.record(i, (i * 100) as u32, MS);
        }
        let s = tracker.snapshot();
        assert_eq!(s.frame_drop_count, 0);
        assert_eq!(s.cumulative_latency, Duration::ZERO);
        assert_eq!(s.last_frame_id, 1000);
        assert_eq!(s.first_frame_id, 900);

        // Iteration 11 skips two frames.
        tracker.record(11, 1003, MS);
        let s = tracker.snapshot();
        assert_eq!(s.frame_drop_count, 2);
        assert_eq!(s.cumulative_latency, MS);
    }

    #[test]
    fn consecutive_ids_accumulate_no_drops() {
        let mut tracker = StatsTracker::new();
        for i in 1..=30u64 {
            tracker.record(i, i as u32, MS);
        }
        let s = tracker.snapshot();
        assert_eq!(s.frame_drop_count, 0);
        assert_eq!(s.iteration_count, 30);
        assert_eq!(s.cumulative_latency, 20 * MS);
    }

    #[test]
    fn mean_latency_divides_by_all_iterations() {
        let mut tracker = StatsTracker::new();
        for i in 1..=20u64 {
            tracker.record(i, i as u32, 10 * MS);
        }
        // Ten post-warmup samples of 10 ms over twenty iterations.
        assert_eq!(tracker.snapshot().mean_latency(), 5 * MS);
        assert_eq!(RuntimeStats::default().mean_latency(), Duration::ZERO);
    }

    #[test]
    fn repeated_or_backwards_id_is_one_drop() {
        let mut tracker = StatsTracker::new();
        for i in 1..=11u64 {
            tracker.record(i, i as u32, MS);
        }
        tracker.record(12, 5, MS);
        let s = tracker.snapshot();
        assert_eq!(s.frame_drop_count, 1);
        assert_eq!(s.last_frame_id, 11);
    }

    #[test]
    fn primed_baseline_feeds_first_warmup_iteration() {
        let mut tracker = StatsTracker::new();
        tracker.prime(7);
        tracker.record(1, 8, MS);
        let s = tracker.snapshot();
        assert_eq!((s.first_frame_id, s.last_frame_id), (7, 8));
    }

    #[test]
    fn stalls_during_warmup_are_not_drops() {
        let mut tracker = StatsTracker::new();
        tracker.record_stall();
        tracker.record(1, 1, MS);
        tracker.record_stall();
        let s = tracker.snapshot();
        assert_eq!(s.stalled_receives, 2);
        assert_eq!(s.frame_drop_count, 0);
    }

    #[test]
    fn stall_after_warmup_is_a_drop() {
        let mut tracker = StatsTracker::new();
        for i in 1..=11u64 {
            tracker.record(i, i as u32, MS);
        }
        tracker.record_stall();
        tracker.record_stall();
        assert_eq!(tracker.snapshot().frame_drop_count, 2);

        // The camera kept its ids contiguous: nothing more to add.
        tracker.record(12, 12, MS);
        assert_eq!(tracker.snapshot().frame_drop_count, 2);
    }

    #[test]
    fn stall_gap_is_not_counted_twice() {
        let mut tracker = StatsTracker::new();
        for i in 1..=11u64 {
            tracker.record(i, i as u32, MS);
        }
        tracker.record_stall();
        tracker.record_stall();
        // Frames 12..=15 never arrived: four missing ids, two already booked.
        tracker.record(12, 16, MS);
        let s = tracker.snapshot();
        assert_eq!(s.frame_drop_count, 4);
        assert_eq!(s.stalled_receives, 2);

        // The next gap is counted in full again.
        tracker.record(13, 19, MS);
        assert_eq!(tracker.snapshot().frame_drop_count, 6);
    }
}
