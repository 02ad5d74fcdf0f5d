//! Per-size-class timing of the quarantine's phases, and the pause
//! controller that diverts `free` away from the quarantine when zap
//! latencies grow anomalously.

use crate::bucket::NUM_BUCKETS;
use std::time::{Duration, Instant};

/// Ring capacity per bucket. A power of two so the average's integer
/// division optimizes to a shift.
pub const MAX_TIMES_TO_TRACK: usize = 1024;

/// Rolling window of recent durations for one bucket.
pub struct BucketStats {
    paused: u32,
    cycled: u32,
    valid: bool,
    /// Updated on each recorded value.
    idx: usize,
    /// Set to the rolling index of the last value recorded every time stats
    /// are reported; tracks `cycled` and `valid`. Starts at
    /// `MAX_TIMES_TO_TRACK - 1` so the ring is only valid after a full lap.
    reported_idx: usize,
    sum_ns: i64,
    average_ns: i64,
    times_ns: Vec<i64>,
}

impl BucketStats {
    fn new() -> Self {
        BucketStats {
            paused: 0,
            cycled: 0,
            valid: false,
            idx: 0,
            reported_idx: MAX_TIMES_TO_TRACK - 1,
            sum_ns: 0,
            average_ns: 0,
            times_ns: vec![0; MAX_TIMES_TO_TRACK],
        }
    }

    /// Back to the initial state (the ring contents are stale but unread
    /// until overwritten).
    pub fn reset(&mut self) {
        self.valid = false;
        self.idx = 0;
        self.sum_ns = 0;
        self.average_ns = 0;
        self.reported_idx = MAX_TIMES_TO_TRACK - 1;
    }

    /// Called whenever the stats are exported; clears `paused`/`cycled` and
    /// re-anchors the cycle reference, leaving values and the current
    /// average available.
    pub fn reported(&mut self) {
        if self.valid {
            self.paused = 0;
            self.cycled = 0;
            self.reported_idx = self.idx;
        }
    }

    pub fn record_value(&mut self, value_ns: i64) {
        // A zero duration still counts as one recorded nanosecond in the
        // sum, so an all-zero window is distinguishable from an empty one.
        self.sum_ns = self.sum_ns + (if value_ns != 0 { value_ns } else { 1 })
            - (if self.valid { self.times_ns[self.idx] } else { 0 });
        self.times_ns[self.idx] = value_ns;
        if self.idx == self.reported_idx {
            self.valid = true;
            self.cycled += 1;
        }
        if self.idx == MAX_TIMES_TO_TRACK - 1 {
            self.idx = 0;
        } else {
            self.idx += 1;
        }
        if self.valid {
            // Integer division loses precision but avoids a float divide on
            // the free path; the ring size is a power of two.
            self.average_ns = self.sum_ns / MAX_TIMES_TO_TRACK as i64;
        }
    }

    pub fn increase_paused(&mut self) {
        self.paused += 1;
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn cycled(&self) -> u32 {
        self.cycled
    }

    pub fn paused(&self) -> u32 {
        self.paused
    }

    pub fn average_ns(&self) -> i64 {
        self.average_ns
    }

    pub fn sum_ns(&self) -> i64 {
        self.sum_ns
    }

    pub fn times_ns(&self) -> &[i64] {
        &self.times_ns
    }
}

/// Phase timestamps the quarantine hands back so the caller can attribute
/// time to purge and zap.
#[derive(Default)]
pub struct QuarantinePhaseTimes {
    pub purge_start: Option<Instant>,
    pub zap_start: Option<Instant>,
}

/// Timing controller for one allocator root. Rings are allocated lazily on
/// the first `init_or_reset_stats`; until then every operation is a no-op
/// and `should_pause` is false.
pub struct RuntimeStats {
    initialized: bool,
    max_above_avg_zap_delta: Duration,
    long_zap_pause_delta: Duration,
    pause_until: Option<Instant>,
    zap_buckets: Vec<BucketStats>,
    purge_buckets: Vec<BucketStats>,
    total_time_buckets: Vec<BucketStats>,
}

impl RuntimeStats {
    pub const fn new() -> Self {
        RuntimeStats {
            initialized: false,
            max_above_avg_zap_delta: Duration::ZERO,
            long_zap_pause_delta: Duration::ZERO,
            pause_until: None,
            zap_buckets: Vec::new(),
            purge_buckets: Vec::new(),
            total_time_buckets: Vec::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Allocate the rings on first use; reset them in place afterwards.
    pub fn init_or_reset_stats(
        &mut self,
        pause_delay: Duration,
        max_above_avg_zap_delta: Duration,
    ) {
        if !self.initialized {
            // Only done once; a root that never records anything never
            // allocates.
            self.initialized = true;
            self.zap_buckets = (0..NUM_BUCKETS).map(|_| BucketStats::new()).collect();
            self.purge_buckets = (0..NUM_BUCKETS).map(|_| BucketStats::new()).collect();
            self.total_time_buckets = (0..NUM_BUCKETS).map(|_| BucketStats::new()).collect();
        } else {
            for stat in &mut self.zap_buckets {
                stat.reset();
            }
            for stat in &mut self.purge_buckets {
                stat.reset();
            }
            for stat in &mut self.total_time_buckets {
                stat.reset();
            }
        }
        self.long_zap_pause_delta = pause_delay;
        self.max_above_avg_zap_delta = max_above_avg_zap_delta;
    }

    pub fn add_stats(
        &mut self,
        bucket_index: usize,
        quarantine_start: Option<Instant>,
        purge_start: Option<Instant>,
        zap_start: Option<Instant>,
        quarantine_end: Option<Instant>,
    ) {
        if !self.initialized {
            return;
        }
        // These are always set on a timed path.
        debug_assert!(quarantine_start.is_some());
        debug_assert!(quarantine_end.is_some());
        let (Some(q_start), Some(q_end)) = (quarantine_start, quarantine_end) else {
            return;
        };

        self.total_time_buckets[bucket_index]
            .record_value(duration_ns(q_end.saturating_duration_since(q_start)));

        // Zap runs last but is gated separately, so it may be absent.
        let mut zap_time = Duration::ZERO;
        let average_ns = self.zap_buckets[bucket_index].average_ns();
        if let Some(zap) = zap_start {
            // If we zapped, the quarantine was active and purge ran first.
            debug_assert!(purge_start.is_some());
            zap_time = q_end.saturating_duration_since(zap);
            if let Some(purge) = purge_start {
                self.purge_buckets[bucket_index]
                    .record_value(duration_ns(zap.saturating_duration_since(purge)));
            }
            self.zap_buckets[bucket_index].record_value(duration_ns(zap_time));
        } else if let Some(purge) = purge_start {
            // Without a zap, the purge phase is measured to the end.
            self.purge_buckets[bucket_index]
                .record_value(duration_ns(q_end.saturating_duration_since(purge)));
        }

        // A zap far above this bucket's rolling average pauses the whole
        // quarantine for a while.
        let should_pause_on_long_zap =
            !self.max_above_avg_zap_delta.is_zero() && !zap_time.is_zero();
        if !self.zap_buckets[bucket_index].valid() || !should_pause_on_long_zap {
            return;
        }
        let average = Duration::from_nanos(average_ns.max(0) as u64);
        if zap_time.saturating_sub(average) > self.max_above_avg_zap_delta {
            debug_assert!(!self.long_zap_pause_delta.is_zero());
            self.pause_until = Some(q_end + self.long_zap_pause_delta);
            self.zap_buckets[bucket_index].increase_paused();
        }
    }

    /// Should a `free` beginning at `start` bypass the quarantine?
    pub fn should_pause(&self, start: Option<Instant>) -> bool {
        let (Some(until), Some(start)) = (self.pause_until, start) else {
            return false;
        };
        self.initialized && start < until
    }

    /// Export hook: zeroes the per-bucket `paused`/`cycled` counters and
    /// marks the current ring position as the new cycle reference.
    pub fn reported_stats(&mut self) {
        if !self.initialized {
            return;
        }
        for stat in &mut self.zap_buckets {
            stat.reported();
        }
        for stat in &mut self.purge_buckets {
            stat.reported();
        }
        for stat in &mut self.total_time_buckets {
            stat.reported();
        }
    }

    pub fn zap_buckets(&self) -> &[BucketStats] {
        &self.zap_buckets
    }

    pub fn purge_buckets(&self) -> &[BucketStats] {
        &self.purge_buckets
    }

    pub fn total_time_buckets(&self) -> &[BucketStats] {
        &self.total_time_buckets
    }
}

#[inline]
fn duration_ns(d: Duration) -> i64 {
    d.as_nanos().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn init() -> RuntimeStats {
        let mut stats = RuntimeStats::new();
        stats.init_or_reset_stats(Duration::from_millis(10), MS);
        stats
    }

    fn feed_zap(stats: &mut RuntimeStats, bucket: usize, start: Instant, zap: Duration) -> Instant {
        let purge = start + Duration::from_nanos(10);
        let zap_start = purge + Duration::from_nanos(10);
        let end = zap_start + zap;
        stats.add_stats(bucket, Some(start), Some(purge), Some(zap_start), Some(end));
        end
    }

    #[test]
    fn ring_becomes_valid_after_a_full_lap() {
        let mut stats = init();
        let t0 = Instant::now();
        for i in 0..MAX_TIMES_TO_TRACK - 1 {
            feed_zap(&mut stats, 0, t0 + Duration::from_micros(i as u64), Duration::from_micros(100));
            assert!(!stats.zap_buckets()[0].valid());
        }
        feed_zap(&mut stats, 0, t0, Duration::from_micros(100));
        assert!(stats.zap_buckets()[0].valid());
        assert_eq!(stats.zap_buckets()[0].cycled(), 1);
    }

    #[test]
    fn average_matches_sum_over_ring() {
        let mut stats = init();
        let t0 = Instant::now();
        for _ in 0..MAX_TIMES_TO_TRACK {
            feed_zap(&mut stats, 3, t0, Duration::from_micros(100));
        }
        let bucket = &stats.zap_buckets()[3];
        assert!(bucket.valid());
        let ring_sum: i64 = bucket.times_ns().iter().sum();
        assert_eq!(bucket.sum_ns(), ring_sum);
        assert_eq!(bucket.average_ns(), bucket.sum_ns() / MAX_TIMES_TO_TRACK as i64);
        assert_eq!(bucket.average_ns(), 100_000);
    }

    #[test]
    fn long_zap_pauses_until_deadline() {
        let mut stats = init();
        let t0 = Instant::now();

        // Fill the ring with 100 us zaps; average settles at 100 us.
        for _ in 0..MAX_TIMES_TO_TRACK {
            feed_zap(&mut stats, 0, t0, Duration::from_micros(100));
        }
        assert!(!stats.should_pause(Some(t0)));

        // One 5 ms zap exceeds the average by far more than 1 ms.
        let end = feed_zap(&mut stats, 0, t0, Duration::from_millis(5));
        assert_eq!(stats.zap_buckets()[0].paused(), 1);

        assert!(stats.should_pause(Some(end)));
        assert!(stats.should_pause(Some(end + Duration::from_millis(9))));
        assert!(!stats.should_pause(Some(end + Duration::from_millis(10))));
        assert!(!stats.should_pause(None));
    }

    #[test]
    fn no_pause_before_ring_is_valid() {
        let mut stats = init();
        let t0 = Instant::now();
        let end = feed_zap(&mut stats, 0, t0, Duration::from_millis(50));
        // The ring has one sample; anomaly detection needs a full window.
        assert!(!stats.should_pause(Some(end)));
        assert_eq!(stats.zap_buckets()[0].paused(), 0);
    }

    #[test]
    fn purge_time_recorded_without_zap() {
        let mut stats = init();
        let t0 = Instant::now();
        let purge = t0 + Duration::from_micros(1);
        let end = purge + Duration::from_micros(40);
        stats.add_stats(2, Some(t0), Some(purge), None, Some(end));
        assert_eq!(stats.purge_buckets()[2].times_ns()[0], 40_000);
        // No zap sample was recorded.
        assert_eq!(stats.zap_buckets()[2].times_ns()[0], 0);
    }

    #[test]
    fn reported_resets_counters_but_keeps_average() {
        let mut stats = init();
        let t0 = Instant::now();
        for _ in 0..MAX_TIMES_TO_TRACK {
            feed_zap(&mut stats, 1, t0, Duration::from_micros(100));
        }
        feed_zap(&mut stats, 1, t0, Duration::from_millis(5));
        assert_eq!(stats.zap_buckets()[1].paused(), 1);
        let average = stats.zap_buckets()[1].average_ns();

        stats.reported_stats();
        assert_eq!(stats.zap_buckets()[1].paused(), 0);
        assert_eq!(stats.zap_buckets()[1].cycled(), 0);
        assert_eq!(stats.zap_buckets()[1].average_ns(), average);
        assert!(stats.zap_buckets()[1].valid());
    }

    #[test]
    fn reinit_resets_rings_in_place() {
        let mut stats = init();
        let t0 = Instant::now();
        for _ in 0..MAX_TIMES_TO_TRACK {
            feed_zap(&mut stats, 0, t0, Duration::from_micros(100));
        }
        assert!(stats.zap_buckets()[0].valid());
        stats.init_or_reset_stats(Duration::from_millis(10), MS);
        assert!(!stats.zap_buckets()[0].valid());
        assert_eq!(stats.zap_buckets()[0].sum_ns(), 0);
    }

    #[test]
    fn uninitialized_controller_is_inert() {
        let mut stats = RuntimeStats::new();
        let t0 = Instant::now();
        stats.add_stats(0, Some(t0), None, None, Some(t0));
        assert!(!stats.should_pause(Some(t0)));
        assert!(stats.zap_buckets().is_empty());
    }
}
