//! Retention histogram over record recency
//!
//! Buckets records by the age of their `last_access` relative to a `newest`
//! timestamp captured at reset: per-hour buckets for the most recent 100
//! hours, per-day buckets for the next 1000 days, and a single very-old
//! bucket beyond that. The histogram drives both the merge's retention
//! cutoff and sitemap priority scoring.

use urltrack_formats::VisitingRecord;

/// Number of one-hour buckets covering the most recent ages.
pub const HOUR_BUCKETS: usize = 100;
/// Number of one-day buckets following the hourly range.
pub const DAY_BUCKETS: usize = 1000;

const HOUR_SECS: i64 = 3600;
const DAY_SECS: i64 = 86_400;
const HOUR_RANGE_SECS: i64 = HOUR_BUCKETS as i64 * HOUR_SECS;
const DAY_RANGE_SECS: i64 = DAY_BUCKETS as i64 * DAY_SECS;

/// Two-resolution recency histogram with an approximate age-cutoff query.
#[derive(Debug, Clone)]
pub struct RecordFileStat {
    newest: i64,
    hours: Vec<u64>,
    days: Vec<u64>,
    very_old: u64,
    total: u64,
    max_count_access: u32,
}

impl RecordFileStat {
    /// Create an empty histogram anchored at `newest`.
    pub fn new(newest: i64) -> Self {
        Self {
            newest,
            hours: vec![0; HOUR_BUCKETS],
            days: vec![0; DAY_BUCKETS],
            very_old: 0,
            total: 0,
            max_count_access: 0,
        }
    }

    /// Clear all buckets and re-anchor at `newest`.
    pub fn reset(&mut self, newest: i64) {
        self.newest = newest;
        self.hours.iter_mut().for_each(|b| *b = 0);
        self.days.iter_mut().for_each(|b| *b = 0);
        self.very_old = 0;
        self.total = 0;
        self.max_count_access = 0;
    }

    /// Bucket one record by `newest - last_access`. A non-positive offset
    /// clamps into the most-recent bucket.
    pub fn add_record(&mut self, record: &VisitingRecord) {
        let age = (self.newest - record.last_access).max(0);
        if age < HOUR_RANGE_SECS {
            self.hours[(age / HOUR_SECS) as usize] += 1;
        } else if age < HOUR_RANGE_SECS + DAY_RANGE_SECS {
            self.days[((age - HOUR_RANGE_SECS) / DAY_SECS) as usize] += 1;
        } else {
            self.very_old += 1;
        }
        self.total += 1;
        self.max_count_access = self.max_count_access.max(record.count_access);
    }

    /// Total number of records added since the last reset.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn newest(&self) -> i64 {
        self.newest
    }

    pub fn max_count_access(&self) -> u32 {
        self.max_count_access
    }

    /// Estimate the age cutoff that would shrink the set to `maxsize`
    /// records: walk buckets from oldest to newest accumulating counts and
    /// return the newer time boundary of the bucket where the running sum
    /// first reaches `total - maxsize`.
    ///
    /// Bucket-granular, not an exact rank statistic: cutting at the returned
    /// time may discard slightly more than `total - maxsize` records.
    pub fn cutdown_time(&self, maxsize: u64) -> i64 {
        if maxsize >= self.total {
            return 0;
        }
        let need = self.total - maxsize;
        let mut acc = self.very_old;
        if acc >= need {
            return self.newest - HOUR_RANGE_SECS - DAY_RANGE_SECS;
        }
        for i in (0..DAY_BUCKETS).rev() {
            acc += self.days[i];
            if acc >= need {
                return self.newest - HOUR_RANGE_SECS - i as i64 * DAY_SECS;
            }
        }
        for i in (0..HOUR_BUCKETS).rev() {
            acc += self.hours[i];
            if acc >= need {
                return self.newest - i as i64 * HOUR_SECS;
            }
        }
        // Everything is in the most-recent bucket; nothing older to cut.
        self.newest
    }

    /// Sitemap priority for a record: `0.1 + 0.9 * ln(count_access) /
    /// ln(max_count_access)`, clamped to `[0, 1]`; zero for a record never
    /// accessed.
    pub fn priority(&self, record: &VisitingRecord) -> f64 {
        if record.count_access == 0 {
            return 0.0;
        }
        if self.max_count_access <= 1 {
            return 1.0;
        }
        let ratio =
            (record.count_access as f64).ln() / (self.max_count_access as f64).ln();
        (0.1 + 0.9 * ratio).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(last_access: i64, count_access: u32) -> VisitingRecord {
        VisitingRecord {
            url: "u".to_string(),
            first_appear: 0,
            last_access,
            last_change: 0,
            count_access,
            count_change: 1,
            last_content: 0,
        }
    }

    #[test]
    fn test_bucketing_and_total() {
        let newest = 1_000_000_000;
        let mut stat = RecordFileStat::new(newest);
        stat.add_record(&rec(newest, 1)); // hour bucket 0
        stat.add_record(&rec(newest + 50, 1)); // future clamps into bucket 0
        stat.add_record(&rec(newest - 99 * HOUR_SECS, 1)); // hour bucket 99
        stat.add_record(&rec(newest - HOUR_RANGE_SECS, 1)); // day bucket 0
        stat.add_record(&rec(newest - HOUR_RANGE_SECS - DAY_RANGE_SECS, 1)); // very old
        assert_eq!(stat.total(), 5);
    }

    #[test]
    fn test_cutdown_time_large_maxsize() {
        let newest = 1_000_000_000;
        let mut stat = RecordFileStat::new(newest);
        let oldest_access = newest - 10 * HOUR_SECS;
        stat.add_record(&rec(newest, 1));
        stat.add_record(&rec(oldest_access, 1));

        // maxsize >= total: cutoff at or before the oldest retained access.
        assert!(stat.cutdown_time(2) <= oldest_access);
        assert!(stat.cutdown_time(100) <= oldest_access);
    }

    #[test]
    fn test_cutdown_time_discards_oldest_bucket() {
        let newest = 1_000_000_000;
        let mut stat = RecordFileStat::new(newest);
        for _ in 0..10 {
            stat.add_record(&rec(newest, 1)); // hour bucket 0
        }
        for _ in 0..5 {
            stat.add_record(&rec(newest - 50 * HOUR_SECS, 1)); // hour bucket 50
        }

        // Shrinking to 10 must cut the bucket holding the 5 old records:
        // the boundary is that bucket's newer edge.
        let cut = stat.cutdown_time(10);
        assert_eq!(cut, newest - 50 * HOUR_SECS);
        assert!(cut > newest - 51 * HOUR_SECS);
    }

    #[test]
    fn test_cutdown_walks_day_buckets() {
        let newest = 2_000_000_000;
        let mut stat = RecordFileStat::new(newest);
        for _ in 0..4 {
            stat.add_record(&rec(newest, 1));
        }
        for _ in 0..6 {
            // day bucket 3
            stat.add_record(&rec(newest - HOUR_RANGE_SECS - 3 * DAY_SECS, 1));
        }

        let cut = stat.cutdown_time(4);
        assert_eq!(cut, newest - HOUR_RANGE_SECS - 3 * DAY_SECS);
    }

    #[test]
    fn test_priority_scaling() {
        let mut stat = RecordFileStat::new(1000);
        stat.add_record(&rec(1000, 100));
        stat.add_record(&rec(1000, 10));
        stat.add_record(&rec(1000, 1));

        let top = stat.priority(&rec(1000, 100));
        let mid = stat.priority(&rec(1000, 10));
        let low = stat.priority(&rec(1000, 1));

        assert!((top - 1.0).abs() < 1e-9);
        assert!((low - 0.1).abs() < 1e-9);
        assert!(mid > low && mid < top);
        assert_eq!(stat.priority(&rec(1000, 0)), 0.0);
    }

    #[test]
    fn test_priority_degenerate_max() {
        let mut stat = RecordFileStat::new(1000);
        stat.add_record(&rec(1000, 1));
        assert_eq!(stat.priority(&rec(1000, 1)), 1.0);
    }

    #[test]
    fn test_reset_clears() {
        let mut stat = RecordFileStat::new(1000);
        stat.add_record(&rec(900, 5));
        stat.reset(2000);
        assert_eq!(stat.total(), 0);
        assert_eq!(stat.max_count_access(), 0);
        assert_eq!(stat.newest(), 2000);
    }
}
