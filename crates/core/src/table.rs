//! In-memory aggregation cache
//!
//! One `RecordTable` per site holds the working set of visit records, keyed
//! by URL fingerprint, with a hard capacity bound. A single receiver thread
//! is the sole mutator; the table itself carries no locking.

use std::path::Path;

use ahash::AHashMap;
use tracing::{debug, warn};
use urltrack_formats::{
    RecordReader, RecordWriter, VisitingRecord, CONTENT_DELTA_THRESHOLD,
};

use crate::fingerprint::url_fingerprint;
use crate::Result;

/// Outcome of an ingestion attempt.
///
/// `Full` is a normal capacity signal, distinct from I/O errors: the new URL
/// was dropped to keep memory bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    Updated,
    Full,
}

/// Fingerprint-keyed cache of visit records with bounded capacity.
pub struct RecordTable {
    records: AHashMap<u64, VisitingRecord>,
    max_size: usize,
    /// Records older than this have already been collected; `gc` calls with
    /// an older cutoff are no-ops.
    gc_watermark: i64,
}

/// Upper bound on heuristic GC passes per invocation, so a table parked near
/// its watermark cannot spin on 1-second steps.
const MAX_GC_PASSES: usize = 64;

impl RecordTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            records: AHashMap::with_capacity(max_size.min(1_000_000)),
            max_size,
            gc_watermark: 0,
        }
    }

    /// Record one observation of `url` at time `now`.
    ///
    /// A new URL creates a record unless the table is at capacity. A repeat
    /// observation bumps access counters and runs change detection: a
    /// differing `file_write_time` (when the producer has one) is the
    /// authoritative signal that the underlying file was rewritten;
    /// otherwise a content-signature delta above
    /// [`CONTENT_DELTA_THRESHOLD`] counts as a change.
    pub fn add_record(
        &mut self,
        url: &str,
        content: i64,
        last_modified: Option<i64>,
        file_write_time: Option<i64>,
        now: i64,
    ) -> AddOutcome {
        let fingerprint = url_fingerprint(url);

        if let Some(record) = self.records.get_mut(&fingerprint) {
            record.last_access = now;
            record.count_access = record.count_access.saturating_add(1);

            let changed = match file_write_time {
                Some(fwt) => fwt != record.last_change,
                None => (content - record.last_content).abs() > CONTENT_DELTA_THRESHOLD,
            };
            if changed {
                record.count_change = record.count_change.saturating_add(1);
                record.last_content = content;
                record.last_change = last_modified.unwrap_or(now);
            }
            return AddOutcome::Updated;
        }

        if self.records.len() >= self.max_size {
            return AddOutcome::Full;
        }

        let record =
            VisitingRecord::first_visit(url.to_string(), now, content, last_modified, file_write_time);
        self.records.insert(fingerprint, record);
        AddOutcome::Inserted
    }

    /// Remove every record whose `last_access` is older than `oldest`.
    ///
    /// A cutoff at or below the watermark of the previous collection is a
    /// no-op, avoiding redundant full scans.
    pub fn gc(&mut self, oldest: i64) -> usize {
        if oldest <= self.gc_watermark {
            return 0;
        }
        let before = self.records.len();
        self.records.retain(|_, r| r.last_access >= oldest);
        self.gc_watermark = oldest;
        let removed = before - self.records.len();
        if removed > 0 {
            debug!(removed, cutoff = oldest, "record table GC");
        }
        removed
    }

    /// Collect in increasing-cutoff passes until at least 10% of capacity is
    /// free.
    ///
    /// Each pass advances the cutoff by a quarter of the distance from the
    /// current watermark to `now` (minimum one second, so progress is
    /// guaranteed). This amortizes eviction against a single full-table
    /// scan while keeping the number of passes logarithmic.
    pub fn heuristic_gc(&mut self, now: i64) -> usize {
        let target_free = (self.max_size / 10).max(1);
        let mut removed = 0;

        for _ in 0..MAX_GC_PASSES {
            if self.free_slots() >= target_free || self.gc_watermark >= now {
                break;
            }
            let step = ((now - self.gc_watermark) / 4).max(1);
            removed += self.gc(self.gc_watermark + step);
        }
        removed
    }

    /// Persist the whole table to `path`, sorted ascending by fingerprint
    /// (downstream merging requires sorted input). With `keep = false` the
    /// table is drained after a successful write.
    pub fn save<P: AsRef<Path>>(&mut self, path: P, keep: bool) -> Result<()> {
        let mut entries: Vec<(u64, &VisitingRecord)> =
            self.records.iter().map(|(&fp, r)| (fp, r)).collect();
        entries.sort_unstable_by_key(|&(fp, _)| fp);

        let mut writer = RecordWriter::create(path)?;
        for (fp, record) in entries {
            writer.write(fp, record)?;
        }
        writer.finish()?;

        if !keep {
            self.records.clear();
        }
        Ok(())
    }

    /// Replace the table contents from a record file. Repeated fingerprints
    /// keep the last occurrence.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.records.clear();
        let reader = RecordReader::open(path)?;
        for entry in reader {
            let (fp, record) = entry?;
            if self.records.len() >= self.max_size && !self.records.contains_key(&fp) {
                warn!(fingerprint = fp, "record table full during load, dropping entry");
                continue;
            }
            self.records.insert(fp, record);
        }
        Ok(())
    }

    pub fn get(&self, fingerprint: u64) -> Option<&VisitingRecord> {
        self.records.get(&fingerprint)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &VisitingRecord)> {
        self.records.iter().map(|(&fp, r)| (fp, r))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn free_slots(&self) -> usize {
        self.max_size.saturating_sub(self.records.len())
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
