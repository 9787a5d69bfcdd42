//! Aggregated visit statistics for a single URL

use tracing::warn;

/// Content-signature delta above which an update counts as a content change.
pub const CONTENT_DELTA_THRESHOLD: i64 = 100;

/// Per-URL visit/change statistics, keyed externally by the URL fingerprint.
///
/// Invariants: `first_appear <= last_access`; `count_access >= 1` and
/// `count_change >= 1` once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitingRecord {
    /// The observed URL
    pub url: String,
    /// Unix seconds of the first observation
    pub first_appear: i64,
    /// Unix seconds of the most recent observation
    pub last_access: i64,
    /// Unix seconds of the most recent detected content change
    pub last_change: i64,
    /// Number of observations
    pub count_access: u32,
    /// Number of detected content changes
    pub count_change: u32,
    /// Opaque 64-bit content signature (byte length or hash)
    pub last_content: i64,
}

impl VisitingRecord {
    /// Create a record for a URL observed for the first time at `now`.
    ///
    /// `last_change` is seeded from the file write time when the producer
    /// supplies one, else the Last-Modified header, else `now`.
    pub fn first_visit(
        url: String,
        now: i64,
        content: i64,
        last_modified: Option<i64>,
        file_write_time: Option<i64>,
    ) -> Self {
        let last_change = file_write_time.or(last_modified).unwrap_or(now);
        Self {
            url,
            first_appear: now,
            last_access: now,
            last_change,
            count_access: 1,
            count_change: 1,
            last_content: content,
        }
    }

    /// Fold another record for the same fingerprint into this one.
    ///
    /// Access counts add; `first_appear` takes the minimum and `last_access`
    /// the maximum. Change counts add, minus one when both sides carry the
    /// same `last_content`: the change was observed redundantly across two
    /// snapshots, not twice. `last_content`, `last_change` and the URL string
    /// follow whichever side was accessed more recently.
    pub fn merge(mut self, other: VisitingRecord) -> VisitingRecord {
        let mut count_change = self.count_change.saturating_add(other.count_change);
        if self.last_content == other.last_content {
            if count_change == 0 {
                // Both inputs carried count_change = 0, which a well-formed
                // file can never contain.
                warn!(url = %self.url, "change-count correction on zero counts, input inconsistent");
            }
            count_change = count_change.saturating_sub(1);
        }

        if other.last_access > self.last_access {
            self.url = other.url;
            self.last_content = other.last_content;
            self.last_change = other.last_change;
        }
        self.count_access = self.count_access.saturating_add(other.count_access);
        self.count_change = count_change;
        self.first_appear = self.first_appear.min(other.first_appear);
        self.last_access = self.last_access.max(other.last_access);
        self
    }
}
