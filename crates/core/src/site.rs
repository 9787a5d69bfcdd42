//! Per-site service object
//!
//! One `Site` owns everything tracked for a single website: the in-memory
//! record and host tables behind a memory lock, and the on-disk rotation
//! layout behind a file lock. The locks are separate on purpose: flushing
//! and consolidation hold the file lock for as long as they need without
//! blocking new ingestion into memory.
//!
//! Lock order is file before memory; no path takes them the other way
//! around.

use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::manager::RecordFileManager;
use crate::merger::{self, MergeOptions, MergeOutcome};
use crate::table::{AddOutcome, RecordTable};
use crate::HostTable;
use crate::Result;

/// Tuning for one site.
#[derive(Debug, Clone)]
pub struct SiteOptions {
    /// In-memory record table capacity.
    pub table_capacity: usize,
    /// Maximum records retained in the consolidated base file (0 = unlimited).
    pub max_retained: u64,
    /// Aggregate temp-file byte budget, if any.
    pub max_temp_bytes: Option<u64>,
    /// Keep records in memory after a flush instead of draining them.
    pub keep_after_flush: bool,
}

impl Default for SiteOptions {
    fn default() -> Self {
        Self {
            table_capacity: 100_000,
            max_retained: 1_000_000,
            max_temp_bytes: None,
            keep_after_flush: false,
        }
    }
}

struct Tables {
    records: RecordTable,
    hosts: HostTable,
}

/// All state for one monitored website.
pub struct Site {
    tables: Mutex<Tables>,
    files: Mutex<RecordFileManager>,
    options: SiteOptions,
}

impl Site {
    /// Open a site rooted at `dir`. A `data_current` left behind by a
    /// crashed run is rotated into a temp file before ingestion resumes so
    /// the next flush cannot overwrite observed URLs.
    pub fn open<P: AsRef<Path>>(dir: P, options: SiteOptions, now: i64) -> Result<Self> {
        let manager = RecordFileManager::open(dir, options.max_temp_bytes)?;

        if manager.current_path().exists() {
            match manager.complete_current_file(now) {
                Ok(temp) => {
                    info!(file = %temp.name, "recovered leftover active file into temp snapshot")
                }
                Err(e) => warn!(error = %e, "failed to recover leftover active file"),
            }
        }

        let mut hosts = HostTable::new();
        let hosts_path = manager.hosts_path();
        if hosts_path.exists() {
            if let Err(e) = hosts.load(&hosts_path) {
                warn!(error = %e, "failed to load host table, starting empty");
            }
        }

        Ok(Self {
            tables: Mutex::new(Tables {
                records: RecordTable::new(options.table_capacity),
                hosts,
            }),
            files: Mutex::new(manager),
            options,
        })
    }

    /// Record one observation. When the table is full, one heuristic GC
    /// pass reclaims space before the insert is retried; a still-full table
    /// drops the URL.
    pub fn ingest(
        &self,
        url: &str,
        host: &str,
        content: i64,
        last_modified: Option<i64>,
        file_write_time: Option<i64>,
        now: i64,
    ) -> AddOutcome {
        let mut tables = self.tables.lock().expect("memory lock poisoned");

        let mut outcome =
            tables
                .records
                .add_record(url, content, last_modified, file_write_time, now);
        if outcome == AddOutcome::Full {
            let removed = tables.records.heuristic_gc(now);
            if removed > 0 {
                outcome =
                    tables
                        .records
                        .add_record(url, content, last_modified, file_write_time, now);
            }
        }
        if outcome == AddOutcome::Full {
            debug!(url, "record table full, dropping new URL");
        }

        if !host.is_empty() {
            tables.hosts.visit_host(host);
        }
        outcome
    }

    /// Snapshot the in-memory tables: write the record table to
    /// `data_current`, rotate it into a temp file, persist the host table,
    /// and enforce the temp byte budget. Returns false when there was
    /// nothing to flush.
    pub fn flush(&self, now: i64) -> Result<bool> {
        let manager = self.files.lock().expect("file lock poisoned");

        {
            let mut tables = self.tables.lock().expect("memory lock poisoned");
            if tables.records.is_empty() {
                return Ok(false);
            }
            tables
                .records
                .save(manager.current_path(), self.options.keep_after_flush)?;
            tables.hosts.save(manager.hosts_path())?;
        }

        let temp = manager.complete_current_file(now)?;
        let evicted = manager.clean_up_temp_files()?;
        debug!(file = %temp.name, size = temp.size, evicted, "flushed site snapshot");
        Ok(true)
    }

    /// Fold the base file and all pending temp files into a new base,
    /// removing obsoleted fingerprints and records older than `cutdown`.
    pub fn consolidate(
        &self,
        obsoleted: &[u64],
        cutdown: i64,
        now: i64,
    ) -> Result<MergeOutcome> {
        let manager = self.files.lock().expect("file lock poisoned");
        merger::consolidate(
            &manager,
            MergeOptions {
                obsoleted,
                cutdown,
                max_records: self.options.max_retained,
                newest: now,
            },
        )
    }

    /// Best guess at the site's canonical host.
    pub fn best_host(&self) -> Option<String> {
        let tables = self.tables.lock().expect("memory lock poisoned");
        tables.hosts.best_host().map(String::from)
    }

    /// Number of records currently held in memory.
    pub fn records_in_memory(&self) -> usize {
        let tables = self.tables.lock().expect("memory lock poisoned");
        tables.records.len()
    }
}
