//! Host popularity table
//!
//! A small secondary cache mapping host-name fingerprint to visit count,
//! used to guess a site's canonical host. Persisted as a whole, no merge
//! logic.

use std::path::Path;

use ahash::AHashMap;
use urltrack_formats::{load_hosts, save_hosts, HostEntry};

use crate::fingerprint::host_fingerprint;
use crate::Result;

/// Fingerprint-keyed map of host name to visit count.
#[derive(Default)]
pub struct HostTable {
    hosts: AHashMap<u64, HostEntry>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one visit to `host`, creating the entry on first sight.
    pub fn visit_host(&mut self, host: &str) {
        let fingerprint = host_fingerprint(host);
        self.hosts
            .entry(fingerprint)
            .and_modify(|e| e.visits = e.visits.saturating_add(1))
            .or_insert_with(|| HostEntry {
                fingerprint,
                name: host.to_string(),
                visits: 1,
            });
    }

    /// The most-visited host, if any. Ties are resolved arbitrarily.
    pub fn best_host(&self) -> Option<&str> {
        self.hosts
            .values()
            .max_by_key(|e| e.visits)
            .map(|e| e.name.as_str())
    }

    pub fn visits(&self, host: &str) -> u64 {
        self.hosts
            .get(&host_fingerprint(host))
            .map(|e| e.visits)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn clear(&mut self) {
        self.hosts.clear();
    }

    /// Save the whole table to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let entries: Vec<HostEntry> = self.hosts.values().cloned().collect();
        save_hosts(path, &entries)?;
        Ok(())
    }

    /// Replace the table contents from `path`.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.hosts.clear();
        for entry in load_hosts(path)? {
            self.hosts.insert(entry.fingerprint, entry);
        }
        Ok(())
    }
}
