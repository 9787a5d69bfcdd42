//! On-disk rotation layout for one site
//!
//! A site directory holds `data_base` (the consolidated snapshot),
//! `data_current` (the active flush target), `data_fp` (the sorted
//! fingerprint index parallel to the base file), and any number of
//! `data_temp_<YYYYMMDDHHMMSS>[_n]` files: completed snapshots waiting to be
//! merged away. The manager tracks temp files in an in-memory index ordered
//! by (write time, name), guarded by a lock so rotation and cleanup can run
//! from different service threads.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::{Error, Result};

pub const BASE_FILE: &str = "data_base";
pub const CURRENT_FILE: &str = "data_current";
pub const FPRINT_FILE: &str = "data_fp";
pub const HOSTS_FILE: &str = "data_hosts";
const TEMP_PREFIX: &str = "data_temp_";
const STAMP_LEN: usize = 14;

/// A completed snapshot pending consolidation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TempFile {
    pub write_time: i64,
    pub name: String,
    pub size: u64,
}

/// Owns the rotation layout for one site directory.
pub struct RecordFileManager {
    dir: PathBuf,
    max_temp_bytes: Option<u64>,
    temps: Mutex<BTreeSet<TempFile>>,
}

impl RecordFileManager {
    /// Open (creating if needed) a site directory and rebuild the temp-file
    /// index from what is on disk.
    pub fn open<P: AsRef<Path>>(dir: P, max_temp_bytes: Option<u64>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut temps = BTreeSet::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let meta = entry.metadata()?;
            let write_time = meta
                .modified()?
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            temps.insert(TempFile {
                write_time,
                name,
                size: meta.len(),
            });
        }
        if !temps.is_empty() {
            info!(dir = %dir.display(), count = temps.len(), "recovered pending temp files");
        }

        Ok(Self {
            dir,
            max_temp_bytes,
            temps: Mutex::new(temps),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base_path(&self) -> PathBuf {
        self.dir.join(BASE_FILE)
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(CURRENT_FILE)
    }

    pub fn fprint_path(&self) -> PathBuf {
        self.dir.join(FPRINT_FILE)
    }

    pub fn hosts_path(&self) -> PathBuf {
        self.dir.join(HOSTS_FILE)
    }

    /// Rotate `data_current` into a fresh uniquely-named temp file and
    /// register it. Two rotations within the same second get distinct
    /// `_n`-suffixed names. Fails with [`Error::NoCurrentFile`] when there
    /// is nothing to rotate.
    pub fn complete_current_file(&self, now: i64) -> Result<TempFile> {
        let current = self.current_path();
        if !current.exists() {
            return Err(Error::NoCurrentFile);
        }

        let stamp = format_stamp(now);
        let mut temps = self.temps.lock().expect("temp index lock poisoned");

        let mut name = format!("{}{}", TEMP_PREFIX, stamp);
        let mut suffix = 0u32;
        while temps.iter().any(|t| t.name == name) || self.dir.join(&name).exists() {
            suffix += 1;
            name = format!("{}{}_{}", TEMP_PREFIX, stamp, suffix);
        }

        let dest = self.dir.join(&name);
        fs::rename(&current, &dest)?;
        let size = fs::metadata(&dest)?.len();

        let temp = TempFile {
            write_time: now,
            name,
            size,
        };
        temps.insert(temp.clone());
        debug!(file = %temp.name, size, "completed current file");
        Ok(temp)
    }

    /// All pending temp files, oldest first.
    pub fn temp_files(&self) -> Vec<PathBuf> {
        let temps = self.temps.lock().expect("temp index lock poisoned");
        temps.iter().map(|t| self.dir.join(&t.name)).collect()
    }

    /// Temp file names, oldest first.
    pub fn temp_file_names(&self) -> Vec<String> {
        let temps = self.temps.lock().expect("temp index lock poisoned");
        temps.iter().map(|t| t.name.clone()).collect()
    }

    /// Aggregate size of all pending temp files.
    pub fn temp_bytes(&self) -> u64 {
        let temps = self.temps.lock().expect("temp index lock poisoned");
        temps.iter().map(|t| t.size).sum()
    }

    /// Temp files whose embedded timestamp lies in `[begin, end]`.
    ///
    /// The comparison is a string range over the 14-digit stamp substring,
    /// not calendar arithmetic.
    pub fn temp_files_between(&self, begin: i64, end: i64) -> Vec<PathBuf> {
        let lo = format_stamp(begin);
        let hi = format_stamp(end);
        let temps = self.temps.lock().expect("temp index lock poisoned");
        temps
            .iter()
            .filter(|t| {
                matches!(embedded_stamp(&t.name), Some(s) if s >= lo.as_str() && s <= hi.as_str())
            })
            .map(|t| self.dir.join(&t.name))
            .collect()
    }

    /// Enforce the aggregate temp-file byte budget: walk newest to oldest
    /// accumulating size, and once the budget is exceeded delete every older
    /// file. Returns the number of files deleted.
    pub fn clean_up_temp_files(&self) -> Result<usize> {
        let budget = match self.max_temp_bytes {
            Some(b) => b,
            None => return Ok(0),
        };

        let mut temps = self.temps.lock().expect("temp index lock poisoned");
        let mut acc = 0u64;
        let mut evict = Vec::new();
        for temp in temps.iter().rev() {
            acc = acc.saturating_add(temp.size);
            if acc > budget {
                evict.push(temp.clone());
            }
        }

        for temp in &evict {
            let path = self.dir.join(&temp.name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            temps.remove(temp);
            warn!(file = %temp.name, size = temp.size, "evicted temp file over byte budget");
        }
        Ok(evict.len())
    }

    /// Drop consumed temp files from disk and from the index, after a
    /// successful merge.
    pub fn remove_temp_files(&self, names: &[String]) -> Result<()> {
        let mut temps = self.temps.lock().expect("temp index lock poisoned");
        for name in names {
            let path = self.dir.join(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            temps.retain(|t| &t.name != name);
        }
        Ok(())
    }
}

/// Derive a site's directory name from its identifier: every
/// non-alphanumeric character becomes `_`.
pub fn sanitize_site_id(site: &str) -> String {
    site.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn format_stamp(now: i64) -> String {
    match Utc.timestamp_opt(now, 0).single() {
        Some(dt) => dt.format("%Y%m%d%H%M%S").to_string(),
        None => format!("{:0>14}", now.max(0)),
    }
}

/// The 14-digit stamp embedded in a temp file name, if well-formed.
fn embedded_stamp(name: &str) -> Option<&str> {
    let rest = name.strip_prefix(TEMP_PREFIX)?;
    if rest.len() < STAMP_LEN || !rest[..STAMP_LEN].bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(&rest[..STAMP_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_current(mgr: &RecordFileManager, bytes: &[u8]) {
        fs::write(mgr.current_path(), bytes).unwrap();
    }

    #[test]
    fn test_sanitize_site_id() {
        assert_eq!(sanitize_site_id("www.example.com:8080"), "www_example_com_8080");
        assert_eq!(sanitize_site_id("plain123"), "plain123");
    }

    #[test]
    fn test_complete_without_current_fails() {
        let dir = tempdir().unwrap();
        let mgr = RecordFileManager::open(dir.path(), None).unwrap();
        assert!(matches!(
            mgr.complete_current_file(1_700_000_000),
            Err(Error::NoCurrentFile)
        ));
    }

    #[test]
    fn test_complete_rotates_and_registers() {
        let dir = tempdir().unwrap();
        let mgr = RecordFileManager::open(dir.path(), None).unwrap();
        write_current(&mgr, b"snapshot");

        let temp = mgr.complete_current_file(1_700_000_000).unwrap();
        assert!(temp.name.starts_with("data_temp_"));
        assert_eq!(temp.size, 8);
        assert!(!mgr.current_path().exists());
        assert_eq!(mgr.temp_files().len(), 1);
        assert!(dir.path().join(&temp.name).exists());
    }

    #[test]
    fn test_same_second_rotations_get_unique_names() {
        let dir = tempdir().unwrap();
        let mgr = RecordFileManager::open(dir.path(), None).unwrap();

        write_current(&mgr, b"one");
        let a = mgr.complete_current_file(1_700_000_000).unwrap();
        write_current(&mgr, b"two");
        let b = mgr.complete_current_file(1_700_000_000).unwrap();

        assert_ne!(a.name, b.name);
        let files = mgr.temp_file_names();
        assert!(files.contains(&a.name));
        assert!(files.contains(&b.name));
    }

    #[test]
    fn test_range_filter_is_string_based() {
        let dir = tempdir().unwrap();
        let mgr = RecordFileManager::open(dir.path(), None).unwrap();

        for (i, t) in [1_700_000_000i64, 1_700_050_000, 1_700_100_000]
            .iter()
            .enumerate()
        {
            write_current(&mgr, format!("snap{}", i).as_bytes());
            mgr.complete_current_file(*t).unwrap();
        }

        let all = mgr.temp_files_between(1_600_000_000, 1_800_000_000);
        assert_eq!(all.len(), 3);
        let middle = mgr.temp_files_between(1_700_040_000, 1_700_060_000);
        assert_eq!(middle.len(), 1);
        let none = mgr.temp_files_between(1_500_000_000, 1_600_000_000);
        assert!(none.is_empty());
    }

    #[test]
    fn test_cleanup_respects_byte_budget() {
        let dir = tempdir().unwrap();
        let mgr = RecordFileManager::open(dir.path(), Some(10)).unwrap();

        // Three 6-byte snapshots, oldest first.
        for (i, t) in [1_700_000_000i64, 1_700_000_100, 1_700_000_200]
            .iter()
            .enumerate()
        {
            write_current(&mgr, format!("file{:02}", i).as_bytes());
            mgr.complete_current_file(*t).unwrap();
        }

        // Newest-to-oldest accumulation: 6, 12 > 10 -> the two older files go.
        let deleted = mgr.clean_up_temp_files().unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(mgr.temp_files().len(), 1);
        assert_eq!(mgr.temp_bytes(), 6);
    }

    #[test]
    fn test_cleanup_without_budget_is_noop() {
        let dir = tempdir().unwrap();
        let mgr = RecordFileManager::open(dir.path(), None).unwrap();
        write_current(&mgr, b"data");
        mgr.complete_current_file(1_700_000_000).unwrap();
        assert_eq!(mgr.clean_up_temp_files().unwrap(), 0);
        assert_eq!(mgr.temp_files().len(), 1);
    }

    #[test]
    fn test_remove_temp_files() {
        let dir = tempdir().unwrap();
        let mgr = RecordFileManager::open(dir.path(), None).unwrap();
        write_current(&mgr, b"data");
        let temp = mgr.complete_current_file(1_700_000_000).unwrap();

        mgr.remove_temp_files(&[temp.name.clone()]).unwrap();
        assert!(mgr.temp_files().is_empty());
        assert!(!dir.path().join(&temp.name).exists());
    }

    #[test]
    fn test_reopen_recovers_index() {
        let dir = tempdir().unwrap();
        {
            let mgr = RecordFileManager::open(dir.path(), None).unwrap();
            write_current(&mgr, b"data");
            mgr.complete_current_file(1_700_000_000).unwrap();
        }
        let mgr = RecordFileManager::open(dir.path(), None).unwrap();
        assert_eq!(mgr.temp_files().len(), 1);
    }
}
