//! Offline consolidation of record snapshots
//!
//! Folds the base file and all completed temp files (each sorted ascending
//! by fingerprint) into a new base file, applying the pairwise merge rule,
//! an obsoleted-fingerprint set and an age cutoff, and producing retention
//! statistics. Inputs are never mutated; the caller commits the output by
//! rename only after everything is written and flushed, so a crash
//! mid-merge leaves the prior base and temp files untouched.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use urltrack_formats::{
    FprintReader, FprintWriter, RecordReader, RecordWriter, VisitingRecord,
};

use crate::manager::RecordFileManager;
use crate::stat::RecordFileStat;
use crate::{Error, Result};

/// Merge parameters.
///
/// `obsoleted` must be sorted ascending. `max_records = 0` means unlimited.
/// `cutdown` drops records whose `last_access` is older; `newest` anchors
/// the output histogram.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions<'a> {
    pub obsoleted: &'a [u64],
    pub cutdown: i64,
    pub max_records: u64,
    pub newest: i64,
}

/// What a merge did.
#[derive(Debug)]
pub struct MergeOutcome {
    pub retained: u64,
    pub dropped_old: u64,
    pub dropped_obsolete: u64,
    /// Input files skipped whole because they could not be opened or read.
    pub dropped_inputs: usize,
    pub stat: RecordFileStat,
}

/// One input file positioned at its next unconsumed record.
struct MergeReader {
    label: String,
    reader: RecordReader<BufReader<File>>,
    current: (u64, VisitingRecord),
}

enum OpenInput {
    Ready(MergeReader),
    Empty,
    Failed,
}

impl MergeReader {
    /// Open an input and position at its first record. A file that cannot
    /// be opened or read is dropped entirely, not partially salvaged.
    fn open(path: &Path) -> OpenInput {
        let label = path.display().to_string();
        let mut reader = match RecordReader::open(path) {
            Ok(r) => r,
            Err(e) => {
                warn!(file = %label, error = %e, "dropping unreadable merge input");
                return OpenInput::Failed;
            }
        };
        match reader.next() {
            Some(Ok(current)) => OpenInput::Ready(Self {
                label,
                reader,
                current,
            }),
            Some(Err(e)) => {
                warn!(file = %label, error = %e, "dropping corrupt merge input");
                OpenInput::Failed
            }
            None => OpenInput::Empty,
        }
    }

    /// Move to the next record, returning the one previously current.
    /// `None` as the second element means this reader is exhausted (or its
    /// tail is corrupt, which loses the remaining records).
    fn take_and_advance(&mut self) -> ((u64, VisitingRecord), bool) {
        match self.reader.next() {
            Some(Ok(next)) => {
                let prev = std::mem::replace(&mut self.current, next);
                (prev, true)
            }
            Some(Err(e)) => {
                warn!(file = %self.label, error = %e, "corrupt tail in merge input, dropping remainder");
                (self.current_clone(), false)
            }
            None => (self.current_clone(), false),
        }
    }

    fn current_clone(&self) -> (u64, VisitingRecord) {
        self.current.clone()
    }
}

/// Two-pointer scan over the sorted obsoleted set. Valid only because the
/// merge emits fingerprints in ascending order.
struct ObsoleteFilter<'a> {
    set: &'a [u64],
    idx: usize,
}

impl<'a> ObsoleteFilter<'a> {
    fn new(set: &'a [u64]) -> Self {
        Self { set, idx: 0 }
    }

    fn contains(&mut self, fingerprint: u64) -> bool {
        while self.idx < self.set.len() && self.set[self.idx] < fingerprint {
            self.idx += 1;
        }
        self.idx < self.set.len() && self.set[self.idx] == fingerprint
    }
}

/// K-way merge of sorted record files into `out_records` plus a parallel
/// fingerprint index at `out_fprints`.
pub fn merge_record_files(
    inputs: &[PathBuf],
    out_records: &Path,
    out_fprints: &Path,
    opts: MergeOptions<'_>,
) -> Result<MergeOutcome> {
    let mut readers: Vec<MergeReader> = Vec::with_capacity(inputs.len());
    let mut dropped_inputs = 0;
    for path in inputs {
        match MergeReader::open(path) {
            OpenInput::Ready(r) => readers.push(r),
            OpenInput::Empty => {}
            OpenInput::Failed => dropped_inputs += 1,
        }
    }

    let mut record_writer = RecordWriter::create(out_records)?;
    let mut fprint_writer = FprintWriter::create(out_fprints)?;
    let mut stat = RecordFileStat::new(opts.newest);
    let mut obsolete = ObsoleteFilter::new(opts.obsoleted);
    let mut dropped_old = 0u64;
    let mut dropped_obsolete = 0u64;

    let mut emit = |fp: u64,
                    record: VisitingRecord,
                    record_writer: &mut RecordWriter<_>,
                    fprint_writer: &mut FprintWriter<_>,
                    stat: &mut RecordFileStat|
     -> Result<()> {
        if record.last_access < opts.cutdown {
            dropped_old += 1;
            return Ok(());
        }
        if obsolete.contains(fp) {
            dropped_obsolete += 1;
            return Ok(());
        }
        record_writer.write(fp, &record)?;
        fprint_writer.write(fp)?;
        stat.add_record(&record);
        Ok(())
    };

    // Main loop: linear scan for the global minimum fingerprint. N is small
    // (bounded by rotation frequency); switch to a heap only if that stops
    // holding, the observable semantics do not change.
    while readers.len() > 1 {
        let min_fp = readers
            .iter()
            .map(|r| r.current.0)
            .min()
            .expect("readers is non-empty");

        let mut acc: Option<VisitingRecord> = None;
        let mut i = 0;
        while i < readers.len() {
            if readers[i].current.0 != min_fp {
                i += 1;
                continue;
            }
            let ((_, record), alive) = readers[i].take_and_advance();
            acc = Some(match acc {
                Some(merged) => merged.merge(record),
                None => record,
            });
            if alive {
                i += 1;
            } else {
                readers.swap_remove(i);
            }
        }
        let merged = acc.expect("at least one reader held the minimum");
        emit(
            min_fp,
            merged,
            &mut record_writer,
            &mut fprint_writer,
            &mut stat,
        )?;
    }

    // Tail: stream the last reader directly, same filters, no merging.
    if let Some(mut last) = readers.pop() {
        loop {
            let ((fp, record), alive) = last.take_and_advance();
            emit(
                fp,
                record,
                &mut record_writer,
                &mut fprint_writer,
                &mut stat,
            )?;
            if !alive {
                break;
            }
        }
    }

    let retained = record_writer.records_written();
    sync_writer(record_writer)?;
    sync_fprint_writer(fprint_writer)?;

    let mut outcome = MergeOutcome {
        retained,
        dropped_old,
        dropped_obsolete,
        dropped_inputs,
        stat,
    };

    // Over the retained budget: estimate an age cutoff from the histogram
    // and filter the just-written output through a swap file.
    if opts.max_records > 0 && outcome.retained > opts.max_records {
        let cutoff = outcome.stat.cutdown_time(opts.max_records);
        let (retained, stat) =
            remove_old_records(out_records, out_fprints, cutoff, opts.newest)?;
        info!(
            cutoff,
            retained,
            dropped = outcome.retained - retained,
            "second-pass retention trim"
        );
        outcome.retained = retained;
        outcome.stat = stat;
    }

    Ok(outcome)
}

/// Filter a record file in place, keeping records with
/// `last_access >= cutoff`: write survivors to a swap file, then replace
/// the original and rebuild its fingerprint index.
pub fn remove_old_records(
    records_path: &Path,
    fprints_path: &Path,
    cutoff: i64,
    newest: i64,
) -> Result<(u64, RecordFileStat)> {
    let swap_records = records_path.with_extension("swap");
    let swap_fprints = fprints_path.with_extension("swap");

    let reader = RecordReader::open(records_path)?;
    let mut record_writer = RecordWriter::create(&swap_records)?;
    let mut fprint_writer = FprintWriter::create(&swap_fprints)?;
    let mut stat = RecordFileStat::new(newest);

    for entry in reader {
        let (fp, record) = entry?;
        if record.last_access < cutoff {
            continue;
        }
        record_writer.write(fp, &record)?;
        fprint_writer.write(fp)?;
        stat.add_record(&record);
    }

    let retained = record_writer.records_written();
    sync_writer(record_writer)?;
    sync_fprint_writer(fprint_writer)?;
    fs::rename(&swap_records, records_path)?;
    fs::rename(&swap_fprints, fprints_path)?;
    Ok((retained, stat))
}

/// Two-pointer merge/obsoletion over fingerprint-only files, for contexts
/// that reconcile identity without payloads. Output is sorted, de-duplicated
/// and excludes the obsoleted set.
pub fn merge_fprint_files(
    inputs: &[PathBuf],
    output: &Path,
    obsoleted: &[u64],
) -> Result<u64> {
    struct FpReader {
        reader: FprintReader<BufReader<File>>,
        current: u64,
    }

    let mut readers: Vec<FpReader> = Vec::new();
    for path in inputs {
        let mut reader = match FprintReader::open(path) {
            Ok(r) => r,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "dropping unreadable fingerprint input");
                continue;
            }
        };
        match reader.next() {
            Some(Ok(current)) => readers.push(FpReader { reader, current }),
            Some(Err(e)) => {
                warn!(file = %path.display(), error = %e, "dropping corrupt fingerprint input");
            }
            None => {}
        }
    }

    let mut writer = FprintWriter::create(output)?;
    let mut obsolete = ObsoleteFilter::new(obsoleted);

    while !readers.is_empty() {
        let min_fp = readers
            .iter()
            .map(|r| r.current)
            .min()
            .expect("readers is non-empty");

        let mut i = 0;
        while i < readers.len() {
            if readers[i].current != min_fp {
                i += 1;
                continue;
            }
            match readers[i].reader.next() {
                Some(Ok(next)) => {
                    readers[i].current = next;
                    i += 1;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "corrupt tail in fingerprint input, dropping remainder");
                    readers.swap_remove(i);
                }
                None => {
                    readers.swap_remove(i);
                }
            }
        }

        if !obsolete.contains(min_fp) {
            writer.write(min_fp)?;
        }
    }

    let written = writer.written();
    sync_fprint_writer(writer)?;
    Ok(written)
}

/// Consolidate a site: fold the base file and every pending temp file into
/// a fresh base + fingerprint index, then commit atomically (rename over
/// the old base, drop consumed temp files). Must run under the site's file
/// lock so rotation cannot race the input set.
pub fn consolidate(
    manager: &RecordFileManager,
    opts: MergeOptions<'_>,
) -> Result<MergeOutcome> {
    let temp_names = manager.temp_file_names();
    let base = manager.base_path();

    let mut inputs: Vec<PathBuf> = Vec::new();
    if base.exists() {
        inputs.push(base.clone());
    }
    inputs.extend(temp_names.iter().map(|n| manager.dir().join(n)));

    if inputs.is_empty() {
        return Ok(MergeOutcome {
            retained: 0,
            dropped_old: 0,
            dropped_obsolete: 0,
            dropped_inputs: 0,
            stat: RecordFileStat::new(opts.newest),
        });
    }

    let new_base = manager.dir().join(format!("{}.new", crate::manager::BASE_FILE));
    let new_fprints = manager
        .dir()
        .join(format!("{}.new", crate::manager::FPRINT_FILE));

    let outcome = match merge_record_files(&inputs, &new_base, &new_fprints, opts) {
        Ok(o) => o,
        Err(e) => {
            // Nothing has been renamed; the prior base and temps are intact.
            let _ = fs::remove_file(&new_base);
            let _ = fs::remove_file(&new_fprints);
            return Err(e);
        }
    };

    fs::rename(&new_base, &base)?;
    fs::rename(&new_fprints, manager.fprint_path())?;
    manager.remove_temp_files(&temp_names)?;

    info!(
        retained = outcome.retained,
        dropped_old = outcome.dropped_old,
        dropped_obsolete = outcome.dropped_obsolete,
        inputs = inputs.len(),
        "consolidated record files"
    );
    Ok(outcome)
}

fn sync_writer(writer: RecordWriter<std::io::BufWriter<File>>) -> Result<()> {
    let inner = writer.finish()?;
    let file = inner
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

fn sync_fprint_writer(writer: FprintWriter<std::io::BufWriter<File>>) -> Result<()> {
    let inner = writer.finish()?;
    let file = inner
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use urltrack_formats::read_fprints;

    fn rec(url: &str, last_access: i64, count_access: u32, content: i64) -> VisitingRecord {
        VisitingRecord {
            url: url.to_string(),
            first_appear: last_access - 10,
            last_access,
            last_change: last_access,
            count_access,
            count_change: 1,
            last_content: content,
        }
    }

    fn write_file(path: &Path, entries: &[(u64, VisitingRecord)]) {
        let mut writer = RecordWriter::create(path).unwrap();
        for (fp, record) in entries {
            writer.write(*fp, record).unwrap();
        }
        writer.finish().unwrap();
    }

    fn read_all(path: &Path) -> Vec<(u64, VisitingRecord)> {
        RecordReader::open(path)
            .unwrap()
            .collect::<urltrack_formats::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_merge_two_snapshots_same_fingerprint() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_file(&a, &[(5, rec("u", 100, 3, 111))]);
        write_file(&b, &[(5, rec("u", 200, 2, 222))]);

        let out = dir.path().join("out");
        let fp_out = dir.path().join("fp");
        let outcome = merge_record_files(
            &[a, b],
            &out,
            &fp_out,
            MergeOptions {
                newest: 200,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(outcome.retained, 1);
        let entries = read_all(&out);
        assert_eq!(entries.len(), 1);
        let (fp, merged) = &entries[0];
        assert_eq!(*fp, 5);
        assert_eq!(merged.count_access, 5);
        assert_eq!(merged.last_access, 200);
        assert_eq!(merged.last_content, 222);
        assert_eq!(merged.first_appear, 90);
        // Contents differ: change counts sum with no correction.
        assert_eq!(merged.count_change, 2);
    }

    #[test]
    fn test_output_sorted_filtered_and_indexed() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        write_file(&a, &[(2, rec("u2", 500, 1, 0)), (8, rec("u8", 50, 1, 0))]);
        write_file(&b, &[(1, rec("u1", 500, 1, 0)), (4, rec("u4", 500, 1, 0))]);
        write_file(&c, &[(4, rec("u4b", 600, 1, 0)), (9, rec("u9", 700, 1, 0))]);

        let out = dir.path().join("out");
        let fp_out = dir.path().join("fp");
        let obsoleted = [2u64, 7];
        let outcome = merge_record_files(
            &[a, b, c],
            &out,
            &fp_out,
            MergeOptions {
                obsoleted: &obsoleted,
                cutdown: 100, // drops fp=8 (last_access 50)
                max_records: 0,
                newest: 700,
            },
        )
        .unwrap();

        assert_eq!(outcome.dropped_old, 1);
        assert_eq!(outcome.dropped_obsolete, 1);
        assert_eq!(outcome.retained, 3);

        let entries = read_all(&out);
        let fps: Vec<u64> = entries.iter().map(|(fp, _)| *fp).collect();
        assert_eq!(fps, vec![1, 4, 9]);
        for (fp, record) in &entries {
            assert!(!obsoleted.contains(fp));
            assert!(record.last_access >= 100);
        }
        // fp=4 appears in two inputs and must be merged.
        assert_eq!(entries[1].1.count_access, 2);

        // The index file is positionally parallel.
        assert_eq!(read_fprints(&fp_out).unwrap(), fps);
    }

    #[test]
    fn test_corrupt_input_dropped_whole() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good");
        let bad = dir.path().join("bad");
        write_file(&good, &[(1, rec("u1", 500, 1, 0))]);
        fs::write(&bad, b"NOTAFILE").unwrap();

        let out = dir.path().join("out");
        let fp_out = dir.path().join("fp");
        let outcome = merge_record_files(
            &[good, bad],
            &out,
            &fp_out,
            MergeOptions {
                newest: 500,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(outcome.dropped_inputs, 1);
        assert_eq!(outcome.retained, 1);
    }

    #[test]
    fn test_single_input_streams_with_filters() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        write_file(
            &a,
            &[
                (1, rec("u1", 50, 1, 0)),
                (2, rec("u2", 500, 1, 0)),
                (3, rec("u3", 600, 1, 0)),
            ],
        );

        let out = dir.path().join("out");
        let fp_out = dir.path().join("fp");
        let obsoleted = [3u64];
        let outcome = merge_record_files(
            &[a],
            &out,
            &fp_out,
            MergeOptions {
                obsoleted: &obsoleted,
                cutdown: 100,
                max_records: 0,
                newest: 600,
            },
        )
        .unwrap();

        assert_eq!(outcome.retained, 1);
        assert_eq!(read_all(&out)[0].0, 2);
    }

    #[test]
    fn test_max_records_triggers_second_pass() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let newest = 1_000_000_000;
        let mut entries = Vec::new();
        for i in 0..20u64 {
            // Ten recent records, ten records ~50.5 hours old (strictly
            // inside hour bucket 50, so the bucket-edge cutoff drops them).
            let age = if i < 10 { 0 } else { 50 * 3600 + 1800 };
            entries.push((i, rec(&format!("u{}", i), newest - age, 1, 0)));
        }
        write_file(&a, &entries);

        let out = dir.path().join("out");
        let fp_out = dir.path().join("fp");
        let outcome = merge_record_files(
            &[a],
            &out,
            &fp_out,
            MergeOptions {
                obsoleted: &[],
                cutdown: 0,
                max_records: 10,
                newest,
            },
        )
        .unwrap();

        assert!(outcome.retained <= 10, "retained {}", outcome.retained);
        let survivors = read_all(&out);
        assert_eq!(survivors.len() as u64, outcome.retained);
        for (_, record) in &survivors {
            assert_eq!(record.last_access, newest);
        }
        assert_eq!(
            read_fprints(&fp_out).unwrap().len() as u64,
            outcome.retained
        );
    }

    #[test]
    fn test_merge_fprint_files() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        urltrack_formats::write_fprints(&a, &[1, 3, 5, 7]).unwrap();
        urltrack_formats::write_fprints(&b, &[3, 4, 7, 9]).unwrap();

        let out = dir.path().join("out");
        let written = merge_fprint_files(&[a, b], &out, &[4, 9]).unwrap();
        assert_eq!(written, 4);
        assert_eq!(read_fprints(&out).unwrap(), vec![1, 3, 5, 7]);
    }

    #[test]
    fn test_consolidate_commits_and_cleans_temps() {
        let dir = tempdir().unwrap();
        let manager = RecordFileManager::open(dir.path(), None).unwrap();

        // Base with one record, one temp snapshot with another.
        write_file(&manager.base_path(), &[(1, rec("u1", 100, 1, 0))]);
        write_file(&manager.current_path(), &[(2, rec("u2", 200, 1, 0))]);
        manager.complete_current_file(1_700_000_000).unwrap();
        assert_eq!(manager.temp_files().len(), 1);

        let outcome = consolidate(
            &manager,
            MergeOptions {
                newest: 200,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(outcome.retained, 2);
        assert!(manager.temp_files().is_empty());
        let entries = read_all(&manager.base_path());
        assert_eq!(entries.len(), 2);
        assert_eq!(read_fprints(&manager.fprint_path()).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_failed_consolidate_leaves_prior_state() {
        let dir = tempdir().unwrap();
        let manager = RecordFileManager::open(dir.path(), None).unwrap();

        write_file(&manager.base_path(), &[(1, rec("u1", 100, 1, 0))]);
        write_file(&manager.current_path(), &[(2, rec("u2", 200, 1, 0))]);
        manager.complete_current_file(1_700_000_000).unwrap();

        // Make the output path unwritable: a directory where the new base
        // file would go.
        fs::create_dir(dir.path().join("data_base.new")).unwrap();

        let result = consolidate(
            &manager,
            MergeOptions {
                newest: 200,
                ..Default::default()
            },
        );
        assert!(result.is_err());

        // The prior base and the temp file survive untouched.
        let entries = read_all(&manager.base_path());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, 1);
        assert_eq!(manager.temp_files().len(), 1);
    }

    #[test]
    fn test_consolidate_nothing_to_do() {
        let dir = tempdir().unwrap();
        let manager = RecordFileManager::open(dir.path(), None).unwrap();
        let outcome = consolidate(&manager, MergeOptions::default()).unwrap();
        assert_eq!(outcome.retained, 0);
        assert!(!manager.base_path().exists());
    }
}
