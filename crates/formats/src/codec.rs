//! Versioned binary codec for record files
//!
//! A record file is an 8-byte magic/version header followed by a sequence of
//! (fingerprint, record) entries. All integers are little-endian. Entries are
//! expected to be sorted ascending by fingerprint; the codec itself does not
//! enforce ordering, downstream merging does.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use crate::{Error, Result, VisitingRecord};

/// Magic + format version for record files.
pub const RECORD_MAGIC: [u8; 8] = *b"UVRF0001";

/// Upper bound on a stored URL; longer length prefixes mean corruption.
pub const MAX_URL_BYTES: usize = 64 * 1024;

/// Streaming writer for record files.
pub struct RecordWriter<W: Write> {
    inner: W,
    records_written: u64,
}

impl RecordWriter<BufWriter<File>> {
    /// Create a record file at `path`, truncating any existing file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> RecordWriter<W> {
    /// Wrap a writer, emitting the file header immediately.
    pub fn new(mut inner: W) -> Result<Self> {
        inner.write_all(&RECORD_MAGIC)?;
        Ok(Self {
            inner,
            records_written: 0,
        })
    }

    /// Append one (fingerprint, record) entry.
    pub fn write(&mut self, fingerprint: u64, record: &VisitingRecord) -> Result<()> {
        let url = record.url.as_bytes();
        if url.len() > MAX_URL_BYTES {
            return Err(Error::Corrupt(format!(
                "URL length {} exceeds maximum {}",
                url.len(),
                MAX_URL_BYTES
            )));
        }
        self.inner.write_all(&fingerprint.to_le_bytes())?;
        self.inner.write_all(&(url.len() as u32).to_le_bytes())?;
        self.inner.write_all(url)?;
        self.inner.write_all(&record.first_appear.to_le_bytes())?;
        self.inner.write_all(&record.last_access.to_le_bytes())?;
        self.inner.write_all(&record.last_change.to_le_bytes())?;
        self.inner.write_all(&record.count_access.to_le_bytes())?;
        self.inner.write_all(&record.count_change.to_le_bytes())?;
        self.inner.write_all(&record.last_content.to_le_bytes())?;
        self.records_written += 1;
        Ok(())
    }

    /// Number of records written so far.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Flush and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Streaming reader for record files.
///
/// Iterates `(fingerprint, record)` pairs. A truncated or corrupt entry
/// yields one `Err` item and ends iteration.
pub struct RecordReader<R: Read> {
    inner: R,
    records_read: u64,
    failed: bool,
}

impl RecordReader<BufReader<File>> {
    /// Open a record file, validating its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> RecordReader<R> {
    /// Wrap a reader, consuming and validating the file header.
    pub fn new(mut inner: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        inner.read_exact(&mut magic)?;
        if magic != RECORD_MAGIC {
            return Err(Error::BadMagic {
                expected: RECORD_MAGIC,
                found: magic,
            });
        }
        Ok(Self {
            inner,
            records_read: 0,
            failed: false,
        })
    }

    /// Number of records successfully read so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    fn read_entry(&mut self) -> Result<Option<(u64, VisitingRecord)>> {
        let fingerprint = match read_u64_or_eof(&mut self.inner)? {
            Some(fp) => fp,
            None => return Ok(None),
        };
        let url_len = read_u32(&mut self.inner)? as usize;
        if url_len > MAX_URL_BYTES {
            return Err(Error::Corrupt(format!(
                "URL length {} exceeds maximum {}",
                url_len, MAX_URL_BYTES
            )));
        }
        let mut url_bytes = vec![0u8; url_len];
        self.inner.read_exact(&mut url_bytes)?;
        let url = String::from_utf8(url_bytes)
            .map_err(|e| Error::Corrupt(format!("URL is not valid UTF-8: {}", e)))?;

        let record = VisitingRecord {
            url,
            first_appear: read_i64(&mut self.inner)?,
            last_access: read_i64(&mut self.inner)?,
            last_change: read_i64(&mut self.inner)?,
            count_access: read_u32(&mut self.inner)?,
            count_change: read_u32(&mut self.inner)?,
            last_content: read_i64(&mut self.inner)?,
        };
        self.records_read += 1;
        Ok(Some((fingerprint, record)))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<(u64, VisitingRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Read a u64, returning `None` on a clean EOF at an entry boundary.
fn read_u64_or_eof<R: Read>(reader: &mut R) -> Result<Option<u64>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(Error::Truncated(format!(
                    "EOF after {} of 8 fingerprint bytes",
                    filled
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(u64::from_le_bytes(buf)))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}
