//! Fingerprint index files
//!
//! A flat ascending sequence of 8-byte fingerprints behind an 8-byte magic,
//! positionally parallel to the corresponding record file.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use crate::{Error, Result};

/// Magic + format version for fingerprint index files.
pub const FPRINT_MAGIC: [u8; 8] = *b"UVFP0001";

/// Streaming writer for fingerprint index files.
pub struct FprintWriter<W: Write> {
    inner: W,
    written: u64,
}

impl FprintWriter<BufWriter<File>> {
    /// Create an index file at `path`, truncating any existing file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> FprintWriter<W> {
    pub fn new(mut inner: W) -> Result<Self> {
        inner.write_all(&FPRINT_MAGIC)?;
        Ok(Self { inner, written: 0 })
    }

    pub fn write(&mut self, fingerprint: u64) -> Result<()> {
        self.inner.write_all(&fingerprint.to_le_bytes())?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Streaming reader for fingerprint index files.
pub struct FprintReader<R: Read> {
    inner: R,
    failed: bool,
}

impl FprintReader<BufReader<File>> {
    /// Open an index file, validating its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> FprintReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        inner.read_exact(&mut magic)?;
        if magic != FPRINT_MAGIC {
            return Err(Error::BadMagic {
                expected: FPRINT_MAGIC,
                found: magic,
            });
        }
        Ok(Self {
            inner,
            failed: false,
        })
    }
}

impl<R: Read> Iterator for FprintReader<R> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let mut buf = [0u8; 8];
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return None,
                Ok(0) => {
                    self.failed = true;
                    return Some(Err(Error::Truncated(format!(
                        "EOF after {} of 8 fingerprint bytes",
                        filled
                    ))));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e.into()));
                }
            }
        }
        Some(Ok(u64::from_le_bytes(buf)))
    }
}

/// Read a whole index file into memory.
pub fn read_fprints<P: AsRef<Path>>(path: P) -> Result<Vec<u64>> {
    FprintReader::open(path)?.collect()
}

/// Write a whole index file from a slice.
pub fn write_fprints<P: AsRef<Path>>(path: P, fingerprints: &[u64]) -> Result<()> {
    let mut writer = FprintWriter::create(path)?;
    for &fp in fingerprints {
        writer.write(fp)?;
    }
    writer.finish()?;
    Ok(())
}
