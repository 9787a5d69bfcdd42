//! Host table flat file
//!
//! Unlike record files, the host table is a small flat array of fixed-size
//! entries loaded and saved as a whole. Each entry is 144 bytes:
//! fingerprint (8) + visit count (8) + name length (2) + 126 name bytes,
//! zero-padded.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::warn;

use crate::{Error, Result};

/// Magic + format version for host table files.
pub const HOST_MAGIC: [u8; 8] = *b"UVHT0001";

/// Maximum stored host-name length in bytes.
pub const MAX_HOST_NAME_BYTES: usize = 126;

const ENTRY_SIZE: usize = 8 + 8 + 2 + MAX_HOST_NAME_BYTES;

/// One host and its accumulated visit count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub fingerprint: u64,
    pub name: String,
    pub visits: u64,
}

/// Save all host entries to `path`, replacing the file.
///
/// Names longer than [`MAX_HOST_NAME_BYTES`] are truncated at a character
/// boundary; the fingerprint still identifies the full name.
pub fn save_hosts<P: AsRef<Path>>(path: P, entries: &[HostEntry]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&HOST_MAGIC)?;
    for entry in entries {
        let name = truncated_name(&entry.name);
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0..8].copy_from_slice(&entry.fingerprint.to_le_bytes());
        buf[8..16].copy_from_slice(&entry.visits.to_le_bytes());
        buf[16..18].copy_from_slice(&(name.len() as u16).to_le_bytes());
        buf[18..18 + name.len()].copy_from_slice(name.as_bytes());
        writer.write_all(&buf)?;
    }
    writer.flush()?;
    Ok(())
}

/// Load all host entries from `path`.
pub fn load_hosts<P: AsRef<Path>>(path: P) -> Result<Vec<HostEntry>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if magic != HOST_MAGIC {
        return Err(Error::BadMagic {
            expected: HOST_MAGIC,
            found: magic,
        });
    }

    let mut entries = Vec::new();
    let mut buf = [0u8; ENTRY_SIZE];
    loop {
        if !read_entry(&mut reader, &mut buf)? {
            break;
        }
        let fingerprint = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let visits = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let name_len = u16::from_le_bytes(buf[16..18].try_into().unwrap()) as usize;
        if name_len > MAX_HOST_NAME_BYTES {
            return Err(Error::Corrupt(format!(
                "host name length {} exceeds maximum {}",
                name_len, MAX_HOST_NAME_BYTES
            )));
        }
        let name = std::str::from_utf8(&buf[18..18 + name_len])
            .map_err(|e| Error::Corrupt(format!("host name is not valid UTF-8: {}", e)))?
            .to_string();
        entries.push(HostEntry {
            fingerprint,
            name,
            visits,
        });
    }
    Ok(entries)
}

/// Read one full entry into `buf`; false on clean EOF at an entry boundary.
fn read_entry<R: Read>(reader: &mut R, buf: &mut [u8; ENTRY_SIZE]) -> Result<bool> {
    let mut filled = 0;
    while filled < ENTRY_SIZE {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(Error::Truncated(format!(
                    "EOF after {} of {} host entry bytes",
                    filled, ENTRY_SIZE
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn truncated_name(name: &str) -> &str {
    if name.len() <= MAX_HOST_NAME_BYTES {
        return name;
    }
    warn!(host = %name, "host name exceeds {} bytes, truncating", MAX_HOST_NAME_BYTES);
    let mut end = MAX_HOST_NAME_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
