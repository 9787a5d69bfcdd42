//! Fixed-size wire unit for observed URLs
//!
//! Events cross a process boundary through shared memory, so the layout is
//! flat and pointer-free: bounded byte arrays with explicit lengths instead
//! of heap strings, and every length is validated on read rather than
//! trusting NUL termination.

use crate::{Error, Result};

/// Maximum URL length carried on the wire.
pub const MAX_URL_BYTES: usize = 512;
/// Maximum host-name length carried on the wire.
pub const MAX_HOST_BYTES: usize = 128;

/// Encoded size of one event slot.
pub const EVENT_SIZE: usize = 2 + MAX_URL_BYTES + 2 + MAX_HOST_BYTES + 4 + 8 + 8 + 8 + 2;

/// One raw URL observation from a webserver worker.
///
/// Timestamps of 0 mean "not supplied by the producer".
#[derive(Clone)]
pub struct RawUrlEvent {
    url: [u8; MAX_URL_BYTES],
    url_len: u16,
    host: [u8; MAX_HOST_BYTES],
    host_len: u16,
    pub site_id: u32,
    pub content_len: i64,
    pub last_modified: i64,
    pub file_write_time: i64,
    pub http_status: u16,
}

impl RawUrlEvent {
    pub fn new(url: &str, host: &str, site_id: u32) -> Result<Self> {
        if url.len() > MAX_URL_BYTES {
            return Err(Error::FieldTooLong {
                field: "url",
                len: url.len(),
                max: MAX_URL_BYTES,
            });
        }
        if host.len() > MAX_HOST_BYTES {
            return Err(Error::FieldTooLong {
                field: "host",
                len: host.len(),
                max: MAX_HOST_BYTES,
            });
        }

        let mut url_buf = [0u8; MAX_URL_BYTES];
        url_buf[..url.len()].copy_from_slice(url.as_bytes());
        let mut host_buf = [0u8; MAX_HOST_BYTES];
        host_buf[..host.len()].copy_from_slice(host.as_bytes());

        Ok(Self {
            url: url_buf,
            url_len: url.len() as u16,
            host: host_buf,
            host_len: host.len() as u16,
            site_id,
            content_len: 0,
            last_modified: 0,
            file_write_time: 0,
            http_status: 200,
        })
    }

    /// The observed URL. The stored length is validated on every call.
    pub fn url(&self) -> Result<&str> {
        bounded_str("url", &self.url, self.url_len)
    }

    /// The requested host. The stored length is validated on every call.
    pub fn host(&self) -> Result<&str> {
        bounded_str("host", &self.host, self.host_len)
    }

    pub fn last_modified_opt(&self) -> Option<i64> {
        (self.last_modified > 0).then_some(self.last_modified)
    }

    pub fn file_write_time_opt(&self) -> Option<i64> {
        (self.file_write_time > 0).then_some(self.file_write_time)
    }

    /// Serialize into one event slot. `buf` must hold [`EVENT_SIZE`] bytes.
    pub(crate) fn encode(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.url_len.to_le_bytes());
        buf[2..2 + MAX_URL_BYTES].copy_from_slice(&self.url);
        let off = 2 + MAX_URL_BYTES;
        buf[off..off + 2].copy_from_slice(&self.host_len.to_le_bytes());
        buf[off + 2..off + 2 + MAX_HOST_BYTES].copy_from_slice(&self.host);
        let off = off + 2 + MAX_HOST_BYTES;
        buf[off..off + 4].copy_from_slice(&self.site_id.to_le_bytes());
        buf[off + 4..off + 12].copy_from_slice(&self.content_len.to_le_bytes());
        buf[off + 12..off + 20].copy_from_slice(&self.last_modified.to_le_bytes());
        buf[off + 20..off + 28].copy_from_slice(&self.file_write_time.to_le_bytes());
        buf[off + 28..off + 30].copy_from_slice(&self.http_status.to_le_bytes());
    }

    /// Deserialize one event slot, validating both length fields.
    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < EVENT_SIZE {
            return Err(Error::Corrupt(format!(
                "event slot is {} bytes, expected {}",
                buf.len(),
                EVENT_SIZE
            )));
        }

        let url_len = u16::from_le_bytes(buf[0..2].try_into().unwrap());
        let mut url = [0u8; MAX_URL_BYTES];
        url.copy_from_slice(&buf[2..2 + MAX_URL_BYTES]);
        let off = 2 + MAX_URL_BYTES;
        let host_len = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap());
        let mut host = [0u8; MAX_HOST_BYTES];
        host.copy_from_slice(&buf[off + 2..off + 2 + MAX_HOST_BYTES]);
        let off = off + 2 + MAX_HOST_BYTES;

        let event = Self {
            url,
            url_len,
            host,
            host_len,
            site_id: u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()),
            content_len: i64::from_le_bytes(buf[off + 4..off + 12].try_into().unwrap()),
            last_modified: i64::from_le_bytes(buf[off + 12..off + 20].try_into().unwrap()),
            file_write_time: i64::from_le_bytes(buf[off + 20..off + 28].try_into().unwrap()),
            http_status: u16::from_le_bytes(buf[off + 28..off + 30].try_into().unwrap()),
        };
        // Reject bad lengths at the boundary instead of on every accessor.
        event.url()?;
        event.host()?;
        Ok(event)
    }
}

impl std::fmt::Debug for RawUrlEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawUrlEvent")
            .field("url", &self.url().unwrap_or("<invalid>"))
            .field("host", &self.host().unwrap_or("<invalid>"))
            .field("site_id", &self.site_id)
            .field("content_len", &self.content_len)
            .field("http_status", &self.http_status)
            .finish()
    }
}

fn bounded_str<'a>(field: &'static str, buf: &'a [u8], len: u16) -> Result<&'a str> {
    let len = len as usize;
    if len > buf.len() {
        return Err(Error::Corrupt(format!(
            "{} length {} exceeds buffer size {}",
            field,
            len,
            buf.len()
        )));
    }
    std::str::from_utf8(&buf[..len])
        .map_err(|e| Error::Corrupt(format!("{} is not valid UTF-8: {}", field, e)))
}
