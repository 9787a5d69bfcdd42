//! File-backed shared-memory segment
//!
//! The segment is a memory-mapped file: a 64-byte header followed by a ring
//! of fixed-size event slots. The header carries two cross-process
//! synchronization words: a spin-lock guarding cursors and slot contents,
//! and a monotone notify counter the receiver sleeps on. `head` and `tail`
//! are free-running cursors; `head - tail` is the occupied count and
//! `cursor % capacity` picks the slot.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use memmap2::MmapMut;

use crate::event::EVENT_SIZE;
use crate::{Error, Result};

/// Magic + layout version, stored as the first header word.
pub const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"UVPIPE01");

pub const HEADER_SIZE: usize = 64;

const OFF_MAGIC: usize = 0;
const OFF_CAPACITY: usize = 8;
const OFF_HEAD: usize = 16;
const OFF_TAIL: usize = 24;
const OFF_LOCK: usize = 32;
const OFF_NOTIFY: usize = 40;

const LOCK_HELD: u64 = 1;

/// One process's mapping of the shared ring.
pub struct Segment {
    map: MmapMut,
    capacity: u64,
}

impl Segment {
    /// Create (or reinitialize) the segment file for `capacity` event slots.
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Corrupt("segment capacity must be non-zero".into()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let len = HEADER_SIZE as u64 + capacity as u64 * EVENT_SIZE as u64;
        file.set_len(len)?;

        // Safety: the mapping is private to this struct; all shared-word
        // access goes through the aligned atomics below.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let segment = Self {
            map,
            capacity: capacity as u64,
        };
        segment.word(OFF_CAPACITY).store(capacity as u64, Ordering::Relaxed);
        segment.word(OFF_HEAD).store(0, Ordering::Relaxed);
        segment.word(OFF_TAIL).store(0, Ordering::Relaxed);
        segment.word(OFF_LOCK).store(0, Ordering::Relaxed);
        segment.word(OFF_NOTIFY).store(0, Ordering::Relaxed);
        // Publish the magic last so attachers never see a half-built header.
        segment.word(OFF_MAGIC).store(SEGMENT_MAGIC, Ordering::Release);
        Ok(segment)
    }

    /// Attach to an existing segment, validating magic and size.
    pub fn attach<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_SIZE as u64 {
            return Err(Error::Corrupt(format!(
                "segment file is {} bytes, smaller than the header",
                len
            )));
        }

        let map = unsafe { MmapMut::map_mut(&file)? };
        let segment = Self { map, capacity: 0 };
        let magic = segment.word(OFF_MAGIC).load(Ordering::Acquire);
        if magic != SEGMENT_MAGIC {
            return Err(Error::Corrupt(format!(
                "bad segment magic {:#018x}",
                magic
            )));
        }
        let capacity = segment.word(OFF_CAPACITY).load(Ordering::Relaxed);
        let expected = HEADER_SIZE as u64 + capacity * EVENT_SIZE as u64;
        if capacity == 0 || len < expected {
            return Err(Error::Corrupt(format!(
                "segment claims capacity {} but holds {} bytes",
                capacity, len
            )));
        }
        Ok(Self { capacity, ..segment })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Re-check the magic word; false means the owner reinitialized or the
    /// file was replaced underneath us.
    pub fn is_valid(&self) -> bool {
        self.word(OFF_MAGIC).load(Ordering::Acquire) == SEGMENT_MAGIC
    }

    pub fn head(&self) -> u64 {
        self.word(OFF_HEAD).load(Ordering::Acquire)
    }

    pub fn set_head(&self, value: u64) {
        self.word(OFF_HEAD).store(value, Ordering::Release);
    }

    pub fn tail(&self) -> u64 {
        self.word(OFF_TAIL).load(Ordering::Acquire)
    }

    pub fn set_tail(&self, value: u64) {
        self.word(OFF_TAIL).store(value, Ordering::Release);
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> u64 {
        self.head().saturating_sub(self.tail())
    }

    pub fn notify_value(&self) -> u64 {
        self.word(OFF_NOTIFY).load(Ordering::Acquire)
    }

    /// Bump the notify counter, waking a polling receiver.
    pub fn notify(&self) {
        self.word(OFF_NOTIFY).fetch_add(1, Ordering::AcqRel);
    }

    /// Acquire the ring lock, spinning with exponential backoff up to
    /// `timeout`. Returns false on deadline: routine backpressure, not an
    /// error.
    pub fn try_lock(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut backoff_us = 1u64;
        loop {
            if self
                .word(OFF_LOCK)
                .compare_exchange(0, LOCK_HELD, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(1000);
        }
    }

    pub fn unlock(&self) {
        self.word(OFF_LOCK).store(0, Ordering::Release);
    }

    /// Copy a slot's bytes out of the ring.
    pub fn read_slot(&self, cursor: u64, buf: &mut [u8; EVENT_SIZE]) {
        let off = self.slot_offset(cursor);
        buf.copy_from_slice(&self.map[off..off + EVENT_SIZE]);
    }

    /// Slot bytes for writing. Call only while holding the ring lock.
    pub fn slot_mut(&mut self, cursor: u64) -> &mut [u8] {
        let off = self.slot_offset(cursor);
        &mut self.map[off..off + EVENT_SIZE]
    }

    fn slot_offset(&self, cursor: u64) -> usize {
        HEADER_SIZE + (cursor % self.capacity) as usize * EVENT_SIZE
    }

    /// A header word as an atomic. The mapping is page-aligned and every
    /// offset is 8-byte aligned, so the cast is sound; cross-process
    /// visibility comes from MAP_SHARED plus the orderings used above.
    fn word(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= HEADER_SIZE);
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU64) }
    }
}
