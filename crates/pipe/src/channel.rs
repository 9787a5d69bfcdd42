//! Bounded cross-process channel for URL observations
//!
//! Many sender processes, exactly one receiver. The protocol over the
//! shared ring:
//!
//! - `send` acquires the ring lock with a bounded timeout; a timeout is
//!   routine backpressure and reports zero events written. As many events
//!   as fit are copied in (short writes are allowed, callers handle partial
//!   acceptance), the lock is released, then the notify counter is bumped.
//! - `recv` waits for data with no timeout, then runs a two-phase exchange:
//!   one lock hold to copy the occupied slots out, a second one solely to
//!   advance the consumed cursor. Decoding happens between the two, outside
//!   the lock, so slow consumers never stall senders.
//!
//! A sender that finds its mapping invalid (the receiver restarted, the
//! file was replaced) releases everything and lazily reattaches, no more
//! often than the reattach interval.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::event::{RawUrlEvent, EVENT_SIZE};
use crate::segment::Segment;
use crate::{Error, Result};

/// Default bound on how long a sender may block the request path.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Minimum interval between reattachment attempts after a failure.
pub const DEFAULT_REATTACH_INTERVAL: Duration = Duration::from_secs(10);

/// Receiver poll period while the ring is empty.
const IDLE_POLL: Duration = Duration::from_millis(2);

/// The single consuming end of the pipe. Owns the segment: creation
/// failure is fatal to the service.
pub struct UrlPipeReceiver {
    segment: Segment,
}

impl UrlPipeReceiver {
    /// Create the shared segment with room for `capacity` events.
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let segment = Segment::create(&path, capacity)?;
        info!(
            path = %path.as_ref().display(),
            capacity,
            "created ingestion pipe"
        );
        Ok(Self { segment })
    }

    /// Block until events arrive, then drain and return them in send order.
    pub fn recv(&mut self) -> Result<Vec<RawUrlEvent>> {
        // Phase 0: the notify counter is bumped after every successful
        // send, but occupancy is the actual wait condition so data already
        // in the ring is seen even when the bump predates this call.
        while self.segment.occupied() == 0 {
            std::thread::park_timeout(IDLE_POLL);
        }

        // Phase 1: copy the occupied slots out under the lock.
        while !self.segment.try_lock(Duration::from_secs(5)) {
            warn!("receiver waiting on ring lock");
        }
        let tail = self.segment.tail();
        let head = self.segment.head();
        let count = head.saturating_sub(tail);
        let mut raw = Vec::with_capacity(count as usize);
        let mut slot = [0u8; EVENT_SIZE];
        for cursor in tail..head {
            self.segment.read_slot(cursor, &mut slot);
            raw.push(slot);
        }
        self.segment.unlock();

        // Decode outside the lock; a corrupt slot is dropped, not fatal.
        let mut events = Vec::with_capacity(raw.len());
        for bytes in &raw {
            match RawUrlEvent::decode(bytes) {
                Ok(event) => events.push(event),
                Err(e) => warn!(error = %e, "dropping undecodable event slot"),
            }
        }

        // Phase 2: retake the lock just to advance the consumed cursor.
        while !self.segment.try_lock(Duration::from_secs(5)) {
            warn!("receiver waiting on ring lock to advance cursor");
        }
        self.segment.set_tail(tail + count);
        self.segment.unlock();

        debug!(count = events.len(), "received events");
        Ok(events)
    }
}

/// A producing end of the pipe. Attachment is lazy and failures are
/// deferred: the webserver worker must never be taken down by the pipe.
pub struct UrlPipeSender {
    path: PathBuf,
    send_timeout: Duration,
    reattach_interval: Duration,
    segment: Option<Segment>,
    last_attach_failure: Option<Instant>,
}

impl UrlPipeSender {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_timeouts(path, DEFAULT_SEND_TIMEOUT, DEFAULT_REATTACH_INTERVAL)
    }

    pub fn with_timeouts<P: AsRef<Path>>(
        path: P,
        send_timeout: Duration,
        reattach_interval: Duration,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            send_timeout,
            reattach_interval,
            segment: None,
            last_attach_failure: None,
        }
    }

    /// Offer events to the ring. Returns how many were accepted: zero on
    /// lock timeout or a full ring ("try later"), fewer than offered when
    /// only part fits. Errors mean the segment is unreachable and the
    /// reattach rate limit has not elapsed.
    pub fn send(&mut self, events: &[RawUrlEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        // One reattach retry per call, rate-limited.
        if self.segment.as_ref().is_some_and(|s| !s.is_valid()) {
            warn!("pipe segment went invalid, detaching");
            self.segment = None;
        }
        if self.segment.is_none() {
            self.try_attach()?;
        }
        let segment = self.segment.as_mut().expect("attached above");

        if !segment.try_lock(self.send_timeout) {
            return Ok(0);
        }

        let head = segment.head();
        let tail = segment.tail();
        let free = segment.capacity().saturating_sub(head.saturating_sub(tail));
        let accepted = (events.len() as u64).min(free) as usize;
        for (i, event) in events[..accepted].iter().enumerate() {
            event.encode(segment.slot_mut(head + i as u64));
        }
        segment.set_head(head + accepted as u64);
        segment.unlock();

        if accepted > 0 {
            segment.notify();
        }
        Ok(accepted)
    }

    fn try_attach(&mut self) -> Result<()> {
        if let Some(last) = self.last_attach_failure {
            if last.elapsed() < self.reattach_interval {
                return Err(Error::Detached(format!(
                    "attach to {} failed recently, retry later",
                    self.path.display()
                )));
            }
        }
        match Segment::attach(&self.path) {
            Ok(segment) => {
                info!(path = %self.path.display(), "attached to ingestion pipe");
                self.segment = Some(segment);
                self.last_attach_failure = None;
                Ok(())
            }
            Err(e) => {
                self.last_attach_failure = Some(Instant::now());
                Err(Error::Detached(format!(
                    "cannot attach to {}: {}",
                    self.path.display(),
                    e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(url: &str) -> RawUrlEvent {
        RawUrlEvent::new(url, "a.example", 1).unwrap()
    }

    #[test]
    fn test_send_bumps_notify_counter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipe");
        let _receiver = UrlPipeReceiver::create(&path, 8).unwrap();
        let observer = Segment::attach(&path).unwrap();
        let mut sender = UrlPipeSender::new(&path);

        let before = observer.notify_value();
        sender.send(&[event("u")]).unwrap();
        assert_eq!(observer.notify_value(), before + 1);
    }

    #[test]
    fn test_send_then_receive_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipe");
        let mut receiver = UrlPipeReceiver::create(&path, 64).unwrap();
        let mut sender = UrlPipeSender::new(&path);

        let batch: Vec<RawUrlEvent> = (0..10).map(|i| event(&format!("http://a.example/{}", i))).collect();
        assert_eq!(sender.send(&batch).unwrap(), 10);

        let received = receiver.recv().unwrap();
        assert_eq!(received.len(), 10);
        for (i, event) in received.iter().enumerate() {
            assert_eq!(event.url().unwrap(), format!("http://a.example/{}", i));
        }
    }

    #[test]
    fn test_receive_blocks_until_new_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipe");
        let mut receiver = UrlPipeReceiver::create(&path, 64).unwrap();
        let mut sender = UrlPipeSender::new(&path);

        sender.send(&[event("http://a.example/1")]).unwrap();
        assert_eq!(receiver.recv().unwrap().len(), 1);

        // A second recv must block until the sender produces again.
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let mut sender = UrlPipeSender::new(&path);
            sender.send(&[event("http://a.example/2")]).unwrap();
        });
        let start = Instant::now();
        let received = receiver.recv().unwrap();
        handle.join().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].url().unwrap(), "http://a.example/2");
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_short_write_on_full_ring() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipe");
        let mut receiver = UrlPipeReceiver::create(&path, 4).unwrap();
        let mut sender = UrlPipeSender::new(&path);

        let batch: Vec<RawUrlEvent> = (0..6).map(|i| event(&format!("u{}", i))).collect();
        assert_eq!(sender.send(&batch).unwrap(), 4);
        // Ring is full: nothing more fits.
        assert_eq!(sender.send(&batch[4..]).unwrap(), 0);

        assert_eq!(receiver.recv().unwrap().len(), 4);
        // Space again; cursors wrap around the ring.
        assert_eq!(sender.send(&batch[4..]).unwrap(), 2);
        let received = receiver.recv().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].url().unwrap(), "u4");
    }

    #[test]
    fn test_send_times_out_while_lock_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipe");
        let _receiver = UrlPipeReceiver::create(&path, 4).unwrap();

        // A third party holds the ring lock.
        let blocker = Segment::attach(&path).unwrap();
        assert!(blocker.try_lock(Duration::from_millis(10)));

        let mut sender = UrlPipeSender::with_timeouts(
            &path,
            Duration::from_millis(30),
            DEFAULT_REATTACH_INTERVAL,
        );
        // Timeout is backpressure, not an error.
        assert_eq!(sender.send(&[event("u")]).unwrap(), 0);
        blocker.unlock();
        assert_eq!(sender.send(&[event("u")]).unwrap(), 1);
    }

    #[test]
    fn test_sender_defers_attach_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent");
        let mut sender = UrlPipeSender::with_timeouts(
            &path,
            DEFAULT_SEND_TIMEOUT,
            Duration::from_millis(50),
        );

        assert!(matches!(
            sender.send(&[event("u")]),
            Err(Error::Detached(_))
        ));
        // Within the rate limit: no filesystem retry, same failure.
        assert!(matches!(
            sender.send(&[event("u")]),
            Err(Error::Detached(_))
        ));

        // Once the segment exists and the interval elapses, send recovers.
        let mut receiver = UrlPipeReceiver::create(&path, 4).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(sender.send(&[event("u")]).unwrap(), 1);
        assert_eq!(receiver.recv().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_senders() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipe");
        let mut receiver = UrlPipeReceiver::create(&path, 1024).unwrap();

        let mut handles = Vec::new();
        for t in 0..4 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let mut sender = UrlPipeSender::new(&path);
                for i in 0..25 {
                    let e = event(&format!("http://a.example/{}/{}", t, i));
                    while sender.send(std::slice::from_ref(&e)).unwrap() == 0 {}
                }
            }));
        }

        let mut total = 0;
        while total < 100 {
            total += receiver.recv().unwrap().len();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(total, 100);
    }
}
