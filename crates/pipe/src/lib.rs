//! Cross-process ingestion channel
//!
//! This crate carries observed-URL events from webserver worker processes
//! into the single tracking service: a fixed-capacity ring of flat,
//! fixed-size events in a file-backed shared-memory segment, with bounded
//! blocking sends and a blocking receive.

pub mod channel;
pub mod error;
pub mod event;
pub mod segment;

pub use channel::{
    UrlPipeReceiver, UrlPipeSender, DEFAULT_REATTACH_INTERVAL, DEFAULT_SEND_TIMEOUT,
};
pub use error::{Error, Result};
pub use event::{RawUrlEvent, EVENT_SIZE, MAX_HOST_BYTES, MAX_URL_BYTES};
