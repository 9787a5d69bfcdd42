//! On-disk value types and codecs for URL visit tracking
//!
//! This crate provides the `VisitingRecord` value type and the binary file
//! formats it is persisted in: versioned record files, flat fingerprint
//! index files, and the host table flat file.

pub mod codec;
pub mod error;
pub mod fprint;
pub mod hosts;
pub mod record;

pub use codec::{RecordReader, RecordWriter, RECORD_MAGIC};
pub use error::{Error, Result};
pub use fprint::{read_fprints, write_fprints, FprintReader, FprintWriter, FPRINT_MAGIC};
pub use hosts::{load_hosts, save_hosts, HostEntry, HOST_MAGIC};
pub use record::{VisitingRecord, CONTENT_DELTA_THRESHOLD};
