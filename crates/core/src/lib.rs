//! Core URL visit tracking engine
//!
//! This crate provides the fundamental data structures and algorithms for
//! per-site URL visit tracking: fingerprinting, the bounded in-memory
//! aggregation table, the host popularity table, the retention histogram,
//! the on-disk rotation layout and the offline consolidation merge.

pub mod error;
pub mod fingerprint;
pub mod hosts;
pub mod manager;
pub mod merger;
pub mod site;
pub mod stat;
pub mod table;

pub use error::{Error, Result};
pub use fingerprint::{host_fingerprint, normalize_url, url_fingerprint};
pub use hosts::HostTable;
pub use manager::{sanitize_site_id, RecordFileManager, TempFile};
pub use merger::{consolidate, merge_fprint_files, MergeOptions, MergeOutcome};
pub use site::{Site, SiteOptions};
pub use stat::RecordFileStat;
pub use table::{AddOutcome, RecordTable};
