//! URL and host fingerprinting
//!
//! Fingerprints are 64-bit seahash values over normalized strings and are
//! the sole identity key everywhere: table lookups, file ordering, merges.
//! Collisions are assumed not to occur and are not detected.

use seahash::hash;

/// Compute the fingerprint of a URL after normalization.
pub fn url_fingerprint(url: &str) -> u64 {
    hash(normalize_url(url).as_bytes())
}

/// Compute the fingerprint of a host name (case-insensitive).
pub fn host_fingerprint(host: &str) -> u64 {
    hash(host.to_lowercase().as_bytes())
}

/// Normalize a URL for fingerprinting: everything up to the query string is
/// lower-cased (scheme, host, path); the query string is preserved
/// byte-for-byte because its case can be significant.
pub fn normalize_url(url: &str) -> String {
    match url.split_once('?') {
        Some((base, query)) => {
            let mut normalized = base.to_lowercase();
            normalized.push('?');
            normalized.push_str(query);
            normalized
        }
        None => url.to_lowercase(),
    }
}
