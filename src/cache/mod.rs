//! Request -> response cache.
//!
//! Entries are addressed by a fingerprint of method + URL. Lookups may ignore
//! the query string so that paged or filtered requests find the snapshot of
//! the full resource they were derived from.

mod key;
mod storage;

pub use key::RequestFingerprint;
pub use storage::{CachedRequest, MatchOptions, ResponseCache};
