//! On-disk blob cache for downloaded schedules.
//!
//! One file per URL, named after a digest of the URL. Replacements are staged
//! in a temporary file and become visible through a single rename, so readers
//! only ever see complete, previously accepted downloads.

pub mod store;

pub use store::{url_digest, CacheEntry, CacheStore, Staging};
