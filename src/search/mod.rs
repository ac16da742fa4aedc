//! Ranked full-text search over schedule items.
//!
//! Documents live in an FTS4 table inside the metadata database and are
//! rewritten per schedule whenever the schedule was refreshed after the last
//! rebuild. Ranking is a weighted per-column BM25, with reminded items
//! boosted above everything else.

pub mod bm25;
pub mod index;

pub use index::{IndexState, SearchIndex};
