//! Cache-aware downloads.
//!
//! [`Fetcher::fetch`] resolves a URL under a [`FetchPolicy`] to a [`Download`]:
//! a chunked byte stream tagged with where the bytes came from. Network bodies
//! run through a fixed pipeline (progress meter, gunzip, tee into a cache
//! staging file) and only replace the cached copy once the caller calls
//! [`Download::keep`].

pub mod fetcher;
pub mod network;
mod pipeline;

pub use fetcher::{Download, FetchPolicy, Fetcher, Provenance};
pub use network::NetworkStatus;
