//! Offline-first storage for published event schedules.
//!
//! [`fetch::Fetcher`] downloads schedules under a caching policy and keeps the
//! last accepted copy of each in a [`cache::CacheStore`]. [`db::Repository`]
//! remembers which schedules are known and what the user did with their
//! items, and [`search::SearchIndex`] ranks items for a text query.
//! [`app::Services`] wires them together from a [`config::Config`].

pub mod app;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod models;
pub mod search;
pub mod seed;

pub use app::Services;
pub use config::Config;
pub use error::{AppError, Result};
