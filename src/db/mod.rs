mod migrations;
pub mod repository;
pub mod schema;

pub use repository::{Repository, SeedMerge};
