//! Discovery of known schedules from the published menu.

pub mod state;
pub mod updater;

pub use state::SeedState;
pub use updater::{SeedOutcome, SeedUpdater};
