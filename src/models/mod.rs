mod schedule;
mod seed;

pub use schedule::*;
pub use seed::*;
