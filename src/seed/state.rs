use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Bookkeeping for menu updates. Read at startup, handed to
/// [`SeedUpdater::update`](super::SeedUpdater::update) and written back once
/// a merge went through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedState {
    /// Highest schedule version merged so far.
    #[serde(default)]
    pub last_seed_version: u32,

    /// Last time the server confirmed the menu.
    #[serde(default)]
    pub last_seed_check: Option<DateTime<Utc>>,
}

impl SeedState {
    /// A missing file is a first run; an unreadable one is logged and treated
    /// the same way.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        match toml::from_str(&content) {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!("Ignoring corrupt seed state {:?}: {}", path, e);
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write seed state: {}", path.display()))?;
        Ok(())
    }

    pub fn online_check_due(&self, interval_hours: u32, now: DateTime<Utc>) -> bool {
        match self.last_seed_check {
            Some(last) => now - last >= Duration::hours(interval_hours.into()),
            None => true,
        }
    }
}
