use std::io::Read;
use std::sync::Arc;

use chrono::Utc;
use flate2::read::GzDecoder;

use crate::config::Config;
use crate::db::{Repository, SeedMerge};
use crate::error::Result;
use crate::fetch::{FetchPolicy, Fetcher, Provenance};
use crate::models::{Seed, SeedSchedule};

use super::state::SeedState;

const BUILT_IN_SEED: &str = include_str!("../../data/menu.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    /// Neither the remote nor the built-in menu could be read.
    Unavailable,
    /// Menu and database were already current.
    UpToDate { version: u32 },
    Merged { version: u32, inserted: usize },
}

/// Keeps the list of known schedules in step with the published menu.
pub struct SeedUpdater {
    fetcher: Arc<Fetcher>,
    repo: Repository,
    seed_url: String,
    check_interval_hours: u32,
}

impl SeedUpdater {
    pub fn new(fetcher: Arc<Fetcher>, repo: Repository, config: &Config) -> Self {
        Self {
            fetcher,
            repo,
            seed_url: config.seed_url.clone(),
            check_interval_hours: config.seed_check_interval_hours,
        }
    }

    /// Merge the best available menu into the store.
    ///
    /// The server is asked for a new menu when `force_online` is set or the
    /// last confirmed check is older than the configured interval; otherwise
    /// the cached copy is used. The built-in menu wins whenever it is newer.
    pub async fn update(&self, state: &mut SeedState, force_online: bool) -> Result<SeedOutcome> {
        let now = Utc::now();
        let check_online =
            force_online || state.online_check_due(self.check_interval_hours, now);
        let policy = if check_online {
            FetchPolicy::Fetch
        } else {
            FetchPolicy::CacheOrFetch
        };

        let remote = self.load_remote(policy).await;
        if check_online && remote.as_ref().is_some_and(|(_, p)| p.is_fresh()) {
            state.last_seed_check = Some(now);
        }

        let seed = match (remote.map(|(seed, _)| seed), built_in_seed()) {
            (Some(remote), Some(local)) if local.version > remote.version => local,
            (Some(remote), _) => remote,
            (None, Some(local)) => local,
            (None, None) => {
                tracing::warn!("Failed to load both seeds");
                return Ok(SeedOutcome::Unavailable);
            }
        };

        let upgraded_from = self.repo.upgraded_from();
        if seed.version <= state.last_seed_version && upgraded_from.is_none() {
            tracing::debug!("Already up to date: {}", state.last_seed_version);
            return Ok(SeedOutcome::UpToDate {
                version: state.last_seed_version,
            });
        }

        // Databases from before version 8 lack start/end times.
        let backfill = matches!(upgraded_from, Some(v) if v > 0 && v < 8);
        let mut newest = state.last_seed_version;
        let mut inserted = 0;
        for schedule in &seed.schedules {
            newest = newest.max(schedule.version);
            let merged = self
                .repo
                .merge_seed_schedule(schedule, state.last_seed_version, backfill)
                .await?;
            if merged == SeedMerge::Inserted {
                inserted += 1;
            }
        }

        state.last_seed_version = newest;
        tracing::info!(
            "Merged seed version {} ({} new schedules)",
            seed.version,
            inserted
        );
        Ok(SeedOutcome::Merged {
            version: newest,
            inserted,
        })
    }

    async fn load_remote(&self, policy: FetchPolicy) -> Option<(Seed, Provenance)> {
        let mut download = match self.fetcher.fetch(&self.seed_url, policy).await {
            Ok(download) => download,
            Err(e) => {
                tracing::warn!("Could not load seed from {}: {}", self.seed_url, e);
                return None;
            }
        };

        let parsed = download
            .text()
            .await
            .and_then(|json| serde_json::from_str::<Seed>(&json).map_err(Into::into));
        let provenance = download.provenance();

        match parsed {
            Ok(seed) => {
                if let Err(e) = download.keep().await {
                    tracing::warn!("Could not cache seed: {}", e);
                }
                tracing::debug!("Fetched seed version {} ({:?})", seed.version, provenance);
                Some((seed, provenance))
            }
            Err(e) => {
                tracing::error!("Seed parse error: {}", e);
                if let Err(e) = download.cancel().await {
                    tracing::warn!("Could not discard seed download: {}", e);
                }
                None
            }
        }
    }

    /// Add or replace a single schedule from a shared descriptor, plain JSON or
    /// gzipped. Returns `false` if the bytes are not a descriptor.
    pub async fn import_descriptor(&self, bytes: &[u8]) -> Result<bool> {
        let Some(entry) = parse_descriptor(bytes) else {
            return Ok(false);
        };
        tracing::debug!("Importing descriptor for {}", entry.url);

        self.repo.remove_schedule(&entry.url).await?;
        self.fetcher.cache().invalidate(&entry.url).await?;
        self.repo.merge_seed_schedule(&entry, 0, false).await?;
        Ok(true)
    }
}

fn built_in_seed() -> Option<Seed> {
    match serde_json::from_str(BUILT_IN_SEED) {
        Ok(seed) => Some(seed),
        Err(e) => {
            tracing::error!("Built-in seed is corrupt: {}", e);
            None
        }
    }
}

fn parse_descriptor(bytes: &[u8]) -> Option<SeedSchedule> {
    let looks_like_json = std::str::from_utf8(bytes).is_ok_and(|s| s.trim_start().starts_with('{'));
    if looks_like_json {
        return match serde_json::from_slice(bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!("Not a schedule descriptor: {}", e);
                None
            }
        };
    }

    tracing::debug!("Trying gunzip on {} bytes", bytes.len());
    let mut plain = Vec::new();
    if let Err(e) = GzDecoder::new(bytes).read_to_end(&mut plain) {
        tracing::debug!("gunzip: {}", e);
        return None;
    }
    if !std::str::from_utf8(&plain).is_ok_and(|s| s.trim_start().starts_with('{')) {
        return None;
    }
    parse_descriptor(&plain)
}
