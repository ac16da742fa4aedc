use std::path::Path;
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::db::Repository;
use crate::error::Result;
use crate::fetch::{Fetcher, NetworkStatus};
use crate::models::{apply_overrides, Item, ScheduleDescriptor, ScheduleRecord};
use crate::search::SearchIndex;
use crate::seed::{SeedOutcome, SeedState, SeedUpdater};

/// Everything an application needs, wired to one configuration.
pub struct Services {
    pub config: Config,
    pub network: NetworkStatus,
    pub fetcher: Arc<Fetcher>,
    pub repository: Repository,
    pub search: SearchIndex,
    pub seeds: SeedUpdater,
}

impl Services {
    pub async fn new(config: Config) -> Result<Self> {
        let network = NetworkStatus::default();
        let cache = CacheStore::new(&config.cache_dir)?;
        let fetcher = Arc::new(Fetcher::new(&config, cache, network.clone())?);
        let repository = Repository::new(&config.db_path).await?;
        let search = SearchIndex::new(repository.connection());
        let seeds = SeedUpdater::new(fetcher.clone(), repository.clone(), &config);

        if let Some(from) = repository.upgraded_from() {
            tracing::info!("Database at {} upgraded from version {}", config.db_path, from);
        }

        Ok(Self {
            config,
            network,
            fetcher,
            repository,
            search,
            seeds,
        })
    }

    pub fn cache(&self) -> &CacheStore {
        self.fetcher.cache()
    }

    /// Record a freshly parsed schedule, put the user's flags back on its
    /// items and bring its search index up to date.
    pub async fn open_schedule(
        &self,
        desc: ScheduleDescriptor,
        items: &mut [Item],
        fresh: bool,
    ) -> Result<ScheduleRecord> {
        let record = self.repository.upsert_schedule(desc, fresh).await?;

        let overrides = self.repository.load_overrides(record.id).await?;
        let applied = apply_overrides(items, &overrides);
        tracing::debug!("Applied {} of {} stored item flags", applied, overrides.len());

        if let Err(e) = self.search.rebuild(record.id, items).await {
            tracing::warn!("Indexing schedule {} failed: {}", record.id, e);
        }
        Ok(record)
    }

    /// Drop a schedule from the store and its download from the cache.
    pub async fn forget_schedule(&self, url: &str) -> Result<()> {
        self.repository.remove_schedule(url).await?;
        self.cache().invalidate(url).await?;
        Ok(())
    }

    /// Run a menu update with the persisted seed state, saving it when it moved.
    pub async fn refresh_seed(&self, force_online: bool) -> Result<SeedOutcome> {
        let path = Path::new(&self.config.state_path);
        let mut state = SeedState::load(path)?;
        let before = state.clone();

        let outcome = self.seeds.update(&mut state, force_online).await?;

        if state != before {
            state.save(path)?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemFlags;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> Config {
        let path = |name: &str| tmp.path().join(name).to_string_lossy().to_string();
        Config {
            db_path: path("schedules.db"),
            cache_dir: path("cache"),
            state_path: path("state.toml"),
            seed_url: "http://127.0.0.1:9/menu.json".to_string(),
            ..Config::default()
        }
    }

    fn descriptor() -> ScheduleDescriptor {
        ScheduleDescriptor {
            stable_id: "camp".into(),
            url: "https://camp.example/schedule.xml".into(),
            title: "Camp".into(),
            start: Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 8, 4, 18, 0, 0).unwrap(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_open_schedule_restores_flags_and_indexes() {
        let tmp = TempDir::new().unwrap();
        let services = Services::new(config(&tmp)).await.unwrap();

        let mut items = vec![Item::new("t1", "Soldering for beginners"), Item::new("t2", "Badge hacking")];
        let record = services.open_schedule(descriptor(), &mut items, true).await.unwrap();
        services
            .repository
            .save_override(record.id, "t2", ItemFlags { remind: true, stars: 4, ..Default::default() })
            .await
            .unwrap();

        // Next launch: same schedule parsed again from the cache.
        let mut items = vec![Item::new("t1", "Soldering for beginners"), Item::new("t2", "Badge hacking")];
        services.open_schedule(descriptor(), &mut items, false).await.unwrap();

        assert!(items[1].remind);
        assert_eq!(items[1].stars, 4);
        assert!(!items[0].remind);
        assert_eq!(
            services.search.search(record.id, "badge").await.unwrap(),
            vec!["t2"]
        );
    }

    #[tokio::test]
    async fn test_refresh_seed_offline_persists_state() {
        let tmp = TempDir::new().unwrap();
        let services = Services::new(config(&tmp)).await.unwrap();
        services.network.set_online(false);

        let outcome = services.refresh_seed(false).await.unwrap();
        assert!(matches!(outcome, SeedOutcome::Merged { inserted, .. } if inserted > 0));

        let state = SeedState::load(Path::new(&services.config.state_path)).unwrap();
        assert!(state.last_seed_version > 0);
        assert!(state.last_seed_check.is_none());
    }

    #[tokio::test]
    async fn test_forget_schedule() {
        let tmp = TempDir::new().unwrap();
        let services = Services::new(config(&tmp)).await.unwrap();
        let mut items = vec![Item::new("t1", "Opening")];
        services.open_schedule(descriptor(), &mut items, true).await.unwrap();

        let mut staging = services.cache().begin_replace(&descriptor().url).await.unwrap();
        staging.write(b"<schedule/>").await.unwrap();
        services.cache().commit(staging, None).await.unwrap();

        services.forget_schedule(&descriptor().url).await.unwrap();

        assert!(services.repository.list_schedules().await.unwrap().is_empty());
        assert!(services.cache().get(&descriptor().url).await.unwrap().is_none());
    }
}
