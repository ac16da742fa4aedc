use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::cache::url_digest;
use crate::error::Result;
use crate::models::{from_unix, ItemFlags, ItemOverride, ScheduleDescriptor, ScheduleRecord, SeedSchedule};

use super::migrations;

const SCHEDULE_COLUMNS: &str = "sch_id, sch_id_s, sch_url, sch_title, sch_atime, sch_rtime, \
                                sch_itime, sch_start, sch_end, sch_day, sch_metadata";

/// Item row ids by (schedule id, item stable id), filled as rows are seen or created.
type IdCache = Arc<Mutex<HashMap<(i64, String), i64>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedMerge {
    Inserted,
    Updated,
    Skipped,
}

#[derive(Clone)]
pub struct Repository {
    conn: Connection,
    upgraded_from: Option<u32>,
    item_ids: IdCache,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        let upgraded_from = conn
            .call(|conn| {
                let from = migrations::migrate(conn)?;
                Ok(from)
            })
            .await?;

        Ok(Self {
            conn,
            upgraded_from,
            item_ids: Arc::default(),
        })
    }

    /// Version the schema was upgraded from when this store was opened.
    pub fn upgraded_from(&self) -> Option<u32> {
        self.upgraded_from
    }

    /// Handle for components sharing this database, such as the search index.
    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }

    // Schedule operations

    /// Record that a schedule was opened. The descriptor is authoritative for
    /// title, URL, time range and metadata.
    pub async fn upsert_schedule(
        &self,
        desc: ScheduleDescriptor,
        fresh: bool,
    ) -> Result<ScheduleRecord> {
        let record = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now().timestamp();
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT sch_id FROM schedule WHERE sch_id_s = ?1 ORDER BY sch_id LIMIT 1",
                        params![desc.stable_id],
                        |row| row.get(0),
                    )
                    .optional()?;

                let id = match existing {
                    None => {
                        tx.execute(
                            r#"INSERT INTO schedule (sch_id_s, sch_title, sch_url, sch_atime, sch_rtime,
                                                     sch_start, sch_end, sch_metadata, sch_day)
                               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)"#,
                            params![
                                desc.stable_id,
                                desc.title,
                                desc.url,
                                now,
                                fresh.then_some(now),
                                desc.start.timestamp(),
                                desc.end.timestamp(),
                                desc.metadata,
                            ],
                        )?;
                        tracing::info!("Adding schedule {} to database", desc.stable_id);
                        tx.last_insert_rowid()
                    }
                    Some(id) => {
                        tx.execute(
                            r#"UPDATE schedule SET sch_title = ?1, sch_url = ?2, sch_atime = ?3,
                                                   sch_start = ?4, sch_end = ?5, sch_metadata = ?6
                               WHERE sch_id = ?7"#,
                            params![
                                desc.title,
                                desc.url,
                                now,
                                desc.start.timestamp(),
                                desc.end.timestamp(),
                                desc.metadata,
                                id,
                            ],
                        )?;
                        if fresh {
                            // Never let a refresh land at or before the last index
                            // stamp, or a same-second rebuild would hide it.
                            tx.execute(
                                "UPDATE schedule SET sch_rtime = MAX(?1, COALESCE(sch_itime, 0)) WHERE sch_id = ?2",
                                params![now, id],
                            )?;
                        }
                        id
                    }
                };

                let record = tx.query_row(
                    &format!("SELECT {} FROM schedule WHERE sch_id = ?1", SCHEDULE_COLUMNS),
                    params![id],
                    schedule_from_row,
                )?;
                tx.commit()?;
                Ok(record)
            })
            .await?;
        tracing::debug!("Schedule {} has id {}", record.stable_id, record.id);
        Ok(record)
    }

    /// Known schedules, ones with real access history first, most recent first.
    pub async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>> {
        let schedules = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM schedule ORDER BY COALESCE(sch_atime = sch_start, 0), sch_atime DESC, sch_id",
                    SCHEDULE_COLUMNS
                ))?;
                let schedules = stmt
                    .query_map([], schedule_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(schedules)
            })
            .await?;
        Ok(schedules)
    }

    pub async fn schedule(&self, id: i64) -> Result<Option<ScheduleRecord>> {
        let record = self
            .conn
            .call(move |conn| {
                let record = conn
                    .query_row(
                        &format!("SELECT {} FROM schedule WHERE sch_id = ?1", SCHEDULE_COLUMNS),
                        params![id],
                        schedule_from_row,
                    )
                    .optional()?;
                Ok(record)
            })
            .await?;
        Ok(record)
    }

    pub async fn schedule_by_url(&self, url: &str) -> Result<Option<ScheduleRecord>> {
        let url = url.to_string();
        let record = self
            .conn
            .call(move |conn| {
                let record = conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM schedule WHERE sch_url = ?1 ORDER BY sch_id LIMIT 1",
                            SCHEDULE_COLUMNS
                        ),
                        params![url],
                        schedule_from_row,
                    )
                    .optional()?;
                Ok(record)
            })
            .await?;
        Ok(record)
    }

    pub async fn set_day_cursor(&self, schedule_id: i64, day: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE schedule SET sch_day = ?1 WHERE sch_id = ?2",
                    params![day, schedule_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Forget every schedule stored under `url`, with its item flags and
    /// search documents. Returns how many schedules were removed.
    pub async fn remove_schedule(&self, url: &str) -> Result<usize> {
        let url = url.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids = {
                    let mut stmt = tx.prepare("SELECT sch_id FROM schedule WHERE sch_url = ?1")?;
                    let ids = stmt
                        .query_map(params![url], |row| row.get::<_, i64>(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    ids
                };
                for id in &ids {
                    tx.execute("DELETE FROM schedule_item WHERE sci_sch_id = ?1", params![id])?;
                    tx.execute("DELETE FROM item_search WHERE sch_id = ?1", params![id])?;
                    tx.execute("DELETE FROM schedule WHERE sch_id = ?1", params![id])?;
                }
                tx.commit()?;
                Ok(ids)
            })
            .await?;

        if !removed.is_empty() {
            let mut cache = self.item_ids.lock().unwrap_or_else(|e| e.into_inner());
            cache.retain(|(schedule_id, _), _| !removed.contains(schedule_id));
            tracing::info!("Removed {} schedule(s)", removed.len());
        }
        Ok(removed.len())
    }

    // Item overrides

    /// Stored flags for a schedule's items. Also primes the item id cache.
    pub async fn load_overrides(&self, schedule_id: i64) -> Result<Vec<ItemOverride>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT sci_id, sci_id_s, COALESCE(sci_remind, 0), COALESCE(sci_hidden, 0),
                              COALESCE(sci_stars, 0)
                       FROM schedule_item WHERE sci_sch_id = ?1 ORDER BY sci_id"#,
                )?;
                let rows = stmt
                    .query_map(params![schedule_id], |row| {
                        let row_id: i64 = row.get(0)?;
                        let flags = ItemFlags {
                            remind: row.get::<_, i64>(2)? != 0,
                            hidden: row.get::<_, i64>(3)? != 0,
                            stars: row.get(4)?,
                        };
                        Ok((row_id, row.get::<_, String>(1)?, flags))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut cache = self.item_ids.lock().unwrap_or_else(|e| e.into_inner());
        let overrides = rows
            .into_iter()
            .map(|(row_id, item_id, flags)| {
                cache.insert((schedule_id, item_id.clone()), row_id);
                ItemOverride {
                    schedule_id,
                    item_id,
                    flags,
                }
            })
            .collect();
        Ok(overrides)
    }

    pub async fn save_override(&self, schedule_id: i64, item_id: &str, flags: ItemFlags) -> Result<()> {
        tracing::debug!(
            "Saving item {} remind {} stars {} hidden {}",
            item_id,
            flags.remind,
            flags.stars,
            flags.hidden
        );
        let item_id = item_id.to_string();
        let cache = self.item_ids.clone();
        let (row_id, key) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let row_id = resolve_item_id(&tx, &cache, schedule_id, &item_id)?;
                tx.execute(
                    "UPDATE schedule_item SET sci_remind = ?1, sci_hidden = ?2, sci_stars = ?3 WHERE sci_id = ?4",
                    params![flags.remind, flags.hidden, flags.stars, row_id],
                )?;
                tx.commit()?;
                Ok((row_id, (schedule_id, item_id)))
            })
            .await?;

        self.item_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, row_id);
        Ok(())
    }

    /// Row id for an item, creating an empty flags row on first reference.
    pub async fn resolve_or_create_item_id(&self, schedule_id: i64, item_id: &str) -> Result<i64> {
        let key = (schedule_id, item_id.to_string());
        if let Some(id) = self.cached_item_id(&key) {
            return Ok(id);
        }

        let cache = self.item_ids.clone();
        let item_id = item_id.to_string();
        let row_id = self
            .conn
            .call(move |conn| {
                let row_id = resolve_item_id(conn, &cache, schedule_id, &item_id)?;
                Ok(row_id)
            })
            .await?;

        self.item_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, row_id);
        Ok(row_id)
    }

    fn cached_item_id(&self, key: &(i64, String)) -> Option<i64> {
        self.item_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
    }

    /// Un-hide every item of a schedule. Returns how many rows changed.
    pub async fn flush_all_hidden(&self, schedule_id: i64) -> Result<usize> {
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE schedule_item SET sci_hidden = 0 WHERE sci_sch_id = ?1 AND sci_hidden",
                    params![schedule_id],
                )?;
                Ok(changed)
            })
            .await?;
        Ok(changed)
    }

    // Search history

    pub async fn add_search_query(&self, query: &str) -> Result<()> {
        let query = query.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                // Re-inserting keeps the row id in step with recency for same-second ties.
                let replaced = tx.execute("DELETE FROM search_history WHERE hst_query = ?1", params![query])?;
                tx.execute(
                    "INSERT INTO search_history (hst_query, hst_atime) VALUES (?1, ?2)",
                    params![query, Utc::now().timestamp()],
                )?;
                tx.commit()?;
                tracing::debug!("{} {}", query, if replaced > 0 { "updated" } else { "added" });
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn search_history(&self) -> Result<Vec<String>> {
        let queries = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT hst_query FROM search_history ORDER BY hst_atime DESC, hst_id DESC",
                )?;
                let queries = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                Ok(queries)
            })
            .await?;
        Ok(queries)
    }

    pub async fn forget_search_query(&self, query: &str) -> Result<bool> {
        let query = query.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM search_history WHERE hst_query = ?1", params![query])?;
                Ok(deleted)
            })
            .await?;
        Ok(deleted > 0)
    }

    // Seed merging

    /// Fold one entry of the schedule menu into the store.
    ///
    /// Unknown URLs are inserted only if the entry is newer than the last
    /// merged menu; they get their start time as access time so they list
    /// after schedules the user actually opened. Known URLs get their
    /// metadata refreshed, and their time range too when `backfill_range` is
    /// set (databases from before start/end were stored).
    pub async fn merge_seed_schedule(
        &self,
        entry: &SeedSchedule,
        last_seed_version: u32,
        backfill_range: bool,
    ) -> Result<SeedMerge> {
        let (start, end) = entry.time_range();
        let entry = entry.clone();
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT sch_id FROM schedule WHERE sch_url = ?1 ORDER BY sch_id LIMIT 1",
                        params![entry.url],
                        |row| row.get(0),
                    )
                    .optional()?;

                let outcome = match existing {
                    None if entry.version > last_seed_version => {
                        let stable_id = entry.id.clone().unwrap_or_else(|| url_digest(&entry.url));
                        tx.execute(
                            r#"INSERT INTO schedule (sch_id_s, sch_url, sch_title, sch_atime, sch_start,
                                                     sch_end, sch_metadata, sch_day)
                               VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, 0)"#,
                            params![
                                stable_id,
                                entry.url,
                                entry.title,
                                start.timestamp(),
                                end.timestamp(),
                                entry.metadata,
                            ],
                        )?;
                        SeedMerge::Inserted
                    }
                    None => SeedMerge::Skipped,
                    Some(id) => {
                        if backfill_range {
                            tx.execute(
                                "UPDATE schedule SET sch_start = ?1, sch_end = ?2 WHERE sch_id = ?3",
                                params![start.timestamp(), end.timestamp(), id],
                            )?;
                        }
                        if entry.metadata.is_some() {
                            tx.execute(
                                "UPDATE schedule SET sch_metadata = ?1 WHERE sch_id = ?2",
                                params![entry.metadata, id],
                            )?;
                        }
                        SeedMerge::Updated
                    }
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await?;
        Ok(outcome)
    }
}

/// Cache, then table, then insert.
fn resolve_item_id(
    conn: &rusqlite::Connection,
    cache: &IdCache,
    schedule_id: i64,
    item_id: &str,
) -> rusqlite::Result<i64> {
    let key = (schedule_id, item_id.to_string());
    if let Some(id) = cache.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
        return Ok(*id);
    }

    let existing: Option<i64> = conn
        .query_row(
            "SELECT sci_id FROM schedule_item WHERE sci_sch_id = ?1 AND sci_id_s = ?2",
            params![schedule_id, item_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        tracing::warn!("Item {} appeared in schedule {} without being loaded", item_id, schedule_id);
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO schedule_item (sci_sch_id, sci_id_s, sci_remind, sci_hidden, sci_stars) VALUES (?1, ?2, 0, 0, 0)",
        params![schedule_id, item_id],
    )?;
    Ok(conn.last_insert_rowid())
}

fn schedule_from_row(row: &Row) -> rusqlite::Result<ScheduleRecord> {
    Ok(ScheduleRecord {
        id: row.get(0)?,
        stable_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        url: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        title: row.get(3)?,
        access_time: from_unix(row.get(4)?),
        refresh_time: from_unix(row.get(5)?),
        index_time: from_unix(row.get(6)?),
        start: from_unix(row.get(7)?),
        end: from_unix(row.get(8)?),
        day_cursor: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
        metadata: row.get(10)?,
    })
}
