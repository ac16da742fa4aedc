use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tokio_rusqlite::Connection;

use crate::error::Result;
use crate::models::Item;

use super::bm25::{item_score, MatchInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// Indexed after the last refresh.
    Fresh,
    /// Never indexed, or refreshed since.
    Stale,
}

/// Full-text index over schedule items, stored next to the schedule table.
#[derive(Clone)]
pub struct SearchIndex {
    conn: Connection,
}

const STALENESS: &str = "SELECT COALESCE(sch_itime, 0) > COALESCE(sch_rtime, 0) FROM schedule WHERE sch_id = ?1";

impl SearchIndex {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn state(&self, schedule_id: i64) -> Result<IndexState> {
        let fresh = self
            .conn
            .call(move |conn| {
                let fresh: Option<bool> = conn
                    .query_row(STALENESS, params![schedule_id], |row| row.get(0))
                    .optional()?;
                Ok(fresh.unwrap_or(false))
            })
            .await?;
        Ok(if fresh { IndexState::Fresh } else { IndexState::Stale })
    }

    /// Replace a stale schedule's documents with one per item. Returns whether
    /// anything was rewritten.
    pub async fn rebuild(&self, schedule_id: i64, items: &[Item]) -> Result<bool> {
        let docs: Vec<Document> = items.iter().map(Document::from).collect();
        let rebuilt = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let fresh: Option<bool> = tx
                    .query_row(STALENESS, params![schedule_id], |row| row.get(0))
                    .optional()?;
                match fresh {
                    None => {
                        tracing::warn!("Not indexing unknown schedule {}", schedule_id);
                        return Ok(false);
                    }
                    Some(true) => return Ok(false),
                    Some(false) => {}
                }

                // sch_id must be bound as an integer or nothing matches.
                tx.execute("DELETE FROM item_search WHERE sch_id = ?1", params![schedule_id])?;
                {
                    let mut insert = tx.prepare(
                        r#"INSERT INTO item_search (sch_id, sci_id_s, title, subtitle, description, speakers, track)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
                    )?;
                    for doc in &docs {
                        insert.execute(params![
                            schedule_id,
                            doc.item_id,
                            doc.title,
                            doc.subtitle,
                            doc.description,
                            doc.speakers,
                            doc.track,
                        ])?;
                    }
                }
                // Stamped strictly after the refresh so it reads as fresh even
                // within the same second.
                tx.execute(
                    "UPDATE schedule SET sch_itime = MAX(?1, COALESCE(sch_rtime, 0) + 1) WHERE sch_id = ?2",
                    params![Utc::now().timestamp(), schedule_id],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if rebuilt {
            tracing::info!("Indexed {} items of schedule {}", items.len(), schedule_id);
        }
        Ok(rebuilt)
    }

    /// Row ids of the schedule's documents, in order. Changes whenever the
    /// documents are rewritten.
    pub async fn document_ids(&self, schedule_id: i64) -> Result<Vec<i64>> {
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT docid FROM item_search WHERE sch_id = ?1 ORDER BY docid")?;
                let ids = stmt
                    .query_map(params![schedule_id], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<i64>, _>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    /// Item ids matching `query`, best first, ties by id.
    ///
    /// `None` means the search itself failed (empty or malformed query,
    /// broken index), as opposed to `Some(vec![])` for no matches.
    pub async fn search(&self, schedule_id: i64, query: &str) -> Option<Vec<String>> {
        let query = query.trim().to_string();
        if query.is_empty() {
            return None;
        }

        let q = query.clone();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT item_search.sci_id_s, matchinfo(item_search, 'pcnalx'),
                              COALESCE(schedule_item.sci_remind, 0)
                       FROM item_search
                       LEFT JOIN schedule_item ON (schedule_item.sci_sch_id = item_search.sch_id
                                                   AND schedule_item.sci_id_s = item_search.sci_id_s)
                       WHERE item_search.sch_id = ?1 AND item_search MATCH ?2"#,
                )?;
                let rows = stmt
                    .query_map(params![schedule_id, q], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, i64>(2)? != 0,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Search for {:?} in schedule {} failed: {}", query, schedule_id, e);
                return None;
            }
        };

        let mut best: HashMap<String, f64> = HashMap::new();
        for (item_id, blob, remind) in rows {
            let Some(info) = MatchInfo::parse(&blob) else {
                tracing::warn!("Unreadable match info for {}", item_id);
                return None;
            };
            let score = item_score(&info, remind);
            tracing::debug!("{} score: {} remind {}", item_id, score, remind);
            best.entry(item_id)
                .and_modify(|s| *s = s.max(score))
                .or_insert(score);
        }

        let mut ranked: Vec<(String, f64)> = best.into_iter().collect();
        ranked.sort_by(|(a_id, a), (b_id, b)| b.total_cmp(a).then_with(|| a_id.cmp(b_id)));
        Some(ranked.into_iter().map(|(id, _)| id).collect())
    }
}

/// One item's searchable text.
struct Document {
    item_id: String,
    title: String,
    subtitle: Option<String>,
    description: Option<String>,
    speakers: Option<String>,
    track: Option<String>,
}

impl From<&Item> for Document {
    fn from(item: &Item) -> Self {
        Self {
            item_id: item.id.clone(),
            title: item.title.clone(),
            subtitle: item.subtitle.clone(),
            description: item.description.clone(),
            speakers: item.speakers_joined(),
            track: item.track.clone(),
        }
    }
}
