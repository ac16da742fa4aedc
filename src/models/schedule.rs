use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the caller knows about a schedule when it hands one to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDescriptor {
    pub stable_id: String,
    pub url: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Raw JSON, interpreted by the presentation layer.
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: i64,
    pub stable_id: String,
    pub url: String,
    pub title: Option<String>,
    pub access_time: Option<DateTime<Utc>>,
    pub refresh_time: Option<DateTime<Utc>>,
    pub index_time: Option<DateTime<Utc>>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub day_cursor: i64,
    pub metadata: Option<String>,
}

impl ScheduleRecord {
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }

    /// Seeded schedules carry their start time as access time until first opened.
    pub fn never_opened(&self) -> bool {
        self.access_time.is_some() && self.access_time == self.start
    }

    pub fn index_is_fresh(&self) -> bool {
        match (self.index_time, self.refresh_time) {
            (Some(itime), Some(rtime)) => itime > rtime,
            (Some(itime), None) => itime.timestamp() > 0,
            (None, _) => false,
        }
    }
}

/// A single event in a schedule, as produced by the schedule parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub speakers: Vec<String>,
    pub track: Option<String>,
    pub remind: bool,
    pub hidden: bool,
    pub stars: i32,
}

impl Item {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn speakers_joined(&self) -> Option<String> {
        if self.speakers.is_empty() {
            None
        } else {
            Some(self.speakers.join(" "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemFlags {
    pub remind: bool,
    pub hidden: bool,
    pub stars: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOverride {
    pub schedule_id: i64,
    pub item_id: String,
    pub flags: ItemFlags,
}

/// Copy stored user flags onto freshly parsed items. Returns how many were applied.
///
/// The remote schedule may have dropped items since the user touched them, so
/// unknown ids are logged and skipped.
pub fn apply_overrides(items: &mut [Item], overrides: &[ItemOverride]) -> usize {
    let mut by_id: HashMap<String, &mut Item> = items
        .iter_mut()
        .map(|item| (item.id.clone(), item))
        .collect();

    let mut applied = 0;
    for o in overrides {
        match by_id.get_mut(&o.item_id) {
            Some(item) => {
                item.remind = o.flags.remind;
                item.hidden = o.flags.hidden;
                item.stars = o.flags.stars;
                applied += 1;
            }
            None => {
                tracing::warn!(
                    "Db has info about missing schedule item {} remind {} stars {} hidden {}",
                    o.item_id,
                    o.flags.remind,
                    o.flags.stars,
                    o.flags.hidden
                );
            }
        }
    }
    applied
}

pub(crate) fn from_unix(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}
