/// Version a freshly created database starts at, and the one migrations end on.
pub const SCHEMA_VERSION: u32 = 17;

pub const SCHEMA: &str = r#"
-- schedules known to the client, opened or only seeded
CREATE TABLE IF NOT EXISTS schedule (
    sch_id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    sch_title VARCHAR(128),
    sch_url VARCHAR(256),
    sch_atime INTEGER,
    sch_rtime INTEGER,
    sch_itime INTEGER,
    sch_start INTEGER,
    sch_end INTEGER,
    sch_id_s VARCHAR(128),
    sch_metadata VARCHAR(10240),
    sch_day INTEGER
);

CREATE INDEX IF NOT EXISTS idx_schedule_id_s ON schedule(sch_id_s);
CREATE INDEX IF NOT EXISTS idx_schedule_url ON schedule(sch_url);

-- per-item user flags, one row per item the user touched
CREATE TABLE IF NOT EXISTS schedule_item (
    sci_id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    sci_sch_id INTEGER NOT NULL,
    sci_id_s VARCHAR(128),
    sci_remind BOOLEAN,
    sci_hidden BOOLEAN,
    sci_stars INTEGER(2) NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_schedule_item_key ON schedule_item(sci_sch_id, sci_id_s);

CREATE TABLE IF NOT EXISTS search_history (
    hst_id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    hst_query VARCHAR(128),
    hst_atime INTEGER
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_search_history_query ON search_history(hst_query);
"#;

/// The full-text table. Dropped and recreated whenever its layout changes,
/// never altered in place.
pub const SEARCH_TABLE: &str = r#"
CREATE VIRTUAL TABLE item_search USING fts4(
    sch_id, sci_id_s, title, subtitle, description, speakers, track,
    notindexed=sch_id, notindexed=sci_id_s, tokenize=unicode61
);
"#;
