//! Forward-only schema upgrades.
//!
//! Every migration runs in its own transaction together with the
//! `user_version` bump. Steps check for existing columns and tables before
//! touching them, and a step that still fails is logged and counted as
//! applied so an unexpected leftover never keeps the store from opening.

use rusqlite::{Connection, Transaction};

use super::schema::{SCHEMA, SCHEMA_VERSION, SEARCH_TABLE};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    AddColumn {
        table: &'static str,
        column: &'static str,
        decl: &'static str,
    },
    Execute(&'static str),
    /// Recreate the full-text table and mark every schedule's index stale.
    RebuildSearchIndex,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub steps: &'static [Step],
}

pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 8,
        description: "schedule start/end times",
        steps: &[
            Step::AddColumn { table: "schedule", column: "sch_start", decl: "INTEGER" },
            Step::AddColumn { table: "schedule", column: "sch_end", decl: "INTEGER" },
        ],
    },
    Migration {
        version: 11,
        description: "schedule refresh time",
        steps: &[Step::AddColumn { table: "schedule", column: "sch_rtime", decl: "INTEGER" }],
    },
    Migration {
        version: 12,
        description: "hidden items",
        steps: &[Step::AddColumn { table: "schedule_item", column: "sci_hidden", decl: "BOOLEAN" }],
    },
    Migration {
        version: 13,
        description: "schedule metadata",
        steps: &[Step::AddColumn {
            table: "schedule",
            column: "sch_metadata",
            decl: "VARCHAR(10240)",
        }],
    },
    Migration {
        version: 14,
        description: "full-text item search",
        steps: &[Step::RebuildSearchIndex],
    },
    Migration {
        version: 15,
        description: "schedule index time",
        steps: &[Step::AddColumn { table: "schedule", column: "sch_itime", decl: "INTEGER" }],
    },
    Migration {
        version: 16,
        description: "search history",
        steps: &[Step::Execute(
            "CREATE TABLE IF NOT EXISTS search_history (
                hst_id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                hst_query VARCHAR(128),
                hst_atime INTEGER
            )",
        )],
    },
    Migration {
        version: 17,
        description: "unicode61 search tokenizer, lookup indexes",
        steps: &[
            Step::RebuildSearchIndex,
            Step::Execute("CREATE INDEX IF NOT EXISTS idx_schedule_id_s ON schedule(sch_id_s)"),
            Step::Execute("CREATE INDEX IF NOT EXISTS idx_schedule_url ON schedule(sch_url)"),
            Step::Execute(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_schedule_item_key ON schedule_item(sci_sch_id, sci_id_s)",
            ),
            Step::Execute(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_search_history_query ON search_history(hst_query)",
            ),
        ],
    },
];

pub(crate) fn user_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|name| name == column))
}

fn apply_step(tx: &Transaction, step: &Step) -> rusqlite::Result<()> {
    match *step {
        Step::AddColumn { table, column, decl } => {
            if has_column(tx, table, column)? {
                tracing::debug!("Column {}.{} already exists", table, column);
                return Ok(());
            }
            tx.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
        }
        Step::Execute(sql) => tx.execute_batch(sql),
        Step::RebuildSearchIndex => {
            tx.execute_batch("DROP TABLE IF EXISTS item_search")?;
            tx.execute_batch(SEARCH_TABLE)?;
            // Every stored index time now describes a table that is gone.
            if has_column(tx, "schedule", "sch_itime")? {
                tx.execute("UPDATE schedule SET sch_itime = 0", [])?;
            }
            Ok(())
        }
    }
}

fn apply(conn: &mut Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for step in migration.steps {
        if let Err(e) = apply_step(&tx, step) {
            tracing::warn!(
                "Migration {} ({}): {:?} failed, assuming already applied: {}",
                migration.version,
                migration.description,
                step,
                e
            );
        }
    }
    tx.pragma_update(None, "user_version", migration.version)?;
    tx.commit()
}

fn create(conn: &mut Connection) -> rusqlite::Result<()> {
    tracing::info!("Creating new database at version {}", SCHEMA_VERSION);
    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA)?;
    tx.execute_batch(SEARCH_TABLE)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()
}

/// Bring the database up to [`SCHEMA_VERSION`].
///
/// Returns the version it started from when anything changed: `Some(0)` for a
/// new database, `None` when it was already current.
pub(crate) fn migrate(conn: &mut Connection) -> rusqlite::Result<Option<u32>> {
    let current = user_version(conn)?;

    if current == 0 && !table_exists(conn, "schedule")? {
        create(conn)?;
        return Ok(Some(0));
    }
    if current >= SCHEMA_VERSION {
        if current > SCHEMA_VERSION {
            tracing::warn!(
                "Database version {} is newer than {}, leaving it alone",
                current,
                SCHEMA_VERSION
            );
        }
        return Ok(None);
    }

    tracing::info!(
        "Upgrading from database version {} to {}",
        current,
        SCHEMA_VERSION
    );
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::debug!("Applying migration {}: {}", migration.version, migration.description);
        apply(conn, migration)?;
    }
    if user_version(conn)? < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(Some(current))
}
