use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::Result;

pub const TABLE: &str = "task_scheduler";

const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS task_scheduler (
        identity              TEXT    NOT NULL PRIMARY KEY,
        name                  TEXT    NOT NULL,
        executed_object_class TEXT,               -- originating task type
        status_code           INTEGER NOT NULL DEFAULT 0,
        execution_time        INTEGER NOT NULL DEFAULT 0,  -- unix seconds
        finish_time           INTEGER,            -- unix seconds or NULL
        execute_duration      REAL,               -- seconds or NULL
        message               TEXT    NOT NULL DEFAULT ''   -- JSON envelope
    );
";

/// Columns added after the first layout, with their definitions.
const LATER_COLUMNS: [(&str, &str); 3] = [
    ("executed_object_class", "TEXT"),
    ("finish_time", "INTEGER"),
    ("execute_duration", "REAL"),
];

/// Create the `task_scheduler` table and add any missing columns.
///
/// Errors are returned; use [`ensure_schema`] for the best-effort variant.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLE)?;
    migrate_columns(conn)?;
    Ok(())
}

/// Best-effort schema setup. Returns whether the table is believed usable.
///
/// A failing existence check is logged and treated as "exists": if that
/// guess is wrong the next record write fails loudly instead.
pub fn ensure_schema(conn: &Connection) -> bool {
    match table_exists(conn) {
        Ok(true) => {
            if let Err(e) = migrate_columns(conn) {
                warn!(error = %e, "task_scheduler column migration failed");
            }
            true
        }
        Ok(false) => match init_db(conn) {
            Ok(()) => {
                info!("task_scheduler table created");
                true
            }
            Err(e) => {
                warn!(error = %e, "could not create task_scheduler table");
                false
            }
        },
        Err(e) => {
            warn!(error = %e, "task_scheduler existence check failed; assuming it exists");
            true
        }
    }
}

pub fn table_exists(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [TABLE],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
}

fn migrate_columns(conn: &Connection) -> rusqlite::Result<()> {
    let existing: Vec<String> = {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
        let rows = stmt.query_map([TABLE], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    for (column, definition) in LATER_COLUMNS {
        if existing.iter().any(|c| c == column) {
            continue;
        }
        conn.execute_batch(&format!(
            "ALTER TABLE {TABLE} ADD COLUMN {column} {definition};"
        ))?;
        info!(column, "task_scheduler column added");
    }
    Ok(())
}
