use rusqlite::{Connection, OptionalExtension, params};

use crate::error::QueueError;

pub(crate) const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    command         TEXT    NOT NULL,
    tag             TEXT,
    state           TEXT    NOT NULL,
    submitted_at_ms INTEGER NOT NULL,
    started_at_ms   INTEGER,
    finished_at_ms  INTEGER,
    exit_code       INTEGER,
    pid             INTEGER
);
CREATE INDEX IF NOT EXISTS jobs_state_idx ON jobs(state, submitted_at_ms, id);
CREATE INDEX IF NOT EXISTS jobs_tag_idx ON jobs(tag);

CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

pub(crate) fn install(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(SCHEMA)?;
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Refuse to touch a queue written by a newer layout.
pub(crate) fn check_version(conn: &Connection) -> Result<(), QueueError> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let Some(stored) = stored else {
        return Err(QueueError::NotFound("queue metadata".into()));
    };
    match stored.parse::<i64>() {
        Ok(version) if version <= SCHEMA_VERSION => Ok(()),
        _ => Err(QueueError::InvalidArgument(format!(
            "queue schema version {stored} is not supported"
        ))),
    }
}
