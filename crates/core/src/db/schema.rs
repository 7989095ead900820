//! Substrate schema and migration runner.
//!
//! Migrations are SQL strings applied in order; the SQLite `user_version`
//! pragma records the last one applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::SubstrateError;

/// All migrations, in order, as `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "document entries",
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            collection  TEXT    NOT NULL,
            id          TEXT    NOT NULL,
            revision    INTEGER NOT NULL,
            record      TEXT    NOT NULL,
            PRIMARY KEY (collection, id, revision)
        ) WITHOUT ROWID;
        "#,
    ),
];

/// Bring the schema up to date. Safe to call on every open.
pub fn run_migrations(conn: &Connection) -> Result<(), SubstrateError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking substrate migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| SubstrateError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied");
        }
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32, SubstrateError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), SubstrateError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
