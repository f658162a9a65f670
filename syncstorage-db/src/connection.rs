//! Opens a single user's SQLite file and brings it to a known-good state:
//! WAL mode, foreign keys on, and the embedded schema bootstrapped if this
//! is a fresh file.
//!
//! Grounded on `syncstorage-sqlite::wal`'s connection customizer (for which
//! pragmas to set) and the legacy `db::models::DBManager::init` (for the
//! lazy schema-version bootstrap) -- adapted from r2d2's `CustomizeConnection`
//! to a plain function since each user has exactly one connection, not a
//! pool of them.

use diesel::{connection::SimpleConnection, sqlite::SqliteConnection, Connection, RunQueryDsl};
use diesel::sql_query;

use syncstorage_common::DbError;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// How long a connection will wait on `SQLITE_BUSY` before giving up and
/// surfacing a `Locked` error, in milliseconds. Generous because a vacuum
/// on a large file can legitimately hold the write lock for seconds.
const BUSY_TIMEOUT_MS: u32 = 10_000;

pub fn open(database_url: &str) -> Result<SqliteConnection, DbError> {
    let conn = SqliteConnection::establish(database_url)
        .map_err(|e| DbError::io(format!("failed to open {}: {}", database_url, e)))?;
    set_pragmas(&conn)?;
    bootstrap_schema(&conn)?;
    Ok(conn)
}

fn set_pragmas(conn: &SqliteConnection) -> Result<(), DbError> {
    conn.batch_execute(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {};",
        BUSY_TIMEOUT_MS
    ))
    .map_err(|e| DbError::io(format!("failed to set pragmas: {}", e)))
}

fn bootstrap_schema(conn: &SqliteConnection) -> Result<(), DbError> {
    #[derive(QueryableByName)]
    struct SchemaVersion {
        #[sql_type = "diesel::sql_types::Integer"]
        schema_version: i32,
    }

    let version: SchemaVersion = sql_query("PRAGMA schema_version;")
        .get_result(conn)
        .map_err(|e| DbError::io(format!("failed to read schema_version: {}", e)))?;

    if version.schema_version == 0 {
        debug!("bootstrapping fresh schema");
        conn.batch_execute(SCHEMA_SQL)
            .map_err(|e| DbError::io(format!("failed to bootstrap schema: {}", e)))?;
    }
    Ok(())
}
