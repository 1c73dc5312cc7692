//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS decisions (
                message_id TEXT PRIMARY KEY,
                disposition TEXT NOT NULL,
                source TEXT NOT NULL,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                decided_at TEXT NOT NULL,
                applied INTEGER NOT NULL DEFAULT 0,
                applied_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_disposition ON decisions(disposition);
            CREATE INDEX IF NOT EXISTS idx_decisions_sender ON decisions(sender);

            CREATE TABLE IF NOT EXISTS opt_out_records (
                sender TEXT PRIMARY KEY,
                first_request TEXT NOT NULL,
                last_request TEXT NOT NULL,
                request_count INTEGER NOT NULL,
                escalated INTEGER NOT NULL DEFAULT 0
            );
        "#,
    },
    Migration {
        version: 2,
        name: "learned_preferences",
        sql: r#"
            CREATE TABLE IF NOT EXISTS preferences (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern_type TEXT NOT NULL,
                pattern_value TEXT NOT NULL,
                disposition TEXT NOT NULL,
                confidence REAL NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(pattern_type, pattern_value, disposition)
            );
            CREATE INDEX IF NOT EXISTS idx_preferences_pattern
                ON preferences(pattern_type, pattern_value);
        "#,
    },
    Migration {
        version: 3,
        name: "applied_lookup",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_decisions_applied
                ON decisions(applied, message_id);
        "#,
    },
];

/// Highest version this build knows how to apply.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Bring the schema up to [`latest_version`].
///
/// Each step and its `_migrations` row commit together, so an interrupted
/// upgrade resumes at the failed step.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("_migrations table: {e}")))?;

    let current = schema_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        tracing::debug!(version = current, "Schema up to date");
        return Ok(());
    }

    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        apply(conn, migration).await.map_err(|e| {
            DatabaseError::Migration(format!(
                "V{} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;
    }
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), libsql::Error> {
    let tx = conn.transaction().await?;
    tx.execute_batch(migration.sql).await?;
    tx.execute(
        "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
        libsql::params![
            migration.version,
            migration.name,
            chrono::Utc::now().to_rfc3339()
        ],
    )
    .await?;
    tx.commit().await
}

/// Highest applied version, 0 on a fresh database.
pub async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("reading schema version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("reading schema version: {e}")))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("parsing schema version: {e}"))),
        None => Ok(0),
    }
}
