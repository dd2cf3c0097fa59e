//! Database schema migrations.
//!
//! Uses a simple version table approach to track applied migrations.
//! Each migration is either a SQL batch or a data step written in Rust,
//! applied together with its version row in one transaction so it runs
//! exactly once.

use tokio_rusqlite::rusqlite::Transaction;
use tokio_rusqlite::{Connection, params};

use crate::Error;

/// What a migration does when applied.
#[derive(Clone, Copy)]
pub enum Step {
    /// A schema batch.
    Sql(&'static str),
    /// A data rewrite over rows already on disk.
    Data(fn(&Transaction<'_>) -> Result<(), Error>),
}

/// One versioned migration.
#[derive(Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub step: Step,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

/// Latest version in a migration list.
pub fn target_version(migrations: &[Migration]) -> i64 {
    migrations.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Run every pending migration in `migrations`.
///
/// Returns the schema version after the run.
///
/// # Errors
///
/// Returns `MigrationFailed` naming the version that failed; earlier
/// versions stay applied.
pub async fn run(conn: &Connection, migrations: &'static [Migration]) -> Result<i64, Error> {
    run_to(conn, migrations, target_version(migrations)).await
}

/// Run pending migrations up to and including `target`.
pub async fn run_to(conn: &Connection, migrations: &'static [Migration], target: i64) -> Result<i64, Error> {
    conn.call(move |conn| -> Result<i64, Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(Error::from)?;

        let mut current: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| row.get(0))
            .map_err(Error::from)?;

        for migration in migrations {
            if migration.version <= current || migration.version > target {
                continue;
            }

            let tx = conn.transaction()?;
            let applied = match migration.step {
                Step::Sql(sql) => tx.execute_batch(sql).map_err(Error::from),
                Step::Data(rewrite) => rewrite(&tx),
            };
            applied.map_err(|e| {
                Error::MigrationFailed(format!("v{} ({}): {e}", migration.version, migration.description))
            })?;
            tx.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.description, chrono::Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;

            tracing::info!(version = migration.version, description = migration.description, "applied migration");
            current = migration.version;
        }

        Ok(current)
    })
    .await
    .map_err(Error::from)
}

/// Schema version currently recorded on disk.
pub async fn current_version(conn: &Connection) -> Result<i64, Error> {
    conn.call(|conn| -> Result<i64, Error> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='_migrations')",
            [],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(0);
        }
        Ok(conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| row.get(0))?)
    })
    .await
    .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_rows(tx: &Transaction<'_>) -> Result<(), Error> {
        tx.execute("INSERT INTO notes (body) VALUES ('seeded')", [])?;
        Ok(())
    }

    fn always_fails(_: &Transaction<'_>) -> Result<(), Error> {
        Err(Error::Storage("nope".into()))
    }

    static NOTES: &[Migration] = &[
        Migration {
            version: 1,
            description: "notes table",
            step: Step::Sql("CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);"),
        },
        Migration { version: 2, description: "seed notes", step: Step::Data(seed_rows) },
    ];

    static BROKEN: &[Migration] = &[
        Migration {
            version: 1,
            description: "notes table",
            step: Step::Sql("CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);"),
        },
        Migration { version: 2, description: "broken rewrite", step: Step::Data(always_fails) },
    ];

    async fn note_count(conn: &Connection) -> i64 {
        conn.call(|conn| conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().await.unwrap();
        assert_eq!(run(&conn, NOTES).await.unwrap(), 2);
        assert_eq!(run(&conn, NOTES).await.unwrap(), 2);

        assert_eq!(note_count(&conn).await, 1);
    }

    #[tokio::test]
    async fn test_migrations_version_tracking() {
        let conn = Connection::open_in_memory().await.unwrap();
        assert_eq!(current_version(&conn).await.unwrap(), 0);

        run_to(&conn, NOTES, 1).await.unwrap();
        assert_eq!(current_version(&conn).await.unwrap(), 1);
        assert_eq!(note_count(&conn).await, 0);

        run(&conn, NOTES).await.unwrap();
        assert_eq!(current_version(&conn).await.unwrap(), 2);
        assert_eq!(note_count(&conn).await, 1);
    }

    #[tokio::test]
    async fn test_failed_migration_is_not_recorded() {
        let conn = Connection::open_in_memory().await.unwrap();
        let err = run(&conn, BROKEN).await.unwrap_err();
        assert_eq!(err.code(), "MIGRATION_FAILED");
        assert!(err.to_string().contains("broken rewrite"));
        assert_eq!(current_version(&conn).await.unwrap(), 1);
    }

    #[test]
    fn test_target_version() {
        assert_eq!(target_version(NOTES), 2);
        assert_eq!(target_version(&[]), 0);
    }
}
