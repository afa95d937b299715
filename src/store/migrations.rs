//! Ledger schema, versioned.
//!
//! Applied versions live in `_migrations`. Opening a ledger applies every
//! newer step in order; each step and its version row commit together.

use libsql::Connection;
use tracing::{debug, info};

use crate::error::LedgerError;

struct Step {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only. Never edit a released step.
static STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "processed_messages",
        sql: "CREATE TABLE IF NOT EXISTS processed_messages (
                  message_id  TEXT PRIMARY KEY,
                  action      TEXT NOT NULL,
                  rule_name   TEXT,
                  recorded_at TEXT NOT NULL
              );",
    },
    Step {
        version: 2,
        name: "processed_messages_recorded_at_index",
        sql: "CREATE INDEX IF NOT EXISTS idx_processed_messages_recorded_at
                  ON processed_messages(recorded_at);",
    },
];

/// Bring the ledger schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
             version    INTEGER PRIMARY KEY,
             name       TEXT NOT NULL,
             applied_at TEXT NOT NULL DEFAULT (datetime('now'))
         )",
        (),
    )
    .await
    .map_err(|e| LedgerError::Migration(format!("cannot create _migrations: {e}")))?;

    let applied = schema_version(conn).await?;
    let pending: Vec<&Step> = STEPS.iter().filter(|s| s.version > applied).collect();
    if pending.is_empty() {
        debug!(version = applied, "Ledger schema up to date");
        return Ok(());
    }

    for step in pending {
        info!(version = step.version, name = step.name, "Applying ledger migration");
        apply(conn, step).await?;
    }
    Ok(())
}

async fn apply(conn: &Connection, step: &Step) -> Result<(), LedgerError> {
    let fail = |e: libsql::Error| {
        LedgerError::Migration(format!("V{} {} failed: {e}", step.version, step.name))
    };

    let tx = conn.transaction().await.map_err(fail)?;
    tx.execute_batch(step.sql).await.map_err(fail)?;
    tx.execute(
        "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![step.version, step.name],
    )
    .await
    .map_err(fail)?;
    tx.commit().await.map_err(fail)
}

/// Highest applied version; 0 for a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, LedgerError> {
    let read = |e: libsql::Error| LedgerError::Migration(format!("cannot read schema version: {e}"));

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(read)?;
    match rows.next().await.map_err(read)? {
        Some(row) => row.get::<i64>(0).map_err(read),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_conn() -> Connection {
        libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap()
            .connect()
            .unwrap()
    }

    async fn object_exists(conn: &Connection, kind: &str, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2",
                libsql::params![kind, name],
            )
            .await
            .unwrap();
        rows.next().await.unwrap().is_some()
    }

    #[tokio::test]
    async fn fresh_database_gets_full_schema() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();

        assert!(object_exists(&conn, "table", "processed_messages").await);
        assert!(object_exists(&conn, "index", "idx_processed_messages_recorded_at").await);
        assert_eq!(schema_version(&conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rerun_is_a_no_op() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let mut rows = conn.query("SELECT COUNT(*) FROM _migrations", ()).await.unwrap();
        let applied: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(applied, STEPS.len() as i64);
    }

    #[tokio::test]
    async fn upgrades_from_first_version() {
        let conn = memory_conn().await;
        conn.execute(
            "CREATE TABLE _migrations (
                 version INTEGER PRIMARY KEY,
                 name TEXT NOT NULL,
                 applied_at TEXT NOT NULL DEFAULT (datetime('now'))
             )",
            (),
        )
        .await
        .unwrap();
        apply(&conn, &STEPS[0]).await.unwrap();
        assert!(!object_exists(&conn, "index", "idx_processed_messages_recorded_at").await);

        run_migrations(&conn).await.unwrap();
        assert!(object_exists(&conn, "index", "idx_processed_messages_recorded_at").await);
        assert_eq!(schema_version(&conn).await.unwrap(), 2);
    }
}
