//! libSQL ledger backend: local file or in-memory.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::store::ledger::{Ledger, LedgerAction, LedgerEntry};
use crate::store::migrations;

/// Ledger over one libSQL connection. Cycles are serialized upstream, so a
/// single shared connection is enough.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlLedger {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::Open(format!("Failed to create ledger directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LedgerError::Open(format!("Failed to open libSQL database: {e}")))?;

        let ledger = Self::from_database(db).await?;
        info!(path = %path.display(), "Ledger opened");
        Ok(ledger)
    }

    /// Create an in-memory ledger (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, LedgerError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| LedgerError::Open(format!("Failed to create in-memory database: {e}")))?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, LedgerError> {
        let conn = db
            .connect()
            .map_err(|e| LedgerError::Open(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_entry(row: &libsql::Row) -> Result<LedgerEntry, LedgerError> {
    let map = |e: libsql::Error| LedgerError::Query(format!("Failed to read ledger row: {e}"));
    let message_id: String = row.get(0).map_err(map)?;
    let action_str: String = row.get(1).map_err(map)?;
    let rule_name: Option<String> = row.get(2).ok();
    let recorded_str: String = row.get(3).map_err(map)?;

    let action = action_str
        .parse::<LedgerAction>()
        .map_err(LedgerError::Query)?;

    Ok(LedgerEntry {
        message_id,
        action,
        rule_name,
        recorded_at: parse_datetime(&recorded_str),
    })
}

#[async_trait]
impl Ledger for LibSqlLedger {
    async fn has(&self, message_id: &str) -> Result<bool, LedgerError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM processed_messages WHERE message_id = ?1 LIMIT 1",
                params![message_id],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("Failed to check ledger: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| LedgerError::Query(format!("Failed to read ledger: {e}")))?;
        Ok(row.is_some())
    }

    async fn record(
        &self,
        message_id: &str,
        action: LedgerAction,
        rule_name: Option<&str>,
    ) -> Result<(), LedgerError> {
        let rule = match rule_name {
            Some(name) => libsql::Value::Text(name.to_string()),
            None => libsql::Value::Null,
        };

        let affected = self
            .conn()
            .execute(
                "INSERT INTO processed_messages (message_id, action, rule_name, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(message_id) DO NOTHING",
                params![message_id, action.as_str(), rule, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| LedgerError::Write {
                message_id: message_id.to_string(),
                reason: e.to_string(),
            })?;

        if affected == 0 {
            return Err(LedgerError::AlreadyRecorded {
                message_id: message_id.to_string(),
            });
        }

        debug!(message_id, action = %action, "Recorded in ledger");
        Ok(())
    }

    async fn get(&self, message_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, action, rule_name, recorded_at
                 FROM processed_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("Failed to query ledger: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| LedgerError::Query(format!("Failed to read ledger: {e}")))?
        {
            Some(row) => Ok(Some(row_to_entry(&row)?)),
            None => Ok(None),
        }
    }

    async fn count(&self) -> Result<u64, LedgerError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM processed_messages", ())
            .await
            .map_err(|e| LedgerError::Query(format!("Failed to count ledger: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| LedgerError::Query(format!("Failed to read ledger count: {e}")))?;

        match row {
            Some(row) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| LedgerError::Query(format!("Failed to parse ledger count: {e}")))?;
                Ok(u64::try_from(count).unwrap_or(0))
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_then_has() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        assert!(!ledger.has("<m1@x>").await.unwrap());

        ledger
            .record("<m1@x>", LedgerAction::Drafted, Some("urgent"))
            .await
            .unwrap();
        assert!(ledger.has("<m1@x>").await.unwrap());
        assert!(!ledger.has("<m2@x>").await.unwrap());
        assert_eq!(ledger.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_returns_entry() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        ledger.record("m1", LedgerAction::Sent, Some("general")).await.unwrap();
        ledger.record("m2", LedgerAction::Sent, None).await.unwrap();

        let entry = ledger.get("m1").await.unwrap().unwrap();
        assert_eq!(entry.action, LedgerAction::Sent);
        assert_eq!(entry.rule_name.as_deref(), Some("general"));
        assert!(entry.recorded_at > DateTime::<Utc>::MIN_UTC);

        let entry = ledger.get("m2").await.unwrap().unwrap();
        assert_eq!(entry.rule_name, None);

        assert!(ledger.get("m3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn double_record_is_rejected() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        ledger.record("m1", LedgerAction::Drafted, None).await.unwrap();

        let err = ledger
            .record("m1", LedgerAction::Sent, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyRecorded { message_id } if message_id == "m1"));

        // First entry is untouched.
        let entry = ledger.get("m1").await.unwrap().unwrap();
        assert_eq!(entry.action, LedgerAction::Drafted);
        assert_eq!(ledger.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");

        {
            let ledger = LibSqlLedger::new_local(&path).await.unwrap();
            ledger.record("m1", LedgerAction::Drafted, Some("r")).await.unwrap();
        }

        let ledger = LibSqlLedger::new_local(&path).await.unwrap();
        assert!(ledger.has("m1").await.unwrap());
        assert_eq!(ledger.count().await.unwrap(), 1);
    }

    #[test]
    fn parse_datetime_formats() {
        let dt = parse_datetime("2026-03-07T09:30:00+00:00");
        assert_eq!(dt.to_rfc3339(), "2026-03-07T09:30:00+00:00");
        let dt = parse_datetime("2026-03-07 09:30:00");
        assert_eq!(dt.to_rfc3339(), "2026-03-07T09:30:00+00:00");
        assert_eq!(parse_datetime("garbage"), DateTime::<Utc>::MIN_UTC);
    }
}
