//! libSQL backend: async `OutreachStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::delivery::Envelope;
use crate::error::DatabaseError;
use crate::recipients::{Exclusions, Recipient, RecipientSource, normalize_address};
use crate::store::migrations;
use crate::store::traits::{OutreachStore, ScheduledDispatch, ScheduledStatus};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
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

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width so text comparison orders
/// correctly in SQL.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
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

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_to_recipient(row: &libsql::Row) -> Result<Recipient, libsql::Error> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let address: Option<String> = row.get(2).ok();
    Ok(Recipient::catalog(id, name, address))
}

fn row_to_scheduled(row: &libsql::Row) -> Result<ScheduledDispatch, DatabaseError> {
    let get_text = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
    };

    let recipients: Vec<String> = serde_json::from_str(&get_text(1)?)
        .map_err(|e| DatabaseError::Serialization(format!("recipients: {e}")))?;
    let attachments = serde_json::from_str(&get_text(4)?)
        .map_err(|e| DatabaseError::Serialization(format!("attachments: {e}")))?;
    let notify: i64 = row.get(6).unwrap_or(0);
    let sent_at: Option<String> = row.get(9).ok();

    Ok(ScheduledDispatch {
        id: get_text(0)?,
        envelope: Envelope {
            recipients,
            subject: get_text(2)?,
            body: get_text(3)?,
            attachments,
        },
        scheduled_for: parse_datetime(&get_text(5)?),
        notify_on_sent: notify != 0,
        status: ScheduledStatus::parse(&get_text(7)?),
        last_error: row.get(8).ok(),
        sent_at: sent_at.as_deref().map(parse_datetime),
        created_at: parse_datetime(&get_text(10)?),
    })
}

const SCHEDULED_COLUMNS: &str = "id, recipients, subject, body, attachments, scheduled_for, notify_on_sent, status, last_error, sent_at, created_at";

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl OutreachStore for LibSqlStore {
    async fn upsert_organization(&self, recipient: &Recipient) -> Result<(), DatabaseError> {
        let now = format_datetime(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO organizations (id, name, address, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    address = excluded.address,
                    updated_at = excluded.updated_at",
                params![
                    recipient.recipient_id.as_str(),
                    recipient.name.as_str(),
                    opt_text(recipient.address.as_deref()),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_organization: {e}")))?;
        Ok(())
    }

    async fn list_organizations(&self) -> Result<Vec<Recipient>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, address FROM organizations ORDER BY created_at ASC, id ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_organizations: {e}")))?;

        let mut recipients = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_recipient(&row) {
                Ok(r) => recipients.push(r),
                Err(e) => warn!("Skipping organization row: {e}"),
            }
        }
        Ok(recipients)
    }

    async fn record_contacted(&self, addresses: &[String]) -> Result<(), DatabaseError> {
        let now = format_datetime(Utc::now());
        for address in addresses {
            self.conn()
                .execute(
                    "INSERT INTO contacted (address, contacted_at) VALUES (?1, ?2)
                     ON CONFLICT(address) DO UPDATE SET contacted_at = excluded.contacted_at",
                    params![normalize_address(address), now.clone()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("record_contacted: {e}")))?;
        }
        debug!(count = addresses.len(), "Recorded contacted addresses");
        Ok(())
    }

    async fn contacted_addresses(&self) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT address FROM contacted", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("contacted_addresses: {e}")))?;

        let mut addresses = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(address) = row.get::<String>(0) {
                addresses.push(address);
            }
        }
        Ok(addresses)
    }

    async fn insert_scheduled(
        &self,
        envelope: &Envelope,
        scheduled_for: DateTime<Utc>,
        notify_on_sent: bool,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = format_datetime(Utc::now());
        let recipients = serde_json::to_string(&envelope.recipients)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let attachments = serde_json::to_string(&envelope.attachments)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO scheduled_dispatches (id, recipients, subject, body, attachments,
                    scheduled_for, notify_on_sent, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)",
                params![
                    id.clone(),
                    recipients,
                    envelope.subject.as_str(),
                    envelope.body.as_str(),
                    attachments,
                    format_datetime(scheduled_for),
                    i64::from(notify_on_sent),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_scheduled: {e}")))?;

        debug!(id = %id, scheduled_for = %scheduled_for, "Scheduled dispatch persisted");
        Ok(id)
    }

    async fn get_scheduled(&self, id: &str) -> Result<Option<ScheduledDispatch>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SCHEDULED_COLUMNS} FROM scheduled_dispatches WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_scheduled: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_scheduled(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_scheduled: {e}"))),
        }
    }

    async fn scheduled_addresses(&self) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT recipients FROM scheduled_dispatches WHERE status = 'pending'",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("scheduled_addresses: {e}")))?;

        let mut addresses = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let Ok(raw) = row.get::<String>(0) else {
                continue;
            };
            match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(list) => addresses.extend(list.iter().map(|a| normalize_address(a))),
                Err(e) => warn!("Skipping malformed scheduled recipients: {e}"),
            }
        }
        Ok(addresses)
    }

    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledDispatch>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SCHEDULED_COLUMNS} FROM scheduled_dispatches
                     WHERE status = 'pending' AND scheduled_for <= ?1
                     ORDER BY scheduled_for ASC"
                ),
                params![format_datetime(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("due_scheduled: {e}")))?;

        let mut due = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_scheduled(&row) {
                Ok(dispatch) => due.push(dispatch),
                Err(e) => warn!("Skipping scheduled dispatch row: {e}"),
            }
        }
        Ok(due)
    }

    async fn mark_scheduled_sent(&self, id: &str) -> Result<(), DatabaseError> {
        let now = format_datetime(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE scheduled_dispatches SET status = ?1, sent_at = ?2, updated_at = ?2, last_error = NULL
                 WHERE id = ?3",
                params![ScheduledStatus::Sent.as_str(), now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_scheduled_sent: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "scheduled_dispatch".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_scheduled_failed(&self, id: &str, reason: &str) -> Result<(), DatabaseError> {
        let now = format_datetime(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE scheduled_dispatches SET status = ?1, last_error = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![ScheduledStatus::Failed.as_str(), reason, now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_scheduled_failed: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "scheduled_dispatch".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecipientSource for LibSqlStore {
    async fn eligible_recipients(&self) -> Result<Vec<Recipient>, DatabaseError> {
        let exclusions = self.exclusions().await?;
        let mut seen = HashSet::new();
        Ok(self
            .list_organizations()
            .await?
            .into_iter()
            .filter(|r| match r.address.as_deref() {
                Some(address) => !exclusions.excludes(address) && seen.insert(address.to_string()),
                None => false,
            })
            .collect())
    }

    async fn exclusions(&self) -> Result<Exclusions, DatabaseError> {
        Ok(Exclusions::new(
            self.contacted_addresses().await?,
            self.scheduled_addresses().await?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::EncodedAttachment;

    async fn test_store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn envelope(to: &str) -> Envelope {
        Envelope {
            recipients: vec![to.to_string()],
            subject: "Partnership".into(),
            body: "Hello!".into(),
            attachments: vec![EncodedAttachment {
                filename: "deck.pdf".into(),
                content_type: "application/pdf".into(),
                size: 4,
                data: "JVBERg==".into(),
                reference: Some("/tmp/deck.pdf".into()),
            }],
        }
    }

    #[tokio::test]
    async fn organizations_upsert_and_list() {
        let store = test_store().await;
        store
            .upsert_organization(&Recipient::catalog("1", "Acme", Some("hi@acme.com".into())))
            .await
            .unwrap();
        store
            .upsert_organization(&Recipient::catalog("1", "Acme Inc", Some("hi@acme.com".into())))
            .await
            .unwrap();
        store
            .upsert_organization(&Recipient::catalog("2", "Unknown", None))
            .await
            .unwrap();

        let orgs = store.list_organizations().await.unwrap();
        assert_eq!(orgs.len(), 2);
        assert_eq!(orgs[0].name, "Acme Inc");
        assert!(orgs[1].address.is_none());
    }

    #[tokio::test]
    async fn eligible_excludes_contacted_scheduled_and_unresolved() {
        let store = test_store().await;
        for (id, address) in [("1", Some("a@x.com")), ("2", Some("b@x.com")), ("3", Some("c@x.com")), ("4", None)] {
            store
                .upsert_organization(&Recipient::catalog(id, format!("Org {id}"), address.map(str::to_string)))
                .await
                .unwrap();
        }
        store.record_contacted(&["A@x.com".to_string()]).await.unwrap();
        store
            .insert_scheduled(&envelope("b@x.com"), Utc::now() + chrono::Duration::hours(1), false)
            .await
            .unwrap();

        let eligible = store.eligible_recipients().await.unwrap();
        let ids: Vec<&str> = eligible.iter().map(|r| r.recipient_id.as_str()).collect();
        assert_eq!(ids, vec!["3"]);
    }

    #[tokio::test]
    async fn scheduled_round_trip() {
        let store = test_store().await;
        let when = Utc::now() + chrono::Duration::minutes(30);
        let id = store
            .insert_scheduled(&envelope("a@x.com"), when, true)
            .await
            .unwrap();

        let stored = store.get_scheduled(&id).await.unwrap().unwrap();
        assert_eq!(stored.envelope, envelope("a@x.com"));
        assert!(stored.notify_on_sent);
        assert_eq!(stored.status, ScheduledStatus::Pending);
        assert_eq!(stored.scheduled_for.timestamp_micros(), when.timestamp_micros());
    }

    #[tokio::test]
    async fn due_only_returns_pending_past_dispatches() {
        let store = test_store().await;
        let now = Utc::now();
        let past = store
            .insert_scheduled(&envelope("a@x.com"), now - chrono::Duration::minutes(1), false)
            .await
            .unwrap();
        store
            .insert_scheduled(&envelope("b@x.com"), now + chrono::Duration::hours(1), false)
            .await
            .unwrap();

        let due = store.due_scheduled(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, past);

        store.mark_scheduled_sent(&past).await.unwrap();
        assert!(store.due_scheduled(now).await.unwrap().is_empty());
        let sent = store.get_scheduled(&past).await.unwrap().unwrap();
        assert_eq!(sent.status, ScheduledStatus::Sent);
        assert!(sent.sent_at.is_some());
    }

    #[tokio::test]
    async fn failed_dispatch_keeps_reason() {
        let store = test_store().await;
        let id = store
            .insert_scheduled(&envelope("a@x.com"), Utc::now(), false)
            .await
            .unwrap();
        store.mark_scheduled_failed(&id, "mailbox full").await.unwrap();

        let failed = store.get_scheduled(&id).await.unwrap().unwrap();
        assert_eq!(failed.status, ScheduledStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("mailbox full"));
        assert!(store.scheduled_addresses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn marking_unknown_dispatch_is_not_found() {
        let store = test_store().await;
        let err = store.mark_scheduled_sent("missing").await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }
}
