//! Append-only audit trail.
//!
//! Every state-changing operation records an event. Recording is
//! best-effort: a failed write is reported to the operator log and never
//! rolls back the business mutation it trails.

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use tracing::error;

use crate::db::models::AuditEvent;
use crate::db::store::{parse_ts, Store};

/// Event taxonomy. Password and login events are emitted by the external
/// identity provider into the same log; the portal itself emits the peer,
/// limit, user and import events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Login,
    PeerClaim,
    PeerAssign,
    PeerDownload,
    PeerRevoke,
    ResetPassword,
    PasswordChange,
    LimitChange,
    UserDeactivate,
    Import,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "LOGIN",
            Self::PeerClaim => "PEER_CLAIM",
            Self::PeerAssign => "PEER_ASSIGN",
            Self::PeerDownload => "PEER_DOWNLOAD",
            Self::PeerRevoke => "PEER_REVOKE",
            Self::ResetPassword => "RESET_PASSWORD",
            Self::PasswordChange => "PASSWORD_CHANGE",
            Self::LimitChange => "LIMIT_CHANGE",
            Self::UserDeactivate => "USER_DEACTIVATE",
            Self::Import => "IMPORT",
        }
    }
}

/// Writer (and admin reader) for the audit log.
#[derive(Clone)]
pub struct AuditTrail {
    store: Store,
}

impl AuditTrail {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record an event. Failures are logged and swallowed.
    pub async fn record(
        &self,
        event: EventType,
        actor_id: Option<&str>,
        subject_table: &str,
        subject_id: &str,
        metadata: Value,
    ) {
        if let Err(e) = self
            .insert(event, actor_id, subject_table, subject_id, &metadata)
            .await
        {
            error!(
                event = event.as_str(),
                subject_table,
                subject_id,
                error = %e,
                "Failed to record audit event"
            );
        }
    }

    async fn insert(
        &self,
        event: EventType,
        actor_id: Option<&str>,
        subject_table: &str,
        subject_id: &str,
        metadata: &Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (created_at, event_type, actor_id, subject_table, subject_id, metadata)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(event.as_str())
        .bind(actor_id)
        .bind(subject_table)
        .bind(subject_id)
        .bind(metadata.to_string())
        .execute(self.store.pool())
        .await?;

        Ok(())
    }

    /// Most recent events, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditEvent>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, created_at, event_type, actor_id, subject_table, subject_id, metadata \
             FROM audit_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let created_at_str: String = row.get("created_at");
                AuditEvent {
                    id: row.get("id"),
                    created_at: parse_ts(&created_at_str),
                    event_type: row.get("event_type"),
                    actor_id: row.get("actor_id"),
                    subject_table: row.get("subject_table"),
                    subject_id: row.get("subject_id"),
                    metadata: row.get("metadata"),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_record_and_read_back() {
        let store = Store::in_memory().await.unwrap();
        let audit = AuditTrail::new(store);

        audit
            .record(
                EventType::LimitChange,
                Some("admin-1"),
                "users",
                "user-1",
                json!({ "old": 1, "new": 5 }),
            )
            .await;
        audit
            .record(EventType::Import, None, "import_batch", "batch-1", json!({}))
            .await;

        let events = audit.recent(10).await.unwrap();
        assert_eq!(events.len(), 2);

        // newest first
        assert_eq!(events[0].event_type, "IMPORT");
        assert_eq!(events[0].actor_id, None);

        assert_eq!(events[1].event_type, "LIMIT_CHANGE");
        assert_eq!(events[1].actor_id.as_deref(), Some("admin-1"));
        assert_eq!(events[1].subject_id, "user-1");
        assert!(events[1].metadata.contains("\"new\":5"));
    }
}
