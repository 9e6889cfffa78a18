//! Peer allocation: claim, assignment, revocation and renaming.
//!
//! The claim path is the one concurrency-sensitive region in the portal.
//! Candidate selection and activation are split, so the activation update
//! is guarded on the row still being `available` at write time; a lost
//! race moves on to the next-oldest candidate.

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use crate::audit::{AuditTrail, EventType};
use crate::auth::AuthContext;
use crate::db::store::{row_to_peer, row_to_user};
use crate::db::{Peer, PeerStatus, Store, User};

use super::directory::PeerDirectory;
use super::PeerError;

/// How many candidates to try before giving up on a contended claim.
const CLAIM_ATTEMPTS: usize = 5;

/// Validate a user-chosen peer label: 1-63 chars, lowercase alphanumeric
/// and hyphens.
pub fn is_valid_friendly_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// State-changing peer operations, quota-checked and audited.
#[derive(Clone)]
pub struct AllocationEngine {
    store: Store,
    directory: PeerDirectory,
    audit: AuditTrail,
}

impl AllocationEngine {
    pub fn new(store: Store, audit: AuditTrail) -> Self {
        let directory = PeerDirectory::new(store.clone());
        Self { store, directory, audit }
    }

    /// Claim the oldest available peer for the calling user.
    ///
    /// FIFO on import time. The activation update only succeeds if the
    /// candidate is still `available`; on a lost race the next-oldest
    /// candidate is tried, bounded by `CLAIM_ATTEMPTS`.
    pub async fn claim_next(&self, ctx: &AuthContext) -> Result<Peer, PeerError> {
        let user = self.fetch_user(&ctx.user_id).await?;
        self.check_quota(&user).await?;

        for attempt in 0..CLAIM_ATTEMPTS {
            let candidate = self
                .oldest_available()
                .await?
                .ok_or(PeerError::NoAvailable)?;

            let now = Utc::now();
            let result = sqlx::query(
                r#"
                UPDATE peers SET owner_id = ?, status = 'active', claimed_at = ?
                WHERE id = ? AND status = 'available'
                "#,
            )
            .bind(&ctx.user_id)
            .bind(now.to_rfc3339())
            .bind(&candidate.id)
            .execute(self.store.pool())
            .await?;

            if result.rows_affected() == 0 {
                debug!(
                    peer_id = %candidate.id,
                    attempt,
                    "Candidate claimed concurrently, trying next"
                );
                continue;
            }

            info!(peer_id = %candidate.id, user_id = %ctx.user_id, "Peer claimed");

            self.audit
                .record(
                    EventType::PeerClaim,
                    Some(&ctx.user_id),
                    "peers",
                    &candidate.id,
                    json!({ "public_key": &candidate.public_key }),
                )
                .await;

            return Ok(Peer {
                status: PeerStatus::Active,
                owner_id: Some(ctx.user_id.clone()),
                claimed_at: Some(now),
                ..candidate
            });
        }

        Err(PeerError::ConcurrentClaimConflict)
    }

    /// Assign a specific peer to a target user (admin operation).
    ///
    /// The peer must be `available` or `inactive`; an `active` peer has to
    /// be revoked first.
    pub async fn assign(
        &self,
        ctx: &AuthContext,
        peer_id: &str,
        target_user_id: &str,
    ) -> Result<Peer, PeerError> {
        if !ctx.is_admin() {
            return Err(PeerError::Forbidden);
        }

        let target = self.fetch_user(target_user_id).await?;
        if !target.is_active() {
            // a deactivated account is no longer an assignment target
            return Err(PeerError::UserNotFound);
        }
        self.check_quota(&target).await?;

        let peer = self.fetch_peer(peer_id).await?.ok_or(PeerError::NotFound)?;
        if peer.status == PeerStatus::Active {
            return Err(PeerError::PeerNotAvailable);
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE peers SET owner_id = ?, status = 'active', claimed_at = ?, revoked_at = NULL
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(target_user_id)
        .bind(now.to_rfc3339())
        .bind(peer_id)
        .bind(peer.status.as_str())
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(PeerError::ConcurrentClaimConflict);
        }

        info!(
            peer_id = %peer_id,
            target_user_id = %target_user_id,
            actor_id = %ctx.user_id,
            "Peer assigned"
        );

        self.audit
            .record(
                EventType::PeerAssign,
                Some(&ctx.user_id),
                "peers",
                peer_id,
                json!({
                    "public_key": &peer.public_key,
                    "target_user_id": target_user_id,
                }),
            )
            .await;

        Ok(Peer {
            status: PeerStatus::Active,
            owner_id: Some(target_user_id.to_string()),
            claimed_at: Some(now),
            revoked_at: None,
            ..peer
        })
    }

    /// Revoke a peer. The owner reference is deliberately retained so the
    /// assignment history stays reconstructible.
    pub async fn revoke(&self, ctx: &AuthContext, peer_id: &str) -> Result<(), PeerError> {
        let peer = self.fetch_peer(peer_id).await?.ok_or(PeerError::NotFound)?;

        if !ctx.can_view(&peer) {
            return Err(PeerError::NotFound);
        }

        let now = Utc::now();
        let result = sqlx::query("UPDATE peers SET status = 'inactive', revoked_at = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(peer_id)
            .execute(self.store.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(PeerError::NotFound);
        }

        info!(peer_id = %peer_id, actor_id = %ctx.user_id, "Peer revoked");

        self.audit
            .record(
                EventType::PeerRevoke,
                Some(&ctx.user_id),
                "peers",
                peer_id,
                json!({ "public_key": peer.public_key }),
            )
            .await;

        Ok(())
    }

    /// Set a peer's friendly name. Validated before any storage call; the
    /// storage layer's unique constraint backs the check up.
    pub async fn rename(
        &self,
        ctx: &AuthContext,
        peer_id: &str,
        friendly_name: &str,
    ) -> Result<Peer, PeerError> {
        if !is_valid_friendly_name(friendly_name) {
            return Err(PeerError::InvalidName);
        }

        let peer = self.fetch_peer(peer_id).await?.ok_or(PeerError::NotFound)?;

        if !ctx.owns(&peer) {
            return Err(if ctx.is_admin() {
                PeerError::Forbidden
            } else {
                PeerError::NotFound
            });
        }

        sqlx::query("UPDATE peers SET friendly_name = ? WHERE id = ?")
            .bind(friendly_name)
            .bind(peer_id)
            .execute(self.store.pool())
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => PeerError::DuplicateName,
                _ => PeerError::Database(e),
            })?;

        Ok(Peer {
            friendly_name: Some(friendly_name.to_string()),
            ..peer
        })
    }

    async fn fetch_user(&self, user_id: &str) -> Result<User, PeerError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(self.store.pool())
            .await?;

        row.map(|r| row_to_user(&r)).ok_or(PeerError::UserNotFound)
    }

    async fn fetch_peer(&self, peer_id: &str) -> Result<Option<Peer>, PeerError> {
        let row = sqlx::query("SELECT * FROM peers WHERE id = ?")
            .bind(peer_id)
            .fetch_optional(self.store.pool())
            .await?;

        Ok(row.map(|r| row_to_peer(&r)).transpose()?)
    }

    async fn check_quota(&self, user: &User) -> Result<(), PeerError> {
        let active = self.directory.count_active_for_owner(&user.id).await?;
        if active >= user.peer_limit {
            return Err(PeerError::LimitExceeded { limit: user.peer_limit });
        }
        Ok(())
    }

    async fn oldest_available(&self) -> Result<Option<Peer>, PeerError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM peers
            WHERE status = 'available' AND owner_id IS NULL
            ORDER BY imported_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(self.store.pool())
        .await?;

        Ok(row.map(|r| row_to_peer(&r)).transpose()?)
    }
}
