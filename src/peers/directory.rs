//! Read access to peer records.

use sqlx::Row;

use crate::auth::AuthContext;
use crate::db::store::row_to_peer;
use crate::db::{Peer, PeerStatus, Store};

use super::PeerError;

/// Hard cap on page size regardless of what the caller asks for.
pub const MAX_PAGE_SIZE: i64 = 100;

/// Page size used when the caller does not specify one.
pub const DEFAULT_PAGE_SIZE: i64 = 20;

/// One page of results plus the total row count.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub size: i64,
    pub total: i64,
}

/// Admin listing row: the peer joined with its owner's email.
#[derive(Debug, Clone)]
pub struct AdminPeerRow {
    pub peer: Peer,
    pub owner_email: Option<String>,
}

/// Filters for the admin listing.
#[derive(Debug, Clone, Default)]
pub struct PeerFilters {
    pub status: Option<PeerStatus>,
    pub owner_id: Option<String>,
}

/// Read accessors over peer records, with caller authorization applied
/// in-process.
#[derive(Clone)]
pub struct PeerDirectory {
    store: Store,
}

impl PeerDirectory {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Look up a single peer. A peer the caller is not allowed to see is
    /// reported as not found.
    pub async fn find_by_id(&self, ctx: &AuthContext, id: &str) -> Result<Peer, PeerError> {
        let row = sqlx::query("SELECT * FROM peers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?;

        let peer = row.map(|r| row_to_peer(&r)).transpose()?.ok_or(PeerError::NotFound)?;

        if !ctx.can_view(&peer) {
            return Err(PeerError::NotFound);
        }

        Ok(peer)
    }

    /// List a user's peers, newest claim first.
    pub async fn list_for_owner(
        &self,
        ctx: &AuthContext,
        owner_id: &str,
        status: Option<PeerStatus>,
        page: i64,
        size: i64,
    ) -> Result<Page<Peer>, PeerError> {
        if !ctx.is_admin() && owner_id != ctx.user_id {
            return Err(PeerError::Forbidden);
        }

        let page = page.max(1);
        let size = size.clamp(1, MAX_PAGE_SIZE);

        let mut count_sql = String::from("SELECT COUNT(*) FROM peers WHERE owner_id = ?");
        let mut list_sql = String::from("SELECT * FROM peers WHERE owner_id = ?");
        if status.is_some() {
            count_sql.push_str(" AND status = ?");
            list_sql.push_str(" AND status = ?");
        }
        list_sql.push_str(" ORDER BY claimed_at DESC LIMIT ? OFFSET ?");

        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql).bind(owner_id);
        let mut list_query = sqlx::query(&list_sql).bind(owner_id);
        if let Some(status) = status {
            count_query = count_query.bind(status.as_str());
            list_query = list_query.bind(status.as_str());
        }

        let total = count_query.fetch_one(self.store.pool()).await?;
        let rows = list_query
            .bind(size)
            .bind((page - 1) * size)
            .fetch_all(self.store.pool())
            .await?;

        let items = rows.iter().map(row_to_peer).collect::<Result<Vec<_>, _>>()?;

        Ok(Page { items, page, size, total })
    }

    /// Admin view over all peers, newest import first, joined with owner
    /// email for display.
    pub async fn list_all(
        &self,
        ctx: &AuthContext,
        filters: &PeerFilters,
        page: i64,
        size: i64,
    ) -> Result<Page<AdminPeerRow>, PeerError> {
        if !ctx.is_admin() {
            return Err(PeerError::Forbidden);
        }

        let page = page.max(1);
        let size = size.clamp(1, MAX_PAGE_SIZE);

        let mut count_sql = String::from("SELECT COUNT(*) FROM peers p WHERE 1=1");
        let mut list_sql = String::from(
            "SELECT p.*, u.email AS owner_email FROM peers p \
             LEFT JOIN users u ON u.id = p.owner_id WHERE 1=1",
        );
        if filters.status.is_some() {
            count_sql.push_str(" AND p.status = ?");
            list_sql.push_str(" AND p.status = ?");
        }
        if filters.owner_id.is_some() {
            count_sql.push_str(" AND p.owner_id = ?");
            list_sql.push_str(" AND p.owner_id = ?");
        }
        list_sql.push_str(" ORDER BY p.imported_at DESC LIMIT ? OFFSET ?");

        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        let mut list_query = sqlx::query(&list_sql);
        if let Some(status) = filters.status {
            count_query = count_query.bind(status.as_str());
            list_query = list_query.bind(status.as_str());
        }
        if let Some(owner_id) = &filters.owner_id {
            count_query = count_query.bind(owner_id);
            list_query = list_query.bind(owner_id);
        }

        let total = count_query.fetch_one(self.store.pool()).await?;
        let rows = list_query
            .bind(size)
            .bind((page - 1) * size)
            .fetch_all(self.store.pool())
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(AdminPeerRow {
                peer: row_to_peer(row)?,
                owner_email: row.get("owner_email"),
            });
        }

        Ok(Page { items, page, size, total })
    }

    /// Number of active peers currently held by a user. Input to the
    /// allocation engine's quota check.
    pub async fn count_active_for_owner(&self, owner_id: &str) -> Result<i64, PeerError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM peers WHERE owner_id = ? AND status = 'active'",
        )
        .bind(owner_id)
        .fetch_one(self.store.pool())
        .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Role;

    fn user_ctx(user_id: &str) -> AuthContext {
        AuthContext {
            user_id: user_id.to_string(),
            roles: vec![Role::User],
        }
    }

    fn admin_ctx(user_id: &str) -> AuthContext {
        AuthContext {
            user_id: user_id.to_string(),
            roles: vec![Role::User, Role::Admin],
        }
    }

    async fn seed() -> (Store, PeerDirectory) {
        let store = Store::in_memory().await.unwrap();
        (store.clone(), PeerDirectory::new(store))
    }

    async fn claim_directly(store: &Store, peer_id: &str, owner_id: &str) {
        sqlx::query(
            "UPDATE peers SET owner_id = ?, status = 'active', claimed_at = ? WHERE id = ?",
        )
        .bind(owner_id)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(peer_id)
        .execute(store.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_find_by_id_hides_foreign_peers() {
        let (store, directory) = seed().await;
        let peer = store.insert_peer("pk-1", "ct").await.unwrap().unwrap();
        claim_directly(&store, &peer.id, "owner-1").await;

        // owner sees it
        assert!(directory.find_by_id(&user_ctx("owner-1"), &peer.id).await.is_ok());
        // admin sees it
        assert!(directory.find_by_id(&admin_ctx("admin-1"), &peer.id).await.is_ok());
        // another user gets NotFound, not Forbidden
        assert!(matches!(
            directory.find_by_id(&user_ctx("owner-2"), &peer.id).await,
            Err(PeerError::NotFound)
        ));
        // genuinely missing
        assert!(matches!(
            directory.find_by_id(&admin_ctx("admin-1"), "missing").await,
            Err(PeerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_for_owner_scoping() {
        let (store, directory) = seed().await;
        for i in 0..3 {
            let peer = store
                .insert_peer(&format!("pk-{i}"), "ct")
                .await
                .unwrap()
                .unwrap();
            claim_directly(&store, &peer.id, "owner-1").await;
        }

        let page = directory
            .list_for_owner(&user_ctx("owner-1"), "owner-1", None, 1, 20)
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 3);

        // non-admin cannot list someone else's peers
        assert!(matches!(
            directory
                .list_for_owner(&user_ctx("owner-2"), "owner-1", None, 1, 20)
                .await,
            Err(PeerError::Forbidden)
        ));

        // admin can
        let page = directory
            .list_for_owner(&admin_ctx("admin-1"), "owner-1", None, 1, 20)
            .await
            .unwrap();
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn test_pagination_clamps() {
        let (store, directory) = seed().await;
        for i in 0..5 {
            store.insert_peer(&format!("pk-{i}"), "ct").await.unwrap();
        }

        let page = directory
            .list_all(&admin_ctx("admin-1"), &PeerFilters::default(), 0, 1000)
            .await
            .unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.size, MAX_PAGE_SIZE);
        assert_eq!(page.total, 5);

        let page = directory
            .list_all(&admin_ctx("admin-1"), &PeerFilters::default(), 2, 2)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 5);
    }

    #[tokio::test]
    async fn test_list_all_filters_and_authz() {
        let (store, directory) = seed().await;
        let p1 = store.insert_peer("pk-1", "ct").await.unwrap().unwrap();
        store.insert_peer("pk-2", "ct").await.unwrap();
        claim_directly(&store, &p1.id, "owner-1").await;

        assert!(matches!(
            directory
                .list_all(&user_ctx("owner-1"), &PeerFilters::default(), 1, 20)
                .await,
            Err(PeerError::Forbidden)
        ));

        let active = directory
            .list_all(
                &admin_ctx("admin-1"),
                &PeerFilters {
                    status: Some(PeerStatus::Active),
                    owner_id: None,
                },
                1,
                20,
            )
            .await
            .unwrap();
        assert_eq!(active.total, 1);
        assert_eq!(active.items[0].peer.id, p1.id);

        let by_owner = directory
            .list_all(
                &admin_ctx("admin-1"),
                &PeerFilters {
                    status: None,
                    owner_id: Some("owner-1".to_string()),
                },
                1,
                20,
            )
            .await
            .unwrap();
        assert_eq!(by_owner.total, 1);
    }

    #[tokio::test]
    async fn test_count_active_for_owner() {
        let (store, directory) = seed().await;
        let p1 = store.insert_peer("pk-1", "ct").await.unwrap().unwrap();
        let p2 = store.insert_peer("pk-2", "ct").await.unwrap().unwrap();
        claim_directly(&store, &p1.id, "owner-1").await;
        claim_directly(&store, &p2.id, "owner-1").await;

        // revoked peers do not count against the quota
        sqlx::query("UPDATE peers SET status = 'inactive' WHERE id = ?")
            .bind(&p2.id)
            .execute(store.pool())
            .await
            .unwrap();

        assert_eq!(directory.count_active_for_owner("owner-1").await.unwrap(), 1);
        assert_eq!(directory.count_active_for_owner("owner-2").await.unwrap(), 0);
    }
}
