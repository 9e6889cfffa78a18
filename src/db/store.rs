//! Portal database: connection, schema and account management.

use std::path::Path;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use thiserror::Error;
use uuid::Uuid;

use super::models::{ApiToken, Peer, PeerStatus, Role, User, UserStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("User not found")]
    UserNotFound,

    #[error("Email already registered")]
    DuplicateEmail,
}

/// Hash a token using SHA-256.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new random token.
pub fn generate_token() -> String {
    use base64::Engine;
    use rand::Rng;
    let bytes: [u8; 32] = rand::thread_rng().gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Counts shown by the `status` CLI command.
#[derive(Debug, Clone)]
pub struct PortalStats {
    pub available_peers: i64,
    pub active_peers: i64,
    pub inactive_peers: i64,
    pub total_users: i64,
}

/// Portal database handle.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (creating if needed) the portal database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(sqlx::Error::Configuration(
                    format!("Failed to create database directory {}: {}", parent.display(), e)
                        .into(),
                ))
            })?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;

        Ok(store)
    }

    /// Open an in-memory database (tests).
    ///
    /// A single connection is required: every `:memory:` connection is its
    /// own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;

        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                peer_limit INTEGER NOT NULL DEFAULT 1,
                roles TEXT NOT NULL DEFAULT 'user',
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                public_key TEXT UNIQUE NOT NULL,
                status TEXT NOT NULL DEFAULT 'available',
                owner_id TEXT,
                friendly_name TEXT UNIQUE,
                config_ciphertext TEXT NOT NULL,
                imported_at TEXT NOT NULL,
                claimed_at TEXT,
                revoked_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_peers_owner ON peers(owner_id);
            CREATE INDEX IF NOT EXISTS idx_peers_status ON peers(status);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token_hash TEXT UNIQUE NOT NULL,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                revoked BOOLEAN DEFAULT FALSE
            );

            CREATE INDEX IF NOT EXISTS idx_tokens_hash ON tokens(token_hash);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                event_type TEXT NOT NULL,
                actor_id TEXT,
                subject_table TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                metadata TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // User management

    /// Create a new user account.
    pub async fn create_user(
        &self,
        email: &str,
        peer_limit: i64,
        admin: bool,
    ) -> Result<User, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let roles = if admin {
            vec![Role::User, Role::Admin]
        } else {
            vec![Role::User]
        };

        sqlx::query(
            r#"
            INSERT INTO users (id, email, status, peer_limit, roles, created_at)
            VALUES (?, ?, 'active', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(email)
        .bind(peer_limit)
        .bind(roles_to_str(&roles))
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::DuplicateEmail,
            _ => StoreError::Database(e),
        })?;

        Ok(User {
            id,
            email: email.to_string(),
            status: UserStatus::Active,
            peer_limit,
            roles,
            created_at: now,
        })
    }

    /// Get a user by ID.
    pub async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, email, status, peer_limit, roles, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| row_to_user(&r)))
    }

    /// Get a user by email.
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, email, status, peer_limit, roles, created_at FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| row_to_user(&r)))
    }

    /// List all users.
    pub async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, email, status, peer_limit, roles, created_at FROM users ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_user).collect())
    }

    /// Update a user's peer limit. Returns the previous limit.
    pub async fn set_peer_limit(&self, user_id: &str, limit: i64) -> Result<i64, StoreError> {
        let user = self.get_user(user_id).await?.ok_or(StoreError::UserNotFound)?;

        sqlx::query("UPDATE users SET peer_limit = ? WHERE id = ?")
            .bind(limit)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(user.peer_limit)
    }

    /// Mark a user account inactive.
    pub async fn deactivate_user(&self, user_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET status = 'inactive' WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound);
        }

        Ok(())
    }

    // Token management

    /// Create a new API token for a user. The plaintext token is returned
    /// once and only its hash is stored.
    pub async fn create_token(
        &self,
        user_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(String, ApiToken), StoreError> {
        self.get_user(user_id).await?.ok_or(StoreError::UserNotFound)?;

        let token = generate_token();
        let token_hash = hash_token(&token);
        let now = Utc::now();

        let id = sqlx::query(
            r#"
            INSERT INTO tokens (token_hash, user_id, created_at, expires_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&token_hash)
        .bind(user_id)
        .bind(now.to_rfc3339())
        .bind(expires_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok((
            token,
            ApiToken {
                id,
                token_hash,
                user_id: user_id.to_string(),
                created_at: now,
                expires_at,
                revoked: false,
            },
        ))
    }

    /// Validate a plaintext token, resolving it to its user.
    pub async fn validate_token(&self, token: &str) -> Result<Option<(ApiToken, User)>, StoreError> {
        let token_hash = hash_token(token);

        let row = sqlx::query(
            "SELECT id, token_hash, user_id, created_at, expires_at, revoked FROM tokens WHERE token_hash = ?",
        )
        .bind(&token_hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some(api_token) = row.map(|r| row_to_token(&r)).filter(ApiToken::is_valid) else {
            return Ok(None);
        };

        let Some(user) = self.get_user(&api_token.user_id).await? else {
            return Ok(None);
        };

        Ok(Some((api_token, user)))
    }

    // Peer rows

    /// Insert an imported peer as `available`. Returns `None` when a peer
    /// with the same public key already exists (dedup skip).
    pub async fn insert_peer(
        &self,
        public_key: &str,
        config_ciphertext: &str,
    ) -> Result<Option<Peer>, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO peers (id, public_key, status, config_ciphertext, imported_at)
            VALUES (?, ?, 'available', ?, ?)
            ON CONFLICT(public_key) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(public_key)
        .bind(config_ciphertext)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(Peer {
            id,
            public_key: public_key.to_string(),
            status: PeerStatus::Available,
            owner_id: None,
            friendly_name: None,
            config_ciphertext: config_ciphertext.to_string(),
            imported_at: now,
            claimed_at: None,
            revoked_at: None,
        }))
    }

    /// Get portal-wide counters.
    pub async fn get_stats(&self) -> Result<PortalStats, StoreError> {
        let available = self.count_peers_with_status("available").await?;
        let active = self.count_peers_with_status("active").await?;
        let inactive = self.count_peers_with_status("inactive").await?;

        let total_users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;

        Ok(PortalStats {
            available_peers: available,
            active_peers: active,
            inactive_peers: inactive,
            total_users,
        })
    }

    async fn count_peers_with_status(&self, status: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM peers WHERE status = ?")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

// Row mapping helpers

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

pub(crate) fn roles_to_str(roles: &[Role]) -> String {
    roles.iter().map(Role::as_str).collect::<Vec<_>>().join(",")
}

pub(crate) fn parse_roles(s: &str) -> Vec<Role> {
    s.split(',').filter_map(|r| Role::parse(r.trim())).collect()
}

pub(crate) fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> User {
    let status_str: String = row.get("status");
    let roles_str: String = row.get("roles");
    let created_at_str: String = row.get("created_at");

    User {
        id: row.get("id"),
        email: row.get("email"),
        status: UserStatus::parse(&status_str).unwrap_or(UserStatus::Inactive),
        peer_limit: row.get("peer_limit"),
        roles: parse_roles(&roles_str),
        created_at: parse_ts(&created_at_str),
    }
}

pub(crate) fn row_to_token(row: &sqlx::sqlite::SqliteRow) -> ApiToken {
    let created_at_str: String = row.get("created_at");
    let expires_at_str: Option<String> = row.get("expires_at");

    ApiToken {
        id: row.get("id"),
        token_hash: row.get("token_hash"),
        user_id: row.get("user_id"),
        created_at: parse_ts(&created_at_str),
        expires_at: parse_opt_ts(expires_at_str),
        revoked: row.get("revoked"),
    }
}

pub(crate) fn row_to_peer(row: &sqlx::sqlite::SqliteRow) -> Result<Peer, sqlx::Error> {
    let status_str: String = row.get("status");
    let status = PeerStatus::parse(&status_str)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown peer status: {status_str}").into()))?;

    let imported_at_str: String = row.get("imported_at");
    let claimed_at_str: Option<String> = row.get("claimed_at");
    let revoked_at_str: Option<String> = row.get("revoked_at");

    Ok(Peer {
        id: row.get("id"),
        public_key: row.get("public_key"),
        status,
        owner_id: row.get("owner_id"),
        friendly_name: row.get("friendly_name"),
        config_ciphertext: row.get("config_ciphertext"),
        imported_at: parse_ts(&imported_at_str),
        claimed_at: parse_opt_ts(claimed_at_str),
        revoked_at: parse_opt_ts(revoked_at_str),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_hash_stable() {
        assert_eq!(hash_token("abc"), hash_token("abc"));
        assert_ne!(hash_token("abc"), hash_token("abd"));
    }

    #[test]
    fn test_roles_round_trip() {
        let roles = vec![Role::User, Role::Admin];
        assert_eq!(parse_roles(&roles_to_str(&roles)), roles);
        assert_eq!(parse_roles("user"), vec![Role::User]);
        assert_eq!(parse_roles("user, admin"), vec![Role::User, Role::Admin]);
        assert!(parse_roles("nonsense").is_empty());
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let store = Store::in_memory().await.unwrap();

        let user = store.create_user("alice@example.com", 2, false).await.unwrap();
        assert!(user.is_active());
        assert!(!user.is_admin());
        assert_eq!(user.peer_limit, 2);

        // duplicate email rejected
        let err = store.create_user("alice@example.com", 1, false).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail));

        let old = store.set_peer_limit(&user.id, 5).await.unwrap();
        assert_eq!(old, 2);
        assert_eq!(store.get_user(&user.id).await.unwrap().unwrap().peer_limit, 5);

        store.deactivate_user(&user.id).await.unwrap();
        assert!(!store.get_user(&user.id).await.unwrap().unwrap().is_active());

        let err = store.deactivate_user("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::UserNotFound));
    }

    #[tokio::test]
    async fn test_token_validation() {
        let store = Store::in_memory().await.unwrap();
        let user = store.create_user("bob@example.com", 1, true).await.unwrap();

        let (token, _) = store.create_token(&user.id, None).await.unwrap();

        let (resolved_token, resolved_user) =
            store.validate_token(&token).await.unwrap().unwrap();
        assert_eq!(resolved_token.user_id, user.id);
        assert_eq!(resolved_user.email, "bob@example.com");
        assert!(resolved_user.is_admin());

        assert!(store.validate_token("not-a-token").await.unwrap().is_none());

        // expired token is rejected
        let expired = Utc::now() - chrono::Duration::hours(1);
        let (token, _) = store.create_token(&user.id, Some(expired)).await.unwrap();
        assert!(store.validate_token(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_peer_dedup() {
        let store = Store::in_memory().await.unwrap();

        let peer = store.insert_peer("10.8.0.2/24", "ct").await.unwrap();
        assert!(peer.is_some());

        let dup = store.insert_peer("10.8.0.2/24", "ct2").await.unwrap();
        assert!(dup.is_none());

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.available_peers, 1);
    }
}
