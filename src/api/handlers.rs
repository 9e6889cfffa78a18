//! REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::audit::{AuditTrail, EventType};
use crate::auth::AuthContext;
use crate::crypto::ConfigCipher;
use crate::db::{Peer, PeerStatus, Store};
use crate::peers::directory::DEFAULT_PAGE_SIZE;
use crate::peers::{AdminPeerRow, AllocationEngine, Page, PeerDirectory, PeerError, PeerFilters};

/// Application state shared across handlers.
pub struct AppState {
    pub store: Store,
    pub directory: PeerDirectory,
    pub engine: AllocationEngine,
    pub audit: AuditTrail,
    pub cipher: ConfigCipher,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Peer as presented to API callers. Never carries the ciphertext.
#[derive(Debug, Serialize)]
pub struct PeerDto {
    pub id: String,
    pub public_key: String,
    pub status: PeerStatus,
    pub friendly_name: Option<String>,
    pub claimed_at: Option<String>,
    pub revoked_at: Option<String>,
}

impl From<Peer> for PeerDto {
    fn from(peer: Peer) -> Self {
        Self {
            id: peer.id,
            public_key: peer.public_key,
            status: peer.status,
            friendly_name: peer.friendly_name,
            claimed_at: peer.claimed_at.map(|dt| dt.to_rfc3339()),
            revoked_at: peer.revoked_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

/// Admin listing row: peer plus owner info for display.
#[derive(Debug, Serialize)]
pub struct AdminPeerDto {
    pub id: String,
    pub public_key: String,
    pub status: PeerStatus,
    pub friendly_name: Option<String>,
    pub owner_id: Option<String>,
    pub owner_email: Option<String>,
    pub imported_at: String,
    pub claimed_at: Option<String>,
    pub revoked_at: Option<String>,
}

impl From<AdminPeerRow> for AdminPeerDto {
    fn from(row: AdminPeerRow) -> Self {
        let peer = row.peer;
        Self {
            id: peer.id,
            public_key: peer.public_key,
            status: peer.status,
            friendly_name: peer.friendly_name,
            owner_id: peer.owner_id,
            owner_email: row.owner_email,
            imported_at: peer.imported_at.to_rfc3339(),
            claimed_at: peer.claimed_at.map(|dt| dt.to_rfc3339()),
            revoked_at: peer.revoked_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

/// Pagination envelope.
#[derive(Debug, Serialize)]
pub struct PageDto<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub size: i64,
    pub total: i64,
}

impl<T, U: From<T>> From<Page<T>> for PageDto<U> {
    fn from(page: Page<T>) -> Self {
        Self {
            items: page.items.into_iter().map(U::from).collect(),
            page: page.page,
            size: page.size,
            total: page.total,
        }
    }
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal_error() -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error: "internal error".to_string() }),
    )
}

/// Map a domain outcome to its HTTP status. Storage failures are logged
/// with full detail and surfaced as a generic 500.
fn peer_error(e: PeerError) -> ApiError {
    let status = match &e {
        PeerError::NotFound | PeerError::UserNotFound | PeerError::NoAvailable => {
            StatusCode::NOT_FOUND
        }
        PeerError::LimitExceeded { .. }
        | PeerError::PeerNotAvailable
        | PeerError::InvalidName => StatusCode::BAD_REQUEST,
        PeerError::DuplicateName | PeerError::ConcurrentClaimConflict => StatusCode::CONFLICT,
        PeerError::Forbidden => StatusCode::FORBIDDEN,
        PeerError::Database(e) => {
            error!(error = %e, "Storage failure");
            return internal_error();
        }
    };

    (status, Json(ErrorResponse { error: e.to_string() }))
}

fn parse_status_filter(raw: Option<String>) -> Result<Option<PeerStatus>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) => PeerStatus::parse(&s).map(Some).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse { error: format!("invalid status filter: {s}") }),
            )
        }),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub page: Option<i64>,
    pub size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AdminListParams {
    pub status: Option<String>,
    pub owner_id: Option<String>,
    pub page: Option<i64>,
    pub size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub friendly_name: String,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub user_id: String,
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/peers", get(list_my_peers))
        .route("/api/v1/peers/claim", post(claim_peer))
        .route("/api/v1/peers/{id}", axum::routing::patch(rename_peer).delete(revoke_peer))
        .route("/api/v1/peers/{id}/download", get(download_peer))
        .route("/api/v1/admin/peers", get(admin_list_peers))
        .route("/api/v1/admin/peers/{id}", delete(revoke_peer))
        .route("/api/v1/admin/peers/{id}/assign", post(assign_peer))
        .with_state(Arc::new(state))
}

/// Health check endpoint (no auth required).
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Claim the oldest available peer for the calling user.
async fn claim_peer(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
) -> Result<Json<PeerDto>, ApiError> {
    let peer = state.engine.claim_next(&ctx).await.map_err(peer_error)?;
    Ok(Json(peer.into()))
}

/// List the calling user's peers.
async fn list_my_peers(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Query(params): Query<ListParams>,
) -> Result<Json<PageDto<PeerDto>>, ApiError> {
    let status = parse_status_filter(params.status)?;

    let page = state
        .directory
        .list_for_owner(
            &ctx,
            &ctx.user_id,
            status,
            params.page.unwrap_or(1),
            params.size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await
        .map_err(peer_error)?;

    Ok(Json(page.into()))
}

/// Set a peer's friendly name.
async fn rename_peer(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<PeerDto>, ApiError> {
    let peer = state
        .engine
        .rename(&ctx, &id, &req.friendly_name)
        .await
        .map_err(peer_error)?;

    Ok(Json(peer.into()))
}

/// Revoke a peer. Owner-scoped on the user route, any peer on the admin
/// route; the engine checks the caller either way.
async fn revoke_peer(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.revoke(&ctx, &id).await.map_err(peer_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Download a peer's decrypted configuration as a `.conf` attachment.
async fn download_peer(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let peer = state.directory.find_by_id(&ctx, &id).await.map_err(peer_error)?;

    let plaintext = state.cipher.decrypt(&peer.config_ciphertext).map_err(|e| {
        error!(peer_id = %peer.id, error = %e, "Failed to decrypt peer configuration");
        internal_error()
    })?;

    state
        .audit
        .record(
            EventType::PeerDownload,
            Some(&ctx.user_id),
            "peers",
            &peer.id,
            json!({ "public_key": peer.public_key }),
        )
        .await;

    let filename = peer.friendly_name.clone().unwrap_or_else(|| peer.id.clone());

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}.conf\""),
            ),
        ],
        plaintext,
    ))
}

/// Assign a peer to a user (admin).
async fn assign_peer(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Path(id): Path<String>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<PeerDto>, ApiError> {
    let peer = state
        .engine
        .assign(&ctx, &id, &req.user_id)
        .await
        .map_err(peer_error)?;

    Ok(Json(peer.into()))
}

/// List all peers with filters (admin).
async fn admin_list_peers(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Query(params): Query<AdminListParams>,
) -> Result<Json<PageDto<AdminPeerDto>>, ApiError> {
    let filters = PeerFilters {
        status: parse_status_filter(params.status)?,
        owner_id: params.owner_id,
    };

    let page = state
        .directory
        .list_all(
            &ctx,
            &filters,
            params.page.unwrap_or(1),
            params.size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await
        .map_err(peer_error)?;

    Ok(Json(page.into()))
}
