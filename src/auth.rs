//! Caller identity and in-process authorization.
//!
//! The portal does not trust route placement alone: every directory and
//! engine call receives the caller's `AuthContext` and re-checks
//! ownership/role against the rows it touches.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, StatusCode};
use axum::Json;
use tracing::error;

use crate::api::handlers::{AppState, ErrorResponse};
use crate::db::{Peer, Role, User};

/// The authenticated caller: identity plus granted roles.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub roles: Vec<Role>,
}

impl AuthContext {
    pub fn for_user(user: &User) -> Self {
        Self {
            user_id: user.id.clone(),
            roles: user.roles.clone(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }

    /// Whether the caller owns this peer.
    pub fn owns(&self, peer: &Peer) -> bool {
        peer.owner_id.as_deref() == Some(self.user_id.as_str())
    }

    /// Whether the caller may see this peer at all: admins see everything,
    /// users see only their own.
    pub fn can_view(&self, peer: &Peer) -> bool {
        self.is_admin() || self.owns(peer)
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse { error: message.to_string() }),
    )
}

impl FromRequestParts<Arc<AppState>> for AuthContext {
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let token = match auth_header {
            Some(header) if header.starts_with("Bearer ") => &header[7..],
            _ => return Err(unauthorized("missing bearer token")),
        };

        let resolved = state.store.validate_token(token).await.map_err(|e| {
            error!(error = %e, "Token lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse { error: "internal error".to_string() }),
            )
        })?;

        let Some((_, user)) = resolved else {
            return Err(unauthorized("invalid or expired token"));
        };

        if !user.is_active() {
            return Err(unauthorized("account is deactivated"));
        }

        Ok(AuthContext::for_user(&user))
    }
}
