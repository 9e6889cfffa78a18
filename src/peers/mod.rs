//! Peer directory and allocation engine.

pub mod directory;
pub mod engine;

pub use directory::{AdminPeerRow, Page, PeerDirectory, PeerFilters, MAX_PAGE_SIZE};
pub use engine::AllocationEngine;

use thiserror::Error;

/// Outcomes of peer directory and allocation operations.
///
/// Domain outcomes map to specific HTTP statuses at the handler layer;
/// `Database` is logged server-side and surfaced as a generic 500.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer not found")]
    NotFound,

    #[error("User not found")]
    UserNotFound,

    #[error("you have reached your peer limit ({limit})")]
    LimitExceeded { limit: i64 },

    #[error("no peers are available to claim")]
    NoAvailable,

    #[error("peer must be revoked before it can be reassigned")]
    PeerNotAvailable,

    #[error("friendly name is already taken")]
    DuplicateName,

    #[error("friendly name must be 1-63 lowercase alphanumeric characters or hyphens")]
    InvalidName,

    #[error("peer was claimed concurrently, please retry")]
    ConcurrentClaimConflict,

    #[error("not authorized")]
    Forbidden,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
