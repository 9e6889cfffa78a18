//! Database module: schema, models and account management.

pub mod models;
pub mod store;

pub use models::{ApiToken, AuditEvent, Peer, PeerStatus, Role, User, UserStatus};
pub use store::{Store, StoreError};
