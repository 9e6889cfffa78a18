//! HTTP API module.

pub mod handlers;

pub use handlers::{create_router, AppState};
