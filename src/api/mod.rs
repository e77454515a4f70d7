//! HTTP surface: JSON endpoints for graph mutations and SSE endpoints for
//! streamed generation.

pub mod handlers;
pub mod identity;
pub mod models;
pub mod server;

pub use handlers::AppState;
pub use identity::{HeaderIdentity, IdentityResolver};
pub use models::{ApiError, ErrorResponse};
pub use server::{build_router, build_state, ApiConfig, ApiServer};
