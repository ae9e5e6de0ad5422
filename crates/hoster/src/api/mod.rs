//! HTTP API module.
//!
//! JSON endpoints consumed by the web control panel.

mod error;
pub mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::{AppState, InstanceRef};
