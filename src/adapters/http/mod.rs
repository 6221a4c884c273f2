//! JSON-over-HTTP surface for agents and the dashboard.

pub mod error;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult, ErrorBody};
pub use routes::{router, AppState};
pub use server::{build_app, HttpServer};
