// HTTP server setup (Axum + WebSocket fanout)
pub mod app;
pub mod error;
pub mod routes;
pub mod ws;

pub use app::{build_app, build_runtime, AppState, Runtime};
pub use error::ApiError;
