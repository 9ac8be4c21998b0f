//! Web API 层。
//!
//! 提供 Axum 路由，将 HTTP / WebSocket 请求委托给应用层的任务用例和实时推送中心。

mod auth;
mod error;
pub mod metrics;
mod routes;
mod state;
mod ws_connection;

pub use auth::{AuthenticatedUser, Claims, JwtService};
pub use config::JwtConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
