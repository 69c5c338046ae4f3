use crate::state::AppState;
use axum::Router;

mod dto;
pub mod extractors;
pub mod handlers;
pub mod memory;
pub mod password;
pub mod rate_limit;
pub mod recovery;
pub mod repo;
pub mod repo_types;
pub mod service;
pub mod session;
pub mod tokens;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::me_routes())
}
