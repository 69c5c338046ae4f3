use std::sync::Arc;

use ledgerkeep::{app, auth::service::spawn_sweeper, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "ledgerkeep=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let state = AppState::init().await?;
    tracing::info!(env = ?state.config.env, "configuration loaded");

    state
        .auth
        .bootstrap_default_admin(state.config.env, &state.config.bootstrap)
        .await?;

    spawn_sweeper(Arc::clone(&state.auth), state.config.sweep_interval());

    app::serve(app::build_app(state)).await
}
