use anyhow::Context;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use junknas_nameserver::{FileSystem, NameServerConfig};

mod api;

use api::{AppState, SharedState};

// -----------------------------------------------------------------------------
// Main entry
// -----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NameServerConfig::from_env().context("invalid JUNKNAS_* configuration")?;

    let level: Level = config
        .log_level
        .parse()
        .with_context(|| format!("invalid log level {:?}", config.log_level))?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    debug!("configuration: {}", serde_json::to_string(&config)?);

    let addr = config.listen_addr;
    let image_dir = config.image_dir.clone();
    let fs = tokio::task::spawn_blocking(move || FileSystem::open(config))
        .await?
        .with_context(|| format!("cannot open namespace in {}", image_dir.display()))?;
    let fs = Arc::new(fs);

    let state: SharedState = Arc::new(AppState::new(fs.clone()));
    tokio::spawn(api::run_deletion_fanout(
        state.clone(),
        fs.subscribe_deletions(),
    ));

    let app = Router::new()
        // namespace
        .route("/api/fs/lookup", get(api::lookup))
        .route("/api/fs/list", get(api::list))
        .route("/api/fs/mkdir", post(api::mkdir))
        .route("/api/fs/create", post(api::create))
        .route("/api/fs/append-block", post(api::append_block))
        .route("/api/fs/commit-block", post(api::commit_block))
        .route("/api/fs/close", post(api::close))
        .route("/api/fs/delete", delete(api::delete))
        .route("/api/fs/move", post(api::move_entry))
        .route("/api/fs/checkpoint", post(api::checkpoint))
        // blocks and storage servers
        .route("/api/blocks", get(api::blocks))
        .route("/api/blocks/replicate", post(api::replicate))
        .route("/api/servers/heartbeat", post(api::heartbeat))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(
        "junkNAS name server {} listening on {}",
        fs.namespace_id(),
        addr
    );

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
