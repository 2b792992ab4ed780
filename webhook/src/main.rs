use anyhow::Result;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use clap::Parser;
use kube::Client;
use owo_colors::OwoColorize;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use kubetask_common::args::ServerArgs;

mod auth;
mod concurrency;
mod error;
mod filter;
mod handlers;
mod reconcile;
mod registry;
mod status;
mod template;

use handlers::AppState;
use registry::Registry;

#[tokio::main]
async fn main() -> Result<()> {
    kubetask_common::init();
    kubetask_common::metrics::maybe_spawn_metrics_server();

    let args = ServerArgs::parse();
    let client = Client::try_default().await?;
    let registry = Registry::new();

    println!("{}", "🚀 kubetask-webhook starting up".green());

    let watch_namespace = args.watch_namespace().map(str::to_string);
    let sync_client = client.clone();
    let sync_registry = registry.clone();
    let sync_handle = tokio::spawn(async move {
        reconcile::run(sync_client, sync_registry, watch_namespace.as_deref()).await
    });

    let state = AppState { client, registry };
    let app = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/webhooks/{namespace}/{name}", post(handlers::webhook_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
                .layer(axum::middleware::from_fn(kubetask_common::access_log::public)),
        )
        .layer(DefaultBodyLimit::max(args.max_body_bytes))
        .with_state(state);

    let listener = TcpListener::bind(&args.listen_addr).await?;
    println!(
        "{}{}",
        "📡 Listening for webhooks • addr=".green(),
        args.listen_addr.green().dimmed(),
    );

    kubetask_common::signal_ready();

    axum::serve(listener, app)
        .with_graceful_shutdown(kubetask_common::shutdown::shutdown_signal())
        .await?;

    sync_handle.abort();
    println!("{}", "🛑 kubetask-webhook shut down gracefully".red());
    Ok(())
}
