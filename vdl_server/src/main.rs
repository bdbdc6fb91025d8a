use std::sync::Arc;

use clap::Parser;

use vdl_core::{DownloadCtx, Orchestrator, ProviderRegistry, RedisKv, Settings, TaskStore};
use vdl_server::server::{router, AppState};

/// Multi-source video download service — HTTP API.
#[derive(Parser, Debug)]
#[command(name = "vdld")]
struct Args {
    /// Bind address (overrides VDL_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides VDL_PORT).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let settings = match Settings::from_env() {
        Ok(settings) => Arc::new(settings),
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let host = args
        .host
        .or_else(|| std::env::var("VDL_HOST").ok())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args
        .port
        .or_else(|| std::env::var("VDL_PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(8597);
    let addr = format!("{host}:{port}");

    let kv = match RedisKv::connect(&settings.redis_url).await {
        Ok(kv) => Arc::new(kv),
        Err(err) => {
            eprintln!("store connection failed ({}): {err}", settings.redis_url);
            std::process::exit(1);
        }
    };
    let store = TaskStore::new(kv, &settings);
    let registry = Arc::new(ProviderRegistry::with_defaults(&settings));
    let ctx = DownloadCtx::new(store, Arc::clone(&settings));
    let orchestrator = Arc::new(Orchestrator::new(ctx, registry));

    // Pick up whatever the previous process left behind before serving.
    if let Err(err) = orchestrator.recover().await {
        log::error!("[main] restart recovery failed: {err}");
    }

    let state = AppState::new(orchestrator);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    log::info!("vdld listening on http://{addr}  (set VDL_PORT to override)");
    axum::serve(listener, app).await.expect("server error");
}
