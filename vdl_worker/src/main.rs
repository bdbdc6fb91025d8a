use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use vdl_core::{DownloadCtx, ProviderRegistry, RedisKv, Settings, TaskStore, Worker};

/// Multi-source video download service — queue worker.
#[derive(Parser, Debug)]
#[command(name = "vdl_worker")]
struct Args {
    /// Concurrent downloads handled by this process.
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
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

    let kv = match RedisKv::connect(&settings.redis_url).await {
        Ok(kv) => Arc::new(kv),
        Err(err) => {
            eprintln!("store connection failed ({}): {err}", settings.redis_url);
            std::process::exit(1);
        }
    };
    let store = TaskStore::new(kv, &settings);
    let registry = Arc::new(ProviderRegistry::with_defaults(&settings));
    let shutdown = CancellationToken::new();

    let mut handles = Vec::new();
    for slot in 0..args.concurrency.max(1) {
        let ctx = DownloadCtx::new(store.clone(), Arc::clone(&settings));
        let worker = Worker::new(ctx, Arc::clone(&registry));
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            log::info!("[main] worker slot {slot} up");
            worker.run(shutdown).await;
        }));
    }

    tokio::signal::ctrl_c().await.expect("ctrl-c handler");
    log::info!("[main] shutdown requested, draining workers");
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
}
