#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use factgate::{
    FactPipeline, LocalPipeline, MonotonicClock, RemoteStore, StorageBackend, StoreFactory,
    TokenBucketLimiter,
};
use server::config::{CliArgs, ServerConfig, StoreConfig};
use server::service::handler::{AppState, router};
use server::telemetry::{init_telemetry, observe_limiter};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let remote = config.store.as_ref().map(build_store_factory);
    if let Some(factory) = &remote {
        // The limiter fails over on its own; this only surfaces a bad URL early.
        if let Err(_e) = factory.connect(false).await {
            #[cfg(feature = "tracing")]
            tracing::warn!("Remote store not reachable at startup, serving locally: {_e}");
        }
    }

    let limiter = Arc::new(TokenBucketLimiter::new(
        config.limiter.clone(),
        remote,
        Arc::new(MonotonicClock::default()),
    ));
    observe_limiter(&limiter);

    let pipeline: Arc<dyn FactPipeline> = Arc::new(LocalPipeline);
    let state = AppState::new(config.clone(), limiter, pipeline);

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config.server_addr, &config);

    axum::serve(
        listener,
        router(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.clone()))
    .await?;

    if let Some(factory) = state.limiter.remote_factory() {
        factory.close().await;
    }
    providers.shutdown();

    #[cfg(feature = "tracing")]
    tracing::info!("Service shut down successfully");
    Ok(())
}

fn build_store_factory(store: &StoreConfig) -> Arc<StoreFactory> {
    let url = store.url.clone();
    let op_timeout = store.op_timeout;
    Arc::new(StoreFactory::new(
        "rate_limit",
        move || {
            let url = url.clone();
            async move {
                let store = RemoteStore::connect(&url, op_timeout).await?;
                Ok::<_, factgate::Error>(Arc::new(store) as Arc<dyn StorageBackend>)
            }
        },
        store.connect_attempts,
        store.retry_delay,
    ))
}

fn log_startup_info(_addr: &str, _config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting stream service on {} with full config: {:#?}",
            _addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting stream service on {} ({} store)",
            _addr,
            if _config.store.is_some() { "remote" } else { "local" }
        );
    }
}

async fn shutdown_signal(state: AppState) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");

    state.registry.shutdown().await;
}
