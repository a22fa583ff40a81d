use anyhow::{Context, Result};
use faceswap_core::{Config, ExecutionDevice, FaceSwapExecutor, LazySwapper, ModelInitializer};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod engine;
mod http;
mod storage;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        model_name = %config.model_name,
        swapper_model = %config.swapper_model_path.display(),
        ctx_id = config.ctx_id,
        bind = %config.bind_addr,
        "faceswapd starting"
    );

    // Fail fast: the analysis models must load before we accept requests.
    let (analysis, model) = ModelInitializer::new(&config).initialize_model()?;
    if !config.swapper_model_path.exists() {
        tracing::warn!(
            path = %config.swapper_model_path.display(),
            "swapper model missing; swap requests will fail until it is installed"
        );
    }
    let swapper = LazySwapper::new(&config.swapper_model_path, ExecutionDevice::from_ctx_id(config.ctx_id));
    let engine = engine::spawn_engine(FaceSwapExecutor::new(config.clone(), analysis, swapper))?;

    let _sweeper = storage::spawn_result_sweeper(
        config.result_directory()?,
        Duration::from_secs(config.result_retention_secs),
    );

    let bind_addr = config.bind_addr.clone();
    let app = http::create_app(http::AppState {
        engine,
        config: Arc::new(config),
        model,
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "faceswapd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("faceswapd shutting down");
    Ok(())
}
