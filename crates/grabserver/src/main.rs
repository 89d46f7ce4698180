use std::{path::Path, sync::Arc};

use anyhow::Context;
use grabserver::{
    engine::{probe_binary, YtDlpEngine},
    AppState, Config, InMemoryArtifactStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    std::fs::create_dir_all(&config.download_dir).with_context(|| {
        format!(
            "failed to create DOWNLOAD_DIR at {}",
            config.download_dir.display()
        )
    })?;

    let ytdlp = probe_binary(&config.ytdlp_bin, "--version");
    if !ytdlp {
        tracing::warn!(
            "{} not runnable; downloads and metadata lookups will fail",
            config.ytdlp_bin.display()
        );
    }
    let ffmpeg = probe_binary(
        config.ffmpeg_location.as_deref().unwrap_or(Path::new("ffmpeg")),
        "-version",
    );
    if !ffmpeg {
        tracing::warn!("ffmpeg not found; conversions will fail");
    }

    let engine = Arc::new(YtDlpEngine::new(
        config.ytdlp_bin.clone(),
        config.ffmpeg_location.clone(),
    ));
    let store = Arc::new(InMemoryArtifactStore::new());

    let mut state = AppState::new(config.download_dir.clone(), engine, store);
    state.ytdlp = ytdlp;
    state.ffmpeg = ffmpeg;
    state.cors_allow_any = config.cors_allow_any;

    let app = grabserver::router(state);

    let addr = config.addr();
    tracing::info!("grabserver listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("grabserver failed")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
