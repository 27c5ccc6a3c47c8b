use anyhow::Result;
use axum::{extract::DefaultBodyLimit, http::HeaderValue, Router};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mathink::{
    config::Config,
    worker::{self, supervisor::{Supervisor, WorkerCommand}},
    AppState,
};

#[derive(Parser)]
#[command(name = "mathink", about = "Local handwritten-math OCR service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default).
    Serve,
    /// Run the recognition worker loop over stdin/stdout. Spawned by the
    /// server; not meant to be invoked by hand.
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr in both modes: the worker's stdout carries the
    // reply frames and must stay clean.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Worker => worker::run_worker(&config),
        Commands::Serve => serve(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    let worker_command = WorkerCommand::current_exe_worker()?
        .env("RECOGNIZER_CMD", &config.recognizer_command)
        .env("MAX_LINES", &config.segmentation.max_lines.to_string())
        .env("MIN_LINE_H", &config.segmentation.min_line_height.to_string())
        .env("CROP_PAD", &config.segmentation.crop_pad.to_string());

    let supervisor = Arc::new(Supervisor::new(worker_command));
    // Eager start so the first request does not pay the backend load time.
    // A failure here is not fatal; process() retries the spawn lazily.
    if let Err(e) = supervisor.start() {
        error!("worker did not start at boot: {}", e);
    }

    let cors = if config.frontend_origin == "*" {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::exact(
                HeaderValue::from_str(&config.frontend_origin)?,
            ))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    };

    let state = Arc::new(AppState {
        config: config.clone(),
        supervisor: supervisor.clone(),
    });

    let app = Router::new()
        .nest("/api/ocr", mathink::routes::ocr::router())
        .nest("/api/health", mathink::routes::health::router())
        .merge(mathink::swagger::router())
        .layer(DefaultBodyLimit::max(config.max_upload_bytes + 64 * 1024))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server_address).await?;
    info!("server starting on {}", config.server_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server shutting down, stopping worker");
    supervisor.stop();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
