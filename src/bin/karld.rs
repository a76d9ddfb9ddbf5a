//! Thin launcher around the `karl` library: load config, build the routers,
//! serve until ctrl-c.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use karl::config::LauncherConfig;
use karl::{Karl, StreamBacking, telemetry, time};

#[derive(Debug, Parser)]
#[command(name = "karld", about = "Fleet keepalive orchestrator")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured HTTP port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> karl::Result<()> {
    let args = Args::parse();
    let mut config = LauncherConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    telemetry::init(&config.logging);

    std::fs::create_dir_all(&config.data_dir)?;
    let karl = Karl::new(
        config.karl_parameters(),
        StreamBacking::File(config.keepalive_log_path()),
        StreamBacking::File(config.store_log_path()),
        time::wall_clock(),
    )?;

    let app = karl
        .router()
        .nest("/keepalives", karl::stream::http::stream_router(karl.keepalives_handle()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await?;

    drop(karl);
    Ok(())
}
