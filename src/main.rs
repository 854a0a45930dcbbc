use anyhow::Result;
use clap::Parser;
use config::Config;
use hyper::server::conn::http1;
use hls_vod_core::http::HlsServer;
use hls_vod_core::settings::Settings;
use hyper_util::rt::TokioIo;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Override the configured listen port.
    #[arg(long)]
    listen: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let args = Args::parse();

    let builder = Config::builder()
        .add_source(config::File::with_name(&args.config))
        .add_source(config::Environment::with_prefix("APP"))
        .build()?;

    let mut settings: Settings = builder.try_deserialize()?;
    if let Some(listen) = args.listen {
        settings.port = listen;
    }
    if settings.debug {
        info!("debug logging requested via config; set RUST_LOG=debug to see it");
    }

    tokio::fs::create_dir_all(settings.cache_root()).await?;

    let settings = Arc::new(settings);
    let server = HlsServer::new(settings.clone());

    let addr: SocketAddr = format!("0.0.0.0:{}", settings.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    let cache_root = settings.cache_root();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, _peer) = accepted?;
                let io = TokioIo::new(stream);
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = http1::Builder::new().serve_connection(io, server).await {
                        error!("connection error: {e}");
                    }
                });
            }
        }
    }

    if let Err(e) = tokio::fs::remove_dir_all(&cache_root).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!("failed to remove cache root {}: {e}", cache_root.display());
        }
    }

    Ok(())
}
