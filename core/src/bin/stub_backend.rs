/// Stub chat backend for local development
///
/// Usage: stub-backend [--port 8787] [--seed seed.json]
use estatechat_core::stub_server::{start_stub_server, StubBackend};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let mut port: u16 = env::var("ESTATECHAT_STUB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8787);
    let mut seed: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                port = args[i + 1]
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Invalid port: {}", args[i + 1]))?;
                i += 2;
            }
            "--seed" if i + 1 < args.len() => {
                seed = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            _ => i += 1,
        }
    }

    let backend = match &seed {
        Some(path) => {
            info!("Seeding from {}", path.display());
            StubBackend::from_seed_file(path)
                .map_err(|e| anyhow::anyhow!("Seed error: {}", e))?
        }
        None => StubBackend::new(),
    };

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let (_bound, server) = start_stub_server(Arc::new(backend), addr)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    tokio::select! {
        _ = server => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
