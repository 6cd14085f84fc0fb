use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sparmap_render::HeatmapRenderer;
use sparmap_server::{router, AppState, ServerConfig};
use sparmap_session::SessionManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::parse();

    if config.num_threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .build_global()?;
    }

    let max_memory = config.effective_max_memory();
    tracing::info!(
        backend = %config.backend_url,
        port = config.listen_port,
        max_memory,
        threads = config.num_threads,
        cache_path = ?config.cache_path,
        "starting sparmap server"
    );

    let manager = Arc::new(SessionManager::new(
        &config.backend_url,
        config.cache_path.clone(),
        max_memory,
    ));

    let state = AppState {
        manager,
        renderer: Arc::new(HeatmapRenderer::new()),
    };

    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
