use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use attribution_engine::{AppState, Config, PgStore, init_router};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    let store = PgStore::connect(&config.database_url).await?;

    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);

    let app = init_router(AppState {
        store: Arc::new(store),
        config,
    });
    axum::serve(listener, app).await?;
    Ok(())
}
