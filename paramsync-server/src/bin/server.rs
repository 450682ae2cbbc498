//! Parameter-sync server binary: loads configuration from the
//! environment, wires up auth, persistence, and the session hub, and
//! serves the HTTP + WebSocket surface.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use paramsync_server::auth::TokenVerifier;
use paramsync_server::config::Config;
use paramsync_server::hub::HubRegistry;
use paramsync_server::http::{build_router, AppState};
use paramsync_server::query::QuerySurface;
use paramsync_server::logging;
use paramsync_server::store::{NullStore, PersistenceStore, RedisStore};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if config.env.is_production() {
        logging::init_logging("logs", "paramsync-server")?;
    } else {
        logging::init_console_logging();
    }

    info!(env = ?config.env, port = config.port, "starting paramsync-server");

    let verifier = Arc::new(TokenVerifier::new(
        &config.jwt_secret,
        config.jwt_algorithm,
        config.jwt_expiration,
    ));

    let store: Arc<dyn PersistenceStore> = match &config.redis_url {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => {
                info!("connected to redis, session state will persist across restarts");
                Arc::new(store)
            }
            Err(e) => {
                error!(error = %e, "failed to connect to redis, falling back to in-memory-only persistence");
                Arc::new(NullStore)
            }
        },
        None => {
            warn!("REDIS_URL not set, session state will not survive a restart");
            Arc::new(NullStore)
        }
    };

    let hubs = Arc::new(HubRegistry::new(Arc::clone(&store)));
    let query = Arc::new(QuerySurface::new(Arc::clone(&hubs), Arc::clone(&store)));

    let state = AppState {
        hubs,
        verifier,
        query,
        started_at: Instant::now(),
    };

    let router = build_router(state, &config.frontend_url);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");

    axum::serve(listener, router).await?;
    Ok(())
}
