//! Server wiring: load configuration and keys, open the stores, reconcile
//! the cache, spawn the tree-walker, serve HTTP.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use fedanchor_jose::KeyStore;
use tokio::net::TcpListener;

use crate::admission;
use crate::cache::Cache;
use crate::config::{ServerConfig, TrustAnchorConfig};
use crate::db::Db;
use crate::fetch::Fetcher;
use crate::statement;
use crate::trustmarks;
use crate::walker;
use crate::web;

/// Everything a request handler needs. Read-only after startup except for
/// the external stores, which manage their own synchronization.
pub struct AppState {
    pub config: TrustAnchorConfig,
    pub keys: KeyStore,
    pub db: Db,
    pub cache: Cache,
    pub fetcher: Fetcher,
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server { config }
    }

    pub async fn run(self) -> Result<()> {
        let ta_config = TrustAnchorConfig::load(Path::new(&self.config.profile))?;
        let keys = KeyStore::load(
            &ta_config.signing_private_key,
            &ta_config.signing_public_keys,
            ta_config.historical_keys_dir.as_deref(),
        )
        .context("loading signing keys")?;
        let db = Db::open(&self.config.db_path).context("opening database")?;
        let cache = Cache::connect(&self.config.redis_url)
            .await
            .context("connecting to cache")?;
        let fetcher = Fetcher::new(ta_config.fetch_timeout);

        let state = Arc::new(AppState {
            config: ta_config,
            keys,
            db,
            cache,
            fetcher,
        });

        publish_server_artifacts(&state).await?;
        reconcile_cache(&state).await;

        tokio::spawn(walker::run(state.clone()));

        let app = web::router(state);
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.config.listen_addr))?;
        tracing::info!("serving on {}", self.config.listen_addr);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// Sign and publish the TA's entity configuration and, when historical
/// keys are configured, the historical-keys statement.
async fn publish_server_artifacts(state: &AppState) -> Result<()> {
    let entity = statement::create_entity_configuration(&state.config, &state.keys)?;
    state.cache.set_entity_configuration(&entity).await?;
    tracing::info!("entity configuration published");

    match statement::create_historical_keys_jws(&state.config, &state.keys) {
        Ok(token) => {
            state.cache.set_historical_keys(&token).await?;
            tracing::info!(
                keys = state.keys.historical_keys().len(),
                "historical keys published"
            );
        }
        Err(crate::error::FederationError::NotFound(_)) => {
            tracing::debug!("no historical keys to publish");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Bring the cache back in line with the durable store after a restart.
/// A crash between persist and publish may have left it lagging; active
/// rows are simply re-published. Failures here are logged, not fatal —
/// the admin surface can re-run the publication at any time.
async fn reconcile_cache(state: &AppState) {
    match admission::republish_subordinates(state).await {
        Ok(count) => tracing::info!(subordinates = count, "subordinate statements republished"),
        Err(e) => tracing::error!("failed to republish subordinates: {e}"),
    }
    match trustmarks::reload_issued_marks(state).await {
        Ok(count) => tracing::info!(trust_marks = count, "issued trust marks reloaded"),
        Err(e) => tracing::error!("failed to reload trust marks: {e}"),
    }
}
