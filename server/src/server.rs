use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use system::ConnectionId;
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::document_file::{FileDocumentStore, StoreError};
use crate::gateway::{AuthorizationOracle, PersistenceGateway};
use crate::handlers;
use crate::identity::{IdentityVerifier, StaticTokenVerifier};
use crate::registry::SessionRegistry;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open document store: {0}")]
    Store(#[from] StoreError),
    #[error("server i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a request handler needs, shared by all workers.
pub struct ServerState {
    pub config: Config,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub oracle: Arc<dyn AuthorizationOracle>,
    pub registry: Arc<SessionRegistry>,
    connection_id_source: AtomicU32,
}

impl ServerState {
    pub fn new(
        config: Config,
        verifier: Arc<dyn IdentityVerifier>,
        oracle: Arc<dyn AuthorizationOracle>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            gateway,
            oracle.clone(),
            config.persistence.clone(),
        ));
        Self {
            config,
            verifier,
            oracle,
            registry,
            connection_id_source: AtomicU32::new(0),
        }
    }

    /// Process-unique, wrapping on overflow.
    pub fn new_connection_id(&self) -> ConnectionId {
        self.connection_id_source
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }
}

/// Serves until interrupted, then saves every live session.
pub async fn run(config: Config) -> Result<(), StartupError> {
    let store = Arc::new(FileDocumentStore::open(&config.storage.data_dir).await?);
    let verifier = Arc::new(StaticTokenVerifier::from_config(&config.identity));
    let bind = config.server.bind;
    let state = web::Data::new(ServerState::new(
        config,
        verifier,
        store.clone(),
        store.clone(),
    ));

    log::info!(
        "Serving documents from {} on {}",
        store.data_dir().display(),
        bind
    );

    let app_state = state.clone();
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(handlers::root)
    })
    .bind(bind)?
    .run()
    .await?;

    log::info!("Shutting down, saving live sessions");
    state.registry.persist_all().await;
    Ok(())
}
