//! The session factory: explicitly-constructed, process-wide shared state.
//!
//! One factory owns the immutable [`MetadataRegistry`] and the shared
//! [`Driver`] (connection pool). It is created once at startup, passed
//! explicitly to whatever needs sessions, and torn down once with
//! [`SessionFactory::close`] -- never an ambient singleton.
//!
//! The factory is where a caller commits to a calling convention:
//! [`open_deferred`] and [`open_streaming`] hand back the two adapter
//! shapes over the identical session core.
//!
//! [`open_deferred`]: SessionFactory::open_deferred
//! [`open_streaming`]: SessionFactory::open_streaming

use std::sync::Arc;

use tracing::info;

use tidemark_driver::{Driver, PgDriver};
use tidemark_types::MetadataRegistry;

use crate::bridge::{DeferredSession, StreamingSession};
use crate::config::{ApiConvention, FactoryConfig};
use crate::error::SessionError;
use crate::session::Session;

/// Shared factory for sessions over one metadata registry and one driver.
#[derive(Clone)]
pub struct SessionFactory {
    registry: Arc<MetadataRegistry>,
    driver: Arc<dyn Driver>,
    convention: ApiConvention,
}

impl SessionFactory {
    /// Build a factory over an existing driver.
    pub fn new(registry: Arc<MetadataRegistry>, driver: Arc<dyn Driver>) -> Self {
        Self {
            registry,
            driver,
            convention: ApiConvention::Deferred,
        }
    }

    /// Record the deployment's selected calling convention.
    #[must_use]
    pub const fn with_convention(mut self, convention: ApiConvention) -> Self {
        self.convention = convention;
        self
    }

    /// Connect a `PostgreSQL`-backed factory from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Driver`] if the pool cannot be
    /// established.
    pub async fn connect(
        config: &FactoryConfig,
        registry: Arc<MetadataRegistry>,
    ) -> Result<Self, SessionError> {
        let driver = PgDriver::connect(&config.database.to_postgres_config()).await?;
        info!(
            entities = registry.len(),
            convention = ?config.session.api,
            "session factory ready"
        );
        Ok(Self {
            registry,
            driver: Arc::new(driver),
            convention: config.session.api,
        })
    }

    /// The registry this factory maps against.
    pub const fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    /// The calling convention selected at configuration time.
    pub const fn convention(&self) -> ApiConvention {
        self.convention
    }

    /// Open a core session (convention-neutral).
    pub fn open(&self) -> Session {
        Session::new(Arc::clone(&self.registry), Arc::clone(&self.driver))
    }

    /// Open a session spoken to through single-completion futures.
    pub fn open_deferred(&self) -> DeferredSession {
        DeferredSession::new(self.open())
    }

    /// Open a session spoken to through streams.
    pub fn open_streaming(&self) -> StreamingSession {
        StreamingSession::new(self.open())
    }

    /// Tear the factory down, closing the underlying pool. Sessions
    /// already open keep their borrowed connections until they close.
    pub async fn close(&self) {
        self.driver.close().await;
        info!("session factory closed");
    }
}
