//! Store: the long-lived handle units of work are created from.
//!
//! A store owns the connection provider, the metadata registry and the
//! default [`UnitOfWorkConfig`]. Every unit of work it creates is independent:
//! its own connection, identity map and queues.
//!
//! # Example
//!
//! ```rust,ignore
//! use relmap::prelude::*;
//!
//! let store = Store::builder(provider)
//!     .register::<Team>()
//!     .register::<Hero>()
//!     .config(UnitOfWorkConfig::new().log_sql(true))
//!     .build()?;
//!
//! let mut uow = store.unit_of_work()?;
//! ```

use relmap_core::{ConnectionProvider, Entity, EntityMeta, MetadataRegistry, Result};
use relmap_session::{UnitOfWork, UnitOfWorkConfig};
use std::sync::Arc;

type Registration = fn(&MetadataRegistry) -> Result<Arc<EntityMeta>>;

/// Shared provider, registry and defaults.
#[derive(Debug)]
pub struct Store<P: ConnectionProvider> {
    provider: Arc<P>,
    registry: Arc<MetadataRegistry>,
    config: UnitOfWorkConfig,
}

impl<P: ConnectionProvider> Clone for Store<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
        }
    }
}

impl<P: ConnectionProvider> Store<P> {
    /// Create a store builder.
    #[must_use]
    pub fn builder(provider: P) -> StoreBuilder<P> {
        StoreBuilder::new(Arc::new(provider))
    }

    /// Start a new unit of work with the store's defaults.
    pub fn unit_of_work(&self) -> Result<UnitOfWork<P>> {
        self.unit_of_work_with(self.config.clone())
    }

    /// Start a new unit of work with its own configuration.
    pub fn unit_of_work_with(&self, config: UnitOfWorkConfig) -> Result<UnitOfWork<P>> {
        UnitOfWork::with_config(
            Arc::clone(&self.provider),
            Arc::clone(&self.registry),
            config,
        )
    }

    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }
}

/// Builder for [`Store`].
///
/// Entity types passed to [`register`](Self::register) have their metadata
/// built and validated in registration order when [`build`](Self::build)
/// runs, so a bad metadata table fails at startup rather than on first use.
#[derive(Debug)]
pub struct StoreBuilder<P: ConnectionProvider> {
    provider: Arc<P>,
    registry: Option<Arc<MetadataRegistry>>,
    config: UnitOfWorkConfig,
    registrations: Vec<Registration>,
}

impl<P: ConnectionProvider> StoreBuilder<P> {
    fn new(provider: Arc<P>) -> Self {
        Self {
            provider,
            registry: None,
            config: UnitOfWorkConfig::default(),
            registrations: Vec::new(),
        }
    }

    /// Use an existing registry instead of a fresh one.
    #[must_use]
    pub fn registry(mut self, registry: Arc<MetadataRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Default configuration for new units of work.
    #[must_use]
    pub fn config(mut self, config: UnitOfWorkConfig) -> Self {
        self.config = config;
        self
    }

    /// Build `E`'s metadata when the store is built.
    #[must_use]
    pub fn register<E: Entity>(mut self) -> Self {
        self.registrations.push(|registry| registry.register::<E>());
        self
    }

    /// Validate the configuration and run the registrations in order.
    pub fn build(self) -> Result<Store<P>> {
        self.config.validate()?;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(MetadataRegistry::new()));
        for registration in &self.registrations {
            let meta = registration(&registry)?;
            tracing::debug!(entity = meta.entity(), table = meta.table(), "Registered entity");
        }
        tracing::info!(entities = registry.len(), "Store ready");
        Ok(Store {
            provider: self.provider,
            registry,
            config: self.config,
        })
    }
}
