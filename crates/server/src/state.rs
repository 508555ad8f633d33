use ipnetwork::IpNetwork;
use std::path::PathBuf;
use std::sync::Arc;

use refinery_core::{Config, EventBus, Pool, TargetStore};

/// Shared application state
pub struct AppState {
    config: Config,
    config_path: PathBuf,
    store: Arc<dyn TargetStore>,
    pool: Arc<Pool>,
    events: EventBus,
    trusted_nets: Vec<IpNetwork>,
}

impl AppState {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        store: Arc<dyn TargetStore>,
        pool: Arc<Pool>,
        events: EventBus,
        trusted_nets: Vec<IpNetwork>,
    ) -> Self {
        Self {
            config,
            config_path,
            store,
            pool,
            events,
            trusted_nets,
        }
    }

    /// The configuration the process is running with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Where the configuration was loaded from; the config endpoint
    /// re-reads it on request.
    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    pub fn store(&self) -> &Arc<dyn TargetStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Networks allowed to open WebSocket connections; empty means
    /// unrestricted.
    pub fn trusted_nets(&self) -> &[IpNetwork] {
        &self.trusted_nets
    }
}
