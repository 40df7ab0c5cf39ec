pub mod auth;
pub mod config;
pub mod error;
pub mod generation;
pub mod keys;
pub mod routes;

pub use config::{Args, ConfigError, HubConfig};
pub use error::HubError;
pub use generation::{GenerationJob, GenerationQueue, JobPlan};
pub use keys::FileKeySource;
pub use routes::router;

use am_core::{KeySource, UnavailableKeySource};
use am_storage::StoreContext;
use std::sync::Arc;

pub struct HubState {
    pub config: HubConfig,
    pub ctx: StoreContext,
    pub queue: GenerationQueue,
    pub key_source: Arc<dyn KeySource>,
}

impl HubState {
    /// Builds the shared state and starts the generation worker; must run
    /// inside a tokio runtime.
    pub fn new(config: HubConfig) -> Result<Self, ConfigError> {
        let ctx = config.store_context()?;
        Ok(Self::with_context(config, ctx))
    }

    pub fn with_context(config: HubConfig, ctx: StoreContext) -> Self {
        let key_source: Arc<dyn KeySource> = match &config.key_file {
            Some(path) => Arc::new(FileKeySource::new(path.clone())),
            None => Arc::new(UnavailableKeySource),
        };
        let queue = GenerationQueue::spawn(config.database.clone(), ctx.clone());
        Self {
            config,
            ctx,
            queue,
            key_source,
        }
    }

    pub fn with_key_source(mut self, key_source: Arc<dyn KeySource>) -> Self {
        self.key_source = key_source;
        self
    }
}
