use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use super::{
    config::Config,
    database::{RedisStore, init_redis},
    engine::TallyEngine,
    memory::MemoryStore,
    store::TallyStore,
};

pub struct AppState {
    pub config: Config,
    pub engine: TallyEngine,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let store: Arc<dyn TallyStore> = match &config.redis_url {
            Some(redis_url) => {
                let connection = init_redis(redis_url).await?;
                info!("Using Redis store with prefix {}", config.redis_prefix);

                Arc::new(RedisStore::new(connection, config.redis_prefix.clone()))
            }
            None => {
                warn!("REDIS_URL not set, votes are kept in memory and lost on restart");

                Arc::new(MemoryStore::new())
            }
        };

        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: Arc<dyn TallyStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            engine: TallyEngine::new(store),
        })
    }
}
