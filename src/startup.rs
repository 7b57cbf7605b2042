use std::sync::Arc;

use crate::cache::{CounterCache, ValkeyCounterCache, init_valkey};
use crate::config::Config;
use crate::db::{PgPollStore, PollStore, init_db};
use crate::events::{EventProducer, StreamEventProducer};
use crate::fanout::{FanoutLimits, FanoutManager};
use crate::pubsub::ValkeyPubSubTransport;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn PollStore>,
    pub cache: Arc<dyn CounterCache>,
    pub producer: Arc<dyn EventProducer>,
    pub fanout: FanoutManager,
}

impl AppState {
    pub async fn new(config: Config) -> Self {
        let pool = init_db(&config.database_url)
            .await
            .expect("Unable to connect to Postgres");
        let valkey = init_valkey(&config.valkey_url)
            .await
            .expect("Unable to connect to Valkey");
        let transport =
            ValkeyPubSubTransport::new(&config.valkey_url).expect("Invalid Valkey URL");

        let fanout = FanoutManager::new(
            Arc::new(transport),
            FanoutLimits {
                max_connections_total: config.max_sse_connections_total,
                max_connections_per_user: config.max_sse_connections_per_user,
            },
        );

        AppState {
            config: Arc::new(config),
            store: Arc::new(PgPollStore::new(pool)),
            cache: Arc::new(ValkeyCounterCache::new(valkey.clone())),
            producer: Arc::new(StreamEventProducer::new(valkey)),
            fanout,
        }
    }
}
