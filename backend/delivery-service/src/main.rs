use actix_web::{web, App, HttpServer};
use delivery_service::{
    config::{self, PresenceBackend, StoreBackend},
    db, error, logging,
    presence::{InMemoryPresence, PresenceRegistry, RedisPresence},
    routes,
    services::{LogPushNotifier, PushNotifier, WebhookPushNotifier},
    state::AppState,
    store::{InMemoryStore, PgStore},
    websocket::{
        pubsub::{start_relay_listener, PubSubRelay},
        BroadcastDispatcher, ConnectionRegistry,
    },
};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = config::Config::from_env()?;

    let registry = ConnectionRegistry::new();
    let mut dispatcher = BroadcastDispatcher::new(registry.clone());

    let presence: Arc<dyn PresenceRegistry> = match cfg.presence {
        PresenceBackend::Memory => Arc::new(InMemoryPresence::new()),
        PresenceBackend::Redis => {
            let redis_url = cfg
                .redis_url
                .clone()
                .ok_or_else(|| error::AppError::Config("REDIS_URL missing".into()))?;
            let client = redis::Client::open(redis_url.as_str())
                .map_err(|e| error::AppError::StartServer(format!("redis: {e}")))?;
            let conn = ConnectionManager::new(client.clone())
                .await
                .map_err(|e| error::AppError::StartServer(format!("redis: {e}")))?;

            // Frames dispatched here are relayed to sockets held by other instances.
            let instance_id = Uuid::new_v4();
            dispatcher = dispatcher.with_relay(PubSubRelay::new(conn.clone(), instance_id));
            let listener_registry = registry.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) =
                        start_relay_listener(client.clone(), listener_registry.clone(), instance_id)
                            .await
                    {
                        tracing::error!(error = %e, "relay listener failed");
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            });

            Arc::new(RedisPresence::new(conn, cfg.presence_ttl_secs))
        }
    };

    let push: Arc<dyn PushNotifier> = match &cfg.push_webhook_url {
        Some(url) => Arc::new(WebhookPushNotifier::new(url.clone())?),
        None => Arc::new(LogPushNotifier),
    };

    let state = match cfg.store {
        StoreBackend::Postgres => {
            let database_url = cfg
                .database_url
                .clone()
                .ok_or_else(|| error::AppError::Config("DATABASE_URL missing".into()))?;
            let pool = db::init_pool(&database_url)
                .await
                .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;
            AppState::new(cfg, Arc::new(PgStore::new(pool)), presence, dispatcher, push)
        }
        StoreBackend::Memory => {
            tracing::warn!("STORE_BACKEND=memory: messages are lost on restart");
            AppState::new(cfg, Arc::new(InMemoryStore::new()), presence, dispatcher, push)
        }
    };

    let reconciler = state.reconciler.clone();
    tokio::spawn(async move { reconciler.start().await });

    let bind_addr = format!("{}:{}", state.config.host, state.config.port);
    tracing::info!(%bind_addr, "starting delivery-service");

    let data = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(data.clone())
            .configure(routes::configure_routes)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind: {e}")))?
    .run()
    .await
    .map_err(|e| error::AppError::StartServer(format!("server: {e}")))
}
