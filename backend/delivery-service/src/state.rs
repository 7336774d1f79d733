use std::sync::Arc;

use crate::{
    config::Config,
    middleware::auth::JwtVerifier,
    presence::PresenceRegistry,
    services::{
        DeliveryService, HistoryService, PushNotifier, ReconciliationJob, UnreadAggregator,
    },
    store::{ConversationDirectory, MessageRepository, ReadMarkerRepository},
    websocket::BroadcastDispatcher,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub messages: Arc<dyn MessageRepository>,
    pub markers: Arc<dyn ReadMarkerRepository>,
    pub directory: Arc<dyn ConversationDirectory>,
    pub presence: Arc<dyn PresenceRegistry>,
    pub dispatcher: BroadcastDispatcher,
    pub delivery: Arc<DeliveryService>,
    pub unread: UnreadAggregator,
    pub history: Arc<HistoryService>,
    pub reconciler: ReconciliationJob,
    pub push: Arc<dyn PushNotifier>,
    pub jwt: JwtVerifier,
}

impl AppState {
    /// Wire every service over one store that implements all repository seams.
    pub fn new<S>(
        config: Config,
        store: Arc<S>,
        presence: Arc<dyn PresenceRegistry>,
        dispatcher: BroadcastDispatcher,
        push: Arc<dyn PushNotifier>,
    ) -> Self
    where
        S: MessageRepository + ReadMarkerRepository + ConversationDirectory + 'static,
    {
        let messages: Arc<dyn MessageRepository> = store.clone();
        let markers: Arc<dyn ReadMarkerRepository> = store.clone();
        let directory: Arc<dyn ConversationDirectory> = store;

        let delivery = Arc::new(DeliveryService::new(
            messages.clone(),
            markers.clone(),
            directory.clone(),
            presence.clone(),
            config.tuning.clone(),
        ));
        let unread = UnreadAggregator::new(messages.clone(), directory.clone());
        let history = Arc::new(HistoryService::new(
            messages.clone(),
            markers.clone(),
            &config.tuning,
        ));
        let reconciler = ReconciliationJob::new(
            messages.clone(),
            markers.clone(),
            &config.reconcile,
            config.tuning.status_broadcast_cap,
        )
        .with_dispatcher(dispatcher.clone());
        let jwt = JwtVerifier::new(&config.jwt_secret);

        Self {
            config: Arc::new(config),
            messages,
            markers,
            directory,
            presence,
            dispatcher,
            delivery,
            unread,
            history,
            reconciler,
            push,
            jwt,
        }
    }
}
