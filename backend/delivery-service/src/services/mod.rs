pub mod delivery;
pub mod diagnostics;
pub mod history;
pub mod push;
pub mod reconciliation;
pub mod unread;

pub use delivery::{DeliveryService, Draft, ReadOutcome, ReadTrigger, SendOutcome};
pub use diagnostics::{diagnose_conversation, Anomaly, ConversationDiagnosis};
pub use history::{HistoryPage, HistoryParams, HistoryService, MessageView};
pub use push::{LogPushNotifier, PushNotification, PushNotifier, WebhookPushNotifier};
pub use reconciliation::{ReconcileReport, ReconciliationJob};
pub use unread::UnreadAggregator;
