//! Heals drift between read markers and per-message status.
//!
//! A marker can advance while the bulk status update behind it loses a race.
//! A pass re-applies the same conditional promotion the read path uses, so
//! running it again over a healed store changes nothing.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::delivery::status_events;
use crate::config::ReconcileConfig;
use crate::error::AppResult;
use crate::store::{MessageRepository, ReadMarkerRepository};
use crate::websocket::BroadcastDispatcher;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub markers_scanned: usize,
    /// Rows behind their marker before the pass.
    pub candidates: i64,
    /// Rows promoted by the pass (zero on dry runs).
    pub updated: i64,
    /// Markers skipped because of store errors.
    pub failed: usize,
}

#[derive(Clone)]
pub struct ReconciliationJob {
    messages: Arc<dyn MessageRepository>,
    markers: Arc<dyn ReadMarkerRepository>,
    dispatcher: Option<BroadcastDispatcher>,
    batch: i64,
    interval: Duration,
    status_cap: usize,
}

impl ReconciliationJob {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        markers: Arc<dyn ReadMarkerRepository>,
        config: &ReconcileConfig,
        status_cap: usize,
    ) -> Self {
        Self {
            messages,
            markers,
            dispatcher: None,
            batch: config.batch.max(1),
            interval: config.interval,
            status_cap,
        }
    }

    /// Healed rows are announced to anyone with the conversation open.
    pub fn with_dispatcher(mut self, dispatcher: BroadcastDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub async fn start(&self) {
        info!(
            batch = self.batch,
            interval_secs = self.interval.as_secs(),
            "Read-marker reconciliation starting"
        );

        loop {
            match self.run_once(None, false).await {
                Ok(report) if report.updated > 0 || report.failed > 0 => {
                    info!(
                        markers = report.markers_scanned,
                        updated = report.updated,
                        failed = report.failed,
                        "Reconciliation pass healed drift"
                    );
                }
                Ok(report) => debug!(markers = report.markers_scanned, "No drift found"),
                Err(e) => error!(error = %e, "Reconciliation pass failed"),
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// On-demand heal of one conversation.
    pub async fn heal_conversation(&self, conversation_id: Uuid) -> AppResult<ReconcileReport> {
        self.run_once(Some(conversation_id), false).await
    }

    /// Single pass over markers, optionally scoped to one conversation.
    pub async fn run_once(
        &self,
        conversation_id: Option<Uuid>,
        dry_run: bool,
    ) -> AppResult<ReconcileReport> {
        let markers = self.markers.list_markers(conversation_id).await?;
        let mut report = ReconcileReport {
            markers_scanned: markers.len(),
            ..ReconcileReport::default()
        };

        for marker in markers {
            let candidates = match self
                .messages
                .count_promotable(marker.conversation_id, marker.user_id, marker.last_read_message_id)
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    warn!(conversation_id = %marker.conversation_id, user_id = %marker.user_id, error = %e, "marker scan failed");
                    report.failed += 1;
                    continue;
                }
            };
            report.candidates += candidates;
            if dry_run || candidates == 0 {
                continue;
            }

            let changes = match self
                .messages
                .promote_read(
                    marker.conversation_id,
                    marker.user_id,
                    marker.last_read_message_id,
                    Some(self.batch),
                    Utc::now(),
                )
                .await
            {
                Ok(changes) => changes,
                Err(e) => {
                    warn!(conversation_id = %marker.conversation_id, user_id = %marker.user_id, error = %e, "marker heal failed");
                    report.failed += 1;
                    continue;
                }
            };

            report.updated += changes.len() as i64;
            crate::metrics::record_transitions("read", "reconcile", changes.len());
            crate::metrics::record_healed(changes.len() as u64);
            info!(
                conversation_id = %marker.conversation_id,
                user_id = %marker.user_id,
                last_read_id = marker.last_read_message_id,
                healed = changes.len(),
                "healed messages behind read marker"
            );

            if let Some(dispatcher) = &self.dispatcher {
                dispatcher
                    .dispatch(status_events(marker.conversation_id, &changes, self.status_cap))
                    .await;
            }
        }

        Ok(report)
    }
}
