use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, TextEncoder};

static WS_CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("delivery_ws_connections", "Open sockets by channel"),
        &["channel"],
    )
    .expect("failed to create delivery_ws_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register delivery_ws_connections");
    gauge
});

static STATUS_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "delivery_status_transitions_total",
            "Persisted delivery status transitions",
        ),
        &["to", "trigger"],
    )
    .expect("failed to create delivery_status_transitions_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register delivery_status_transitions_total");
    counter
});

static BROADCAST_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("delivery_broadcast_events_total", "Dispatched events by type"),
        &["event"],
    )
    .expect("failed to create delivery_broadcast_events_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register delivery_broadcast_events_total");
    counter
});

static BROADCAST_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "delivery_broadcast_failures_total",
            "Best-effort fan-out failures",
        ),
        &["reason"],
    )
    .expect("failed to create delivery_broadcast_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register delivery_broadcast_failures_total");
    counter
});

static RECONCILE_HEALED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "delivery_reconcile_healed_total",
        "Messages promoted to read by reconciliation",
    )
    .expect("failed to create delivery_reconcile_healed_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register delivery_reconcile_healed_total");
    counter
});

pub fn ws_connected(channel: &str) {
    WS_CONNECTIONS.with_label_values(&[channel]).inc();
}

pub fn ws_disconnected(channel: &str) {
    WS_CONNECTIONS.with_label_values(&[channel]).dec();
}

pub fn record_transitions(to: &str, trigger: &str, count: usize) {
    if count > 0 {
        STATUS_TRANSITIONS
            .with_label_values(&[to, trigger])
            .inc_by(count as u64);
    }
}

pub fn record_broadcast(event: &str) {
    BROADCAST_EVENTS.with_label_values(&[event]).inc();
}

pub fn record_broadcast_failure(reason: &str) {
    BROADCAST_FAILURES.with_label_values(&[reason]).inc();
}

pub fn record_healed(count: u64) {
    RECONCILE_HEALED.inc_by(count);
}

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
