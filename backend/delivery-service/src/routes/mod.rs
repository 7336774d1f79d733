use actix_web::{web, HttpResponse};

pub mod messages;
pub mod unread;
pub mod ws;

/// Mount every endpoint. Shared by the server binary and the HTTP tests.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(ws::conversation_socket)
        .service(ws::inbox_socket)
        .service(messages::get_messages)
        .service(messages::send_message)
        .service(messages::mark_read)
        .service(messages::mute_conversation)
        .service(messages::unmute_conversation)
        .service(unread::get_unread)
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(crate::metrics::metrics_handler));
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}
