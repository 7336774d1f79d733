//! Socket pump: multiplexes queued outbound frames, inbound client frames and
//! the heartbeat tick for one connection.

use actix_ws::{CloseCode, CloseReason, Message, MessageStream, Session};
use futures_util::StreamExt;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use super::session::SessionHooks;
use crate::config::WsConfig;
use crate::error::AppError;

/// Run a session until either side closes. Always ends with `on_disconnect`.
pub async fn drive<S: SessionHooks>(
    mut hooks: S,
    mut session: Session,
    mut stream: MessageStream,
    mut outbound: UnboundedReceiver<String>,
    config: WsConfig,
) {
    if let Err(e) = hooks.on_connect().await {
        debug!(channel = hooks.channel(), error = %e, "refusing socket");
        refuse(session, &e).await;
        return;
    }

    let mut last_seen = Instant::now();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    let mut reason = None;

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(frame) = queued else { break };
                if session.text(frame).await.is_err() {
                    break;
                }
            }

            incoming = stream.next() => {
                let Some(incoming) = incoming else { break };
                last_seen = Instant::now();
                match incoming {
                    Ok(Message::Text(text)) => hooks.on_frame(&text).await,
                    Ok(Message::Ping(bytes)) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(close)) => {
                        reason = close;
                        break;
                    }
                    Ok(Message::Pong(_)) | Ok(Message::Binary(_)) | Ok(Message::Nop) => {}
                    Ok(Message::Continuation(_)) => {
                        debug!(channel = hooks.channel(), "ignoring fragmented frame");
                    }
                    Err(e) => {
                        warn!(channel = hooks.channel(), error = %e, "websocket protocol error");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > config.client_timeout {
                    debug!(channel = hooks.channel(), "client heartbeat timed out");
                    break;
                }
                if session.ping(b"").await.is_err() {
                    break;
                }
                hooks.on_heartbeat().await;
            }
        }
    }

    hooks.on_disconnect().await;
    let _ = session.close(reason).await;
}

/// Close a socket that failed authorization before any frame was exchanged.
pub async fn refuse(session: Session, err: &AppError) {
    let description = match err {
        AppError::Forbidden | AppError::NotFound | AppError::Unauthorized => err.code(),
        _ => "unavailable",
    };
    let _ = session
        .close(Some(CloseReason {
            code: CloseCode::Policy,
            description: Some(description.to_string()),
        }))
        .await;
}
