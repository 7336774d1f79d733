use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceBackend {
    Memory,
    Redis,
}

/// Knobs for the delivery paths. Every cap here bounds a fan-out or a scan.
#[derive(Debug, Clone)]
pub struct DeliveryTuning {
    /// Max individual `message.status` frames emitted by one trigger.
    pub status_broadcast_cap: usize,
    /// Max inbound messages stamped delivered per conversation per catch-up.
    pub catch_up_batch: i64,
    pub max_body_chars: usize,
    pub inbox_preview_chars: usize,
    pub push_preview_chars: usize,
    pub stored_preview_chars: usize,
    pub history_default_limit: i64,
    pub history_max_limit: i64,
    pub push_title: String,
}

impl Default for DeliveryTuning {
    fn default() -> Self {
        Self {
            status_broadcast_cap: 300,
            catch_up_batch: 300,
            max_body_chars: 1000,
            inbox_preview_chars: 80,
            push_preview_chars: 60,
            stored_preview_chars: 120,
            history_default_limit: 200,
            history_max_limit: 500,
            push_title: "New message".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval: Duration,
    pub batch: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            client_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub store: StoreBackend,
    pub database_url: Option<String>,
    pub presence: PresenceBackend,
    pub redis_url: Option<String>,
    pub presence_ttl_secs: u64,
    pub jwt_secret: String,
    pub push_webhook_url: Option<String>,
    pub tuning: DeliveryTuning,
    pub reconcile: ReconcileConfig,
    pub ws: WsConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let store = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "postgres".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "postgres" | "pg" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => {
                return Err(AppError::Config(format!("unknown STORE_BACKEND '{other}'")));
            }
        };
        let database_url = non_empty("DATABASE_URL");
        if store == StoreBackend::Postgres && database_url.is_none() {
            return Err(AppError::Config("DATABASE_URL missing".into()));
        }

        let presence = match env::var("PRESENCE_BACKEND")
            .unwrap_or_else(|_| "memory".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => PresenceBackend::Memory,
            "redis" => PresenceBackend::Redis,
            other => {
                return Err(AppError::Config(format!(
                    "unknown PRESENCE_BACKEND '{other}'"
                )));
            }
        };
        let redis_url = non_empty("REDIS_URL");
        if presence == PresenceBackend::Redis && redis_url.is_none() {
            return Err(AppError::Config(
                "REDIS_URL missing (required by PRESENCE_BACKEND=redis)".into(),
            ));
        }

        let jwt_secret =
            non_empty("JWT_SECRET").ok_or_else(|| AppError::Config("JWT_SECRET missing".into()))?;

        let defaults = DeliveryTuning::default();
        let tuning = DeliveryTuning {
            status_broadcast_cap: env_or("STATUS_BROADCAST_CAP", defaults.status_broadcast_cap),
            catch_up_batch: env_or("CATCH_UP_BATCH", defaults.catch_up_batch),
            max_body_chars: env_or("MAX_BODY_CHARS", defaults.max_body_chars),
            inbox_preview_chars: env_or("INBOX_PREVIEW_CHARS", defaults.inbox_preview_chars),
            push_preview_chars: env_or("PUSH_PREVIEW_CHARS", defaults.push_preview_chars),
            stored_preview_chars: defaults.stored_preview_chars,
            history_default_limit: env_or("HISTORY_DEFAULT_LIMIT", defaults.history_default_limit),
            history_max_limit: env_or("HISTORY_MAX_LIMIT", defaults.history_max_limit),
            push_title: non_empty("PUSH_TITLE").unwrap_or(defaults.push_title),
        };
        if tuning.status_broadcast_cap == 0 || tuning.catch_up_batch <= 0 {
            return Err(AppError::Config(
                "STATUS_BROADCAST_CAP and CATCH_UP_BATCH must be positive".into(),
            ));
        }

        let reconcile = ReconcileConfig {
            interval: Duration::from_secs(env_or("RECONCILE_INTERVAL_SECS", 60)),
            batch: env_or("RECONCILE_BATCH", 10_000),
        };

        let ws = WsConfig {
            heartbeat_interval: Duration::from_secs(env_or("WS_HEARTBEAT_INTERVAL_SECS", 5)),
            client_timeout: Duration::from_secs(env_or("WS_CLIENT_TIMEOUT_SECS", 30)),
        };

        Ok(Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("PORT", 8085),
            store,
            database_url,
            presence,
            redis_url,
            presence_ttl_secs: env_or("PRESENCE_TTL_SECS", 90),
            jwt_secret,
            push_webhook_url: non_empty("PUSH_WEBHOOK_URL"),
            tuning,
            reconcile,
            ws,
        })
    }

    /// In-memory configuration for tests and local runs.
    pub fn in_memory(jwt_secret: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8085,
            store: StoreBackend::Memory,
            database_url: None,
            presence: PresenceBackend::Memory,
            redis_url: None,
            presence_ttl_secs: 90,
            jwt_secret: jwt_secret.into(),
            push_webhook_url: None,
            tuning: DeliveryTuning::default(),
            reconcile: ReconcileConfig::default(),
            ws: WsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_defaults_match_documented_caps() {
        let t = DeliveryTuning::default();
        assert_eq!(t.status_broadcast_cap, 300);
        assert_eq!(t.max_body_chars, 1000);
        assert_eq!(t.inbox_preview_chars, 80);
        assert_eq!(t.history_default_limit, 200);
    }

    #[test]
    fn in_memory_config_needs_no_external_services() {
        let cfg = Config::in_memory("secret");
        assert_eq!(cfg.store, StoreBackend::Memory);
        assert_eq!(cfg.presence, PresenceBackend::Memory);
        assert!(cfg.database_url.is_none());
        assert!(cfg.redis_url.is_none());
    }
}
