use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Client → server frames on a conversation socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationFrame {
    #[serde(alias = "text")]
    Send {
        #[serde(default)]
        body: String,
        #[serde(default)]
        client_id: Option<String>,
    },
    Typing {
        #[serde(default)]
        state: Option<String>,
    },
    Read {
        #[serde(default, deserialize_with = "lenient_id")]
        last_read_id: Option<i64>,
    },
    Ping,
}

impl ConversationFrame {
    /// Parse a text frame. Text that is not a JSON object is a plain message
    /// body. `None` means a well-formed frame of a type we do not handle.
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str::<Value>(text) {
            Ok(value @ Value::Object(_)) => serde_json::from_value(value).ok(),
            _ => Some(ConversationFrame::Send {
                body: text.to_string(),
                client_id: None,
            }),
        }
    }
}

/// Client → server frames on an inbox socket. Only heartbeats are meaningful.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboxFrame {
    Ping,
}

impl InboxFrame {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Accepts `102`, `"102"` or null.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
