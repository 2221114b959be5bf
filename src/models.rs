use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// Verification request as supplied by the caller
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct VerificationData {
    #[serde(rename = "discordUserId")]
    pub discord_user_id: String,
    // everything else the caller sends is passed through untouched
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

// Whatever the endpoint answers with on success
pub type VerificationResult = Value;

// Error payload on non-2xx responses
#[derive(Deserialize, Debug, Default)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<Value>,
}

impl VerificationData {
    pub fn new(discord_user_id: impl Into<String>) -> Self {
        Self {
            discord_user_id: discord_user_id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Builds the outbound JSON object: caller fields first, then `ipAddress`
    /// and `timestamp`, which win over any caller field of the same name.
    pub fn to_payload(&self, ip_address: &str, timestamp: DateTime<Utc>) -> Map<String, Value> {
        let mut payload = self.fields.clone();
        payload.insert("discordUserId".to_string(), Value::String(self.discord_user_id.clone()));
        payload.insert("ipAddress".to_string(), Value::String(ip_address.to_string()));
        payload.insert(
            "timestamp".to_string(),
            Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        payload
    }
}

impl ErrorBody {
    // Unparseable or empty bodies read as "no message"
    pub fn parse(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or_default()
    }

    /// The server's message, if it sent a usable one. Empty strings, `false`,
    /// `0` and `null` count as absent; other scalars are stringified.
    pub fn message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null | Value::Bool(false) => None,
            Value::String(message) if message.is_empty() => None,
            Value::String(message) => Some(message.clone()),
            Value::Number(n) if n.as_f64() == Some(0.0) => None,
            other => Some(other.to_string()),
        }
    }
}
