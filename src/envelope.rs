use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;

/// Message unit exchanged across the bridge in either direction.
///
/// The `type` tag and field names are the wire contract shared with the
/// injected page runtime; the Rust names describe what each field means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "request")]
    Request(RequestEnvelope),
    #[serde(rename = "response")]
    Response(ResponseEnvelope),
    #[serde(rename = "addListener")]
    Subscribe(SubscribeEnvelope),
    #[serde(rename = "removeListener")]
    Unsubscribe(UnsubscribeEnvelope),
    #[serde(rename = "event")]
    Event(EventEnvelope),
    #[serde(rename = "log")]
    Log(LogEnvelope),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "plugin")]
    pub capability: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubscribeEnvelope {
    #[serde(default, rename = "plugin")]
    pub capability: String,
    #[serde(default)]
    pub event: String,
    #[serde(default, rename = "listenerId")]
    pub subscription_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnsubscribeEnvelope {
    #[serde(default, rename = "listenerId")]
    pub subscription_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "plugin")]
    pub capability: String,
    pub event: String,
    #[serde(default)]
    pub data: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogEnvelope {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("empty message")]
    Empty,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("unknown message type {0}")]
    UnknownKind(String),
}

const KNOWN_KINDS: &[&str] = &[
    "request",
    "response",
    "addListener",
    "removeListener",
    "event",
    "log",
];

impl Envelope {
    /// Parse a raw string posted by the page.
    ///
    /// A message without a `type` is treated as a request, matching what
    /// older page runtimes send.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        if raw.trim().is_empty() {
            return Err(EnvelopeError::Empty);
        }
        let value: JsonValue = serde_json::from_str(raw)?;
        let JsonValue::Object(mut object) = value else {
            return Err(EnvelopeError::NotAnObject);
        };

        let kind = match object.get("type") {
            None | Some(JsonValue::Null) => "request".to_string(),
            Some(JsonValue::String(kind)) => kind.clone(),
            Some(other) => other.to_string(),
        };
        if !KNOWN_KINDS.contains(&kind.as_str()) {
            return Err(EnvelopeError::UnknownKind(kind));
        }
        object.insert("type".into(), JsonValue::String(kind));

        Ok(serde_json::from_value(JsonValue::Object(object))?)
    }

    pub fn to_json(&self) -> String {
        // Every variant is a plain struct of strings and JSON values.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Request(_) => "request",
            Envelope::Response(_) => "response",
            Envelope::Subscribe(_) => "addListener",
            Envelope::Unsubscribe(_) => "removeListener",
            Envelope::Event(_) => "event",
            Envelope::Log(_) => "log",
        }
    }
}

impl RequestEnvelope {
    /// Request parameters as an object; anything else is treated as empty.
    pub fn params_object(&self) -> JsonValue {
        match &self.params {
            JsonValue::Object(_) => self.params.clone(),
            _ => JsonValue::Object(JsonMap::new()),
        }
    }
}

impl ResponseEnvelope {
    pub fn success(id: impl Into<String>, result: JsonValue) -> Self {
        let result = if result.is_null() { json!({}) } else { result };
        Self {
            id: Some(id.into()),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.filter(|id| !id.is_empty()),
            result: None,
            error: Some(ErrorBody {
                message: message.into(),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl EventEnvelope {
    pub fn new(capability: impl Into<String>, event: impl Into<String>, data: JsonValue) -> Self {
        let data = if data.is_null() { json!({}) } else { data };
        Self {
            capability: capability.into(),
            event: event.into(),
            data,
        }
    }
}

/// Script that hands an envelope to the injected runtime of `generation`.
pub fn dispatch_script(runtime_global: &str, generation: u64, envelope: &Envelope) -> String {
    let payload = escape_line_terminators(&envelope.to_json());
    format!(
        "window.{runtime_global} && window.{runtime_global}.dispatch({generation}, {payload});"
    )
}

/// Script that tells the runtime of `generation` the surface is gone.
pub fn close_script(runtime_global: &str, generation: u64, reason: &str) -> String {
    let reason = escape_line_terminators(&JsonValue::String(reason.to_string()).to_string());
    format!("window.{runtime_global} && window.{runtime_global}.close({generation}, {reason});")
}

// JSON allows U+2028/U+2029 unescaped; older script engines do not.
fn escape_line_terminators(json: &str) -> String {
    json.replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}
