use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::net::GatewayRequest;

/// A submission waiting to be delivered upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedSubmission {
  /// Stable across retries; the upstream deduplicates on it
  pub id: String,
  /// Original destination, `path?query` relative to the upstream
  pub target_url: String,
  /// JSON body to replay, always carrying `id`
  #[serde(skip)]
  pub payload: Vec<u8>,
  pub created_at: DateTime<Utc>,
}

impl QueuedSubmission {
  /// Turn a failed submission into a queue record.
  ///
  /// Only JSON object bodies are accepted. The body is kept byte-for-byte
  /// when it already carries an `id`; otherwise a fresh UUID is written into
  /// it so every replay presents the same identity.
  pub fn from_request(request: &GatewayRequest) -> Result<Self, GatewayError> {
    let content_type = request.content_type().unwrap_or_default();
    if !content_type.to_ascii_lowercase().contains("application/json") {
      return Err(GatewayError::MalformedPayload(format!(
        "unsupported content type '{}'",
        content_type
      )));
    }

    let mut value: Value = serde_json::from_slice(&request.body)
      .map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
    let object = value
      .as_object_mut()
      .ok_or_else(|| GatewayError::MalformedPayload("body is not a JSON object".to_string()))?;

    let (id, payload) = match object.get("id").map(id_from_value).transpose()?.flatten() {
      Some(id) => (id, request.body.clone()),
      None => {
        let id = Uuid::new_v4().to_string();
        object.insert("id".to_string(), Value::String(id.clone()));
        let payload = serde_json::to_vec(&value)
          .map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
        (id, payload)
      }
    };

    Ok(Self {
      id,
      target_url: request.path_and_query(),
      payload,
      created_at: Utc::now(),
    })
  }

  /// Best-effort read of a submission's `id` without validating the request.
  pub fn peek_id(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    id_from_value(value.get("id")?).ok().flatten()
  }
}

/// Strings and numbers are usable ids; null and "" mean "assign one".
fn id_from_value(value: &Value) -> Result<Option<String>, GatewayError> {
  match value {
    Value::Null => Ok(None),
    Value::String(s) if s.is_empty() => Ok(None),
    Value::String(s) => Ok(Some(s.clone())),
    Value::Number(n) => Ok(Some(n.to_string())),
    other => Err(GatewayError::MalformedPayload(format!(
      "id must be a string, got {}",
      other
    ))),
  }
}
