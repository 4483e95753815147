use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};

use crate::error::SyncError;

/// An inbound push notification.
///
/// Wire shape: `{"type": "applicant.updated", "entityId": "42", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEvent {
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default, deserialize_with = "entity_id")]
  pub entity_id: Option<String>,
  #[serde(default)]
  pub payload: Option<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
  Text(String),
  Number(Number),
}

/// Some producers send numeric ids; keys always use the string form.
fn entity_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
  Ok(Option::<WireId>::deserialize(deserializer)?.map(|id| match id {
    WireId::Text(text) => text,
    WireId::Number(number) => number.to_string(),
  }))
}

impl ChannelEvent {
  pub fn parse(text: &str) -> Result<Self, SyncError> {
    Ok(serde_json::from_str(text)?)
  }

  /// Split `applicant.updated` into `("applicant", "updated")`.
  pub fn topic(&self) -> Option<(&str, &str)> {
    self.kind.split_once('.')
  }

  /// The payload, when it is a full object that can replace a cached entry.
  pub fn object_payload(&self) -> Option<&Value> {
    self.payload.as_ref().filter(|p| p.is_object())
  }
}
