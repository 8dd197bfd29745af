use serde_json::Value;

/// A single event received from the upstream queue.
///
/// Immutable once decoded. The payload is carried as an opaque JSON value and
/// never introspected below the envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Globally unique id within the upstream's retention window; also the
    /// downstream partition key. Empty when the envelope carried none.
    pub id: String,
    /// Propagated to downstream headers and logs only. May be empty.
    pub correlation_id: String,
    /// Opaque structured payload.
    pub payload: Value,
}

impl Event {
    /// Decode an upstream delivery body.
    ///
    /// A body that is not valid JSON is a poison message and fails the decode.
    /// Missing or non-string `event_id` / `correlation_id` fields degrade to
    /// empty strings (the consumer drops events without an id); unknown
    /// fields are ignored; a missing payload becomes JSON null.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        let envelope: Value = serde_json::from_slice(body)?;

        let id = envelope
            .get("event_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let correlation_id = envelope
            .get("correlation_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let payload = envelope.get("payload").cloned().unwrap_or(Value::Null);

        Ok(Self {
            id,
            correlation_id,
            payload,
        })
    }
}
