use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field carrying the vendor identifier when a connector does not say otherwise.
pub const DEFAULT_ID_FIELD: &str = "id";

/// A single event as received from a vendor API: an opaque JSON object.
///
/// Events are never mutated after being produced; stages hand ownership
/// along the pipeline instead of sharing them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Map<String, Value>);

impl Event {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Parse a JSON document into an Event. Anything other than a JSON object is rejected.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Returns the vendor identifier stored under `field`, if any.
    /// Numeric identifiers are rendered to their decimal form.
    pub fn id(&self, field: &str) -> Option<String> {
        match self.0.get(field)? {
            Value::String(id) if !id.is_empty() => Some(id.to_owned()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Serialize to the single-line JSON record expected by the intake.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }
}

impl From<Map<String, Value>> for Event {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

impl TryFrom<Value> for Event {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_id() {
        let event = Event::try_from(json!({"Id": "80c76bd2", "id": 42})).unwrap();

        assert_eq!(event.id("Id"), Some("80c76bd2".to_owned()));
        assert_eq!(event.id(DEFAULT_ID_FIELD), Some("42".to_owned()));
        assert_eq!(event.id("missing"), None);

        let empty = Event::try_from(json!({"id": ""})).unwrap();
        assert_eq!(empty.id(DEFAULT_ID_FIELD), None);
    }

    #[test]
    fn test_from_json_rejects_non_objects() {
        assert!(Event::from_json(r#"{"id": "1", "ts": "2024-01-01T00:00:00Z"}"#).is_ok());
        assert!(Event::from_json("[1, 2]").is_err());
        assert!(Event::from_json("not json").is_err());
    }

    #[test]
    fn test_to_line_is_single_line() {
        let event = Event::try_from(json!({"id": "1", "nested": {"a": [1, 2]}})).unwrap();
        let line = event.to_line().unwrap();

        assert!(!line.contains('\n'));
        assert_eq!(Event::from_json(&line).unwrap(), event);
    }

    #[test]
    fn test_to_line_keeps_field_order() {
        let raw = r#"{"Operation":"UserLoggedIn","Id":"80c76bd2","CreationTime":"2024-01-01T00:00:00"}"#;

        assert_eq!(Event::from_json(raw).unwrap().to_line().unwrap(), raw);
    }
}
