//! Signed relay events.

use crate::TypeError;
use serde::{Deserialize, Serialize};

/// An immutable, signed message record submitted by a client.
///
/// Produced by the protocol layer and handed to the policy engine
/// read-only. The engine never mutates an event; scripts only ever see a
/// translated copy.
///
/// # Example
///
/// ```
/// use vigil_types::Event;
///
/// let event = Event::from_json(r#"{
///     "id": "aa", "pubkey": "bb", "sig": "cc",
///     "kind": 1, "created_at": 1700000000,
///     "tags": [["t", "rust"]], "content": "hello"
/// }"#).unwrap();
///
/// assert_eq!(event.kind, 1);
/// assert_eq!(event.first_tag_value("t"), Some("rust"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Hex-encoded event id.
    pub id: String,
    /// Hex-encoded author public key.
    pub pubkey: String,
    /// Unix timestamp (seconds).
    pub created_at: i64,
    /// Event kind.
    pub kind: i64,
    /// Ordered tag list; each tag is an ordered list of strings.
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Free-form content.
    #[serde(default)]
    pub content: String,
    /// Hex-encoded signature.
    pub sig: String,
}

impl Event {
    /// Parses an event from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::Json`] if the input is not a valid event object.
    pub fn from_json(json: &str) -> Result<Self, TypeError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the event to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String, TypeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Iterates over the values (second element) of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().is_some_and(|n| n == name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Returns the value of the first tag named `name`, if any.
    #[must_use]
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .filter(|tag| tag.first().is_some_and(|n| n == name))
            .find_map(|tag| tag.get(1).map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        Event {
            id: "e1".into(),
            pubkey: "p1".into(),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![
                vec!["e".into(), "ref1".into()],
                vec!["p".into(), "someone".into(), "wss://relay".into()],
                vec!["e".into(), "ref2".into()],
                vec!["single".into()],
            ],
            content: "hello".into(),
            sig: "s1".into(),
        }
    }

    #[test]
    fn json_roundtrip_preserves_fields() {
        let event = sample();
        let json = event.to_json().unwrap();
        let parsed = Event::from_json(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn missing_tags_and_content_default_to_empty() {
        let event = Event::from_json(
            r#"{"id":"a","pubkey":"b","created_at":1,"kind":7,"sig":"c"}"#,
        )
        .unwrap();
        assert!(event.tags.is_empty());
        assert!(event.content.is_empty());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let err = Event::from_json(r#"{"id":"a","kind":1}"#).unwrap_err();
        assert!(matches!(err, TypeError::Json(_)));
    }

    #[test]
    fn tag_values_in_order() {
        let event = sample();
        let refs: Vec<&str> = event.tag_values("e").collect();
        assert_eq!(refs, vec!["ref1", "ref2"]);
        assert_eq!(event.first_tag_value("p"), Some("someone"));
        assert_eq!(event.first_tag_value("single"), None);
        assert_eq!(event.first_tag_value("missing"), None);
    }

    #[test]
    fn first_tag_value_outlives_the_name() {
        let mut event = sample();
        event.tags.insert(0, vec!["e".into()]);
        let value = {
            let name = String::from("e");
            event.first_tag_value(&name)
        };
        assert_eq!(value, Some("ref1"));
    }
}
