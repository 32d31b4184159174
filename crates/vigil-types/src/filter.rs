//! Event query filters.

use crate::{Event, TypeError};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A query description selecting a subset of events.
///
/// Every field is optional; an unset field means "unconstrained".
///
/// # Limit semantics
///
/// `limit` holds a positive limit. A limit explicitly set to `0` is
/// represented by `limit = None, limit_zero = true`, so "no limit field"
/// and "limit: 0" stay distinguishable.
///
/// # Wire form
///
/// Tag constraints serialize as `"#<name>"` keys:
///
/// ```
/// use vigil_types::Filter;
///
/// let filter = Filter::from_json(r##"{"kinds":[1],"#t":["rust"],"limit":0}"##).unwrap();
/// assert_eq!(filter.kinds, Some(vec![1]));
/// assert_eq!(filter.tags["t"], vec!["rust".to_string()]);
/// assert!(filter.limit_zero);
/// assert_eq!(filter.limit, None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<i64>>,
    /// Tag name (without `#`) to accepted values.
    pub tags: BTreeMap<String, Vec<String>>,
    pub limit: Option<u64>,
    pub limit_zero: bool,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub search: Option<String>,
}

impl Filter {
    /// Parses a filter from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError`] if the input is not a JSON object or a
    /// recognized key holds a value of the wrong shape.
    pub fn from_json(json: &str) -> Result<Self, TypeError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_json_value(&value)
    }

    /// Builds a filter from a JSON value.
    ///
    /// Recognized keys are `ids`, `authors`, `kinds`, `limit`, `since`,
    /// `until`, `search` and every key starting with `#`. Unknown keys are
    /// ignored. An empty object is accepted where an array is expected,
    /// because script runtimes cannot always tell the two apart.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidFilterField`] on a shape mismatch.
    pub fn from_json_value(value: &Value) -> Result<Self, TypeError> {
        let Value::Object(map) = value else {
            return Err(TypeError::invalid_field("<filter>", "object"));
        };

        let mut filter = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "ids" => filter.ids = Some(string_list(key, value)?),
                "authors" => filter.authors = Some(string_list(key, value)?),
                "kinds" => filter.kinds = Some(integer_list(key, value)?),
                "limit" => {
                    let limit = integer(key, value)?;
                    let limit = u64::try_from(limit)
                        .map_err(|_| TypeError::invalid_field(key, "non-negative integer"))?;
                    if limit == 0 {
                        filter.limit = None;
                        filter.limit_zero = true;
                    } else {
                        filter.limit = Some(limit);
                        filter.limit_zero = false;
                    }
                }
                "since" => filter.since = Some(integer(key, value)?),
                "until" => filter.until = Some(integer(key, value)?),
                "search" => match value {
                    Value::String(s) => filter.search = Some(s.clone()),
                    _ => return Err(TypeError::invalid_field(key, "string")),
                },
                _ => {
                    if let Some(tag) = key.strip_prefix('#') {
                        filter.tags.insert(tag.to_string(), string_list(key, value)?);
                    }
                }
            }
        }
        Ok(filter)
    }

    /// Converts the filter to a JSON object, omitting every unset field.
    #[must_use]
    pub fn to_json_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(ids) = self.ids.as_ref().filter(|v| !v.is_empty()) {
            map.insert("ids".into(), Value::from(ids.clone()));
        }
        if let Some(authors) = self.authors.as_ref().filter(|v| !v.is_empty()) {
            map.insert("authors".into(), Value::from(authors.clone()));
        }
        if let Some(kinds) = self.kinds.as_ref().filter(|v| !v.is_empty()) {
            map.insert("kinds".into(), Value::from(kinds.clone()));
        }
        for (name, values) in &self.tags {
            if !values.is_empty() {
                map.insert(format!("#{name}"), Value::from(values.clone()));
            }
        }
        if let Some(limit) = self.effective_limit() {
            map.insert("limit".into(), Value::from(limit));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::from(since));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::from(until));
        }
        if let Some(search) = self.search.as_ref().filter(|s| !s.is_empty()) {
            map.insert("search".into(), Value::from(search.clone()));
        }
        Value::Object(map)
    }

    /// Returns the limit as it should appear on the wire.
    ///
    /// `Some(0)` when the limit was explicitly zero, `Some(n)` for a
    /// positive limit, `None` when no limit was given.
    #[must_use]
    pub fn effective_limit(&self) -> Option<u64> {
        if self.limit_zero {
            Some(0)
        } else {
            self.limit.filter(|l| *l > 0)
        }
    }

    /// Returns true if `event` satisfies every constraint of this filter.
    ///
    /// `search` and `limit` are not per-event constraints and are ignored.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.is_empty() && !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.is_empty() && !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.is_empty() && !kinds.contains(&event.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        self.tags.iter().all(|(name, values)| {
            values.is_empty()
                || event
                    .tag_values(name)
                    .any(|v| values.iter().any(|accepted| accepted == v))
        })
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Value::Object(map) = self.to_json_value() else {
            return serializer.serialize_map(Some(0))?.end();
        };
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in &map {
            out.serialize_entry(key, value)?;
        }
        out.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json_value(&value).map_err(D::Error::custom)
    }
}

fn is_empty_object(value: &Value) -> bool {
    matches!(value, Value::Object(m) if m.is_empty())
}

fn string_list(key: &str, value: &Value) -> Result<Vec<String>, TypeError> {
    if is_empty_object(value) {
        return Ok(Vec::new());
    }
    let Value::Array(items) = value else {
        return Err(TypeError::invalid_field(key, "array of strings"));
    };
    items
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.clone()),
            _ => Err(TypeError::invalid_field(key, "array of strings")),
        })
        .collect()
}

fn integer_list(key: &str, value: &Value) -> Result<Vec<i64>, TypeError> {
    if is_empty_object(value) {
        return Ok(Vec::new());
    }
    let Value::Array(items) = value else {
        return Err(TypeError::invalid_field(key, "array of integers"));
    };
    items
        .iter()
        .map(|item| as_integer(item).ok_or_else(|| TypeError::invalid_field(key, "array of integers")))
        .collect()
}

fn integer(key: &str, value: &Value) -> Result<i64, TypeError> {
    as_integer(value).ok_or_else(|| TypeError::invalid_field(key, "integer"))
}

/// Accepts JSON integers and floats with no fractional part.
fn as_integer(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}
