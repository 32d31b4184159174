//! Value bridge between host types and Lua values.
//!
//! # Mapping
//!
//! | Host | Lua |
//! |------|-----|
//! | `null` | `nil` (top level / object field), `json.null` (array slot) |
//! | bool | boolean |
//! | integer | integer |
//! | float | number |
//! | string | string |
//! | array | sequence table `{1, 2, 3}` |
//! | object | table with string keys |
//!
//! An empty Lua table reads back as an empty object. Functions, threads,
//! userdata and tables mixing integer and string keys are rejected with
//! [`PolicyError::UnsupportedType`].
//!
//! [`Event`] and [`Filter`] go through the same mapping using their wire
//! field names, so a filter table carries `"#t"` style tag keys and omits
//! every unset field.

use crate::PolicyError;
use mlua::{Lua, Table, Value};
use serde_json::{Map, Number, Value as Json};
use vigil_types::{Event, Filter};

/// Nesting depth past which a value is rejected (guards against cycles).
const MAX_DEPTH: usize = 64;

/// Converts a JSON value into a Lua value.
///
/// # Errors
///
/// Returns [`PolicyError::Lua`] if the VM cannot allocate.
pub fn json_to_lua(lua: &Lua, value: &Json) -> Result<Value, PolicyError> {
    Ok(match value {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => number_to_lua(n),
        Json::String(s) => Value::String(lua.create_string(s)?),
        Json::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                let v = match item {
                    Json::Null => Value::NULL,
                    other => json_to_lua(lua, other)?,
                };
                table.raw_set(i + 1, v)?;
            }
            Value::Table(table)
        }
        Json::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (k, v) in map {
                if !v.is_null() {
                    table.raw_set(k.as_str(), json_to_lua(lua, v)?)?;
                }
            }
            Value::Table(table)
        }
    })
}

fn number_to_lua(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Integer(i)
    } else {
        Value::Number(n.as_f64().unwrap_or(f64::NAN))
    }
}

/// Converts a Lua value into JSON.
///
/// # Errors
///
/// Returns [`PolicyError::UnsupportedType`] for values with no JSON form.
pub fn lua_to_json(value: &Value) -> Result<Json, PolicyError> {
    to_json_at(value, 0)
}

fn to_json_at(value: &Value, depth: usize) -> Result<Json, PolicyError> {
    if depth > MAX_DEPTH {
        return Err(PolicyError::unsupported("table nesting too deep"));
    }
    match value {
        Value::Nil => Ok(Json::Null),
        Value::LightUserData(ud) if ud.0.is_null() => Ok(Json::Null),
        Value::Boolean(b) => Ok(Json::Bool(*b)),
        Value::Integer(i) => Ok(Json::from(*i)),
        Value::Number(f) => Number::from_f64(*f)
            .map(Json::Number)
            .ok_or_else(|| PolicyError::unsupported(format!("non-finite number {f}"))),
        Value::String(s) => Ok(Json::String(s.to_str()?.to_string())),
        Value::Table(t) => table_to_json(t, depth),
        other => Err(PolicyError::unsupported(other.type_name())),
    }
}

fn table_to_json(table: &Table, depth: usize) -> Result<Json, PolicyError> {
    let len = table.raw_len();
    let mut int_keys = 0usize;
    let mut str_keys = 0usize;
    for pair in table.clone().pairs::<Value, Value>() {
        let (k, _) = pair?;
        match k {
            Value::Integer(i) if i >= 1 && usize::try_from(i).is_ok_and(|i| i <= len) => {
                int_keys += 1;
            }
            Value::String(_) => str_keys += 1,
            other => {
                return Err(PolicyError::unsupported(format!(
                    "table key of type {}",
                    other.type_name()
                )))
            }
        }
    }

    match (int_keys, str_keys) {
        (0, _) => {
            let mut map = Map::new();
            for pair in table.clone().pairs::<mlua::String, Value>() {
                let (k, v) = pair?;
                map.insert(k.to_str()?.to_string(), to_json_at(&v, depth + 1)?);
            }
            Ok(Json::Object(map))
        }
        (n, 0) if n == len => {
            let mut items = Vec::with_capacity(len);
            for i in 1..=len {
                let v: Value = table.raw_get(i)?;
                items.push(to_json_at(&v, depth + 1)?);
            }
            Ok(Json::Array(items))
        }
        _ => Err(PolicyError::unsupported("table mixing array and object keys")),
    }
}

/// Builds the script view of an event.
///
/// # Errors
///
/// Returns [`PolicyError::Lua`] if the VM cannot allocate.
pub fn event_to_lua(lua: &Lua, event: &Event) -> Result<Table, PolicyError> {
    let table = lua.create_table_with_capacity(0, 7)?;
    table.set("id", event.id.as_str())?;
    table.set("pubkey", event.pubkey.as_str())?;
    table.set("sig", event.sig.as_str())?;
    table.set("content", event.content.as_str())?;
    table.set("kind", event.kind)?;
    table.set("created_at", event.created_at)?;

    let tags = lua.create_table_with_capacity(event.tags.len(), 0)?;
    for (i, tag) in event.tags.iter().enumerate() {
        let items = lua.create_table_with_capacity(tag.len(), 0)?;
        for (j, item) in tag.iter().enumerate() {
            items.raw_set(j + 1, item.as_str())?;
        }
        tags.raw_set(i + 1, items)?;
    }
    table.set("tags", tags)?;
    Ok(table)
}

/// Reads an event back from its script view.
///
/// # Errors
///
/// Returns [`PolicyError::UnsupportedType`] if a field is missing or has
/// the wrong type.
pub fn event_from_lua(table: &Table) -> Result<Event, PolicyError> {
    let field = |name: &str| -> Result<String, PolicyError> {
        table
            .get::<Option<String>>(name)?
            .ok_or_else(|| PolicyError::unsupported(format!("event field '{name}' missing")))
    };
    let int = |name: &str| -> Result<i64, PolicyError> {
        table
            .get::<Option<i64>>(name)?
            .ok_or_else(|| PolicyError::unsupported(format!("event field '{name}' missing")))
    };

    let mut tags = Vec::new();
    if let Some(list) = table.get::<Option<Table>>("tags")? {
        for tag in list.sequence_values::<Table>() {
            let tag = tag?;
            let items = tag
                .sequence_values::<String>()
                .collect::<mlua::Result<Vec<_>>>()?;
            tags.push(items);
        }
    }

    Ok(Event {
        id: field("id")?,
        pubkey: field("pubkey")?,
        created_at: int("created_at")?,
        kind: int("kind")?,
        tags,
        content: field("content")?,
        sig: field("sig")?,
    })
}

/// Builds the script view of a filter, omitting unset fields.
///
/// # Errors
///
/// Returns [`PolicyError::Lua`] if the VM cannot allocate.
pub fn filter_to_lua(lua: &Lua, filter: &Filter) -> Result<Value, PolicyError> {
    json_to_lua(lua, &filter.to_json_value())
}

/// Reads a filter from a script value.
///
/// # Errors
///
/// Returns [`PolicyError::MalformedFilter`] if a recognized key has the
/// wrong shape, or [`PolicyError::UnsupportedType`] if the value cannot be
/// read at all.
pub fn lua_to_filter(value: &Value) -> Result<Filter, PolicyError> {
    let json = lua_to_json(value)?;
    Ok(Filter::from_json_value(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sample_event() -> Event {
        Event {
            id: "id1".into(),
            pubkey: "pk1".into(),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![
                vec!["e".into(), "abc".into()],
                vec!["p".into(), "def".into(), "wss://r".into()],
            ],
            content: "hello ☕".into(),
            sig: "sig1".into(),
        }
    }

    #[test]
    fn event_fields_are_visible_to_scripts() {
        let lua = Lua::new();
        let t = event_to_lua(&lua, &sample_event()).unwrap();
        lua.globals().set("ev", t).unwrap();

        let (kind, tag, len): (i64, String, i64) = lua
            .load("return ev.kind, ev.tags[2][3], #ev.tags")
            .eval()
            .unwrap();
        assert_eq!(kind, 1);
        assert_eq!(tag, "wss://r");
        assert_eq!(len, 2);
    }

    #[test]
    fn event_roundtrip() {
        let lua = Lua::new();
        let event = sample_event();
        let t = event_to_lua(&lua, &event).unwrap();
        assert_eq!(event_from_lua(&t).unwrap(), event);

        let no_tags = Event {
            tags: vec![],
            ..event
        };
        let t = event_to_lua(&lua, &no_tags).unwrap();
        assert_eq!(event_from_lua(&t).unwrap(), no_tags);
    }

    #[test]
    fn filter_table_omits_unset_fields() {
        let lua = Lua::new();
        let filter = Filter {
            kinds: Some(vec![1]),
            ..Filter::default()
        };
        let v = filter_to_lua(&lua, &filter).unwrap();
        lua.globals().set("f", v).unwrap();

        let (ids_nil, limit_nil, kind): (bool, bool, i64) = lua
            .load("return f.ids == nil, f.limit == nil, f.kinds[1]")
            .eval()
            .unwrap();
        assert!(ids_nil);
        assert!(limit_nil);
        assert_eq!(kind, 1);
    }

    #[test]
    fn filter_roundtrip() {
        let lua = Lua::new();
        let filter = Filter {
            ids: Some(vec!["a".into()]),
            authors: Some(vec!["b".into(), "c".into()]),
            kinds: Some(vec![0, 3]),
            tags: BTreeMap::from([("t".to_string(), vec!["x".to_string()])]),
            limit: Some(20),
            limit_zero: false,
            since: Some(5),
            until: Some(9),
            search: Some("q".into()),
        };
        let v = filter_to_lua(&lua, &filter).unwrap();
        assert_eq!(lua_to_filter(&v).unwrap(), filter);
    }

    #[test]
    fn filter_roundtrip_keeps_explicit_zero_limit() {
        let lua = Lua::new();
        let filter = Filter {
            limit_zero: true,
            ..Filter::default()
        };
        let v = filter_to_lua(&lua, &filter).unwrap();
        assert_eq!(lua_to_filter(&v).unwrap(), filter);
    }

    #[test]
    fn script_built_filter() {
        let lua = Lua::new();
        let v: Value = lua
            .load(r##"return { kinds = {1, 7}, ["#e"] = {"abc"}, limit = 3 }"##)
            .eval()
            .unwrap();
        let f = lua_to_filter(&v).unwrap();
        assert_eq!(f.kinds, Some(vec![1, 7]));
        assert_eq!(f.tags["e"], vec!["abc".to_string()]);
        assert_eq!(f.limit, Some(3));
    }

    #[test]
    fn malformed_filter_is_typed_error() {
        let lua = Lua::new();
        let v: Value = lua.load(r#"return { kinds = {"one"} }"#).eval().unwrap();
        assert!(matches!(
            lua_to_filter(&v),
            Err(PolicyError::MalformedFilter(_))
        ));
    }

    #[test]
    fn json_values_cross_both_ways() {
        let lua = Lua::new();
        let original = json!({
            "s": "text",
            "b": true,
            "i": 42,
            "f": 1.5,
            "list": [1, null, "x"],
            "nested": {"k": [true]}
        });
        let v = json_to_lua(&lua, &original).unwrap();
        assert_eq!(lua_to_json(&v).unwrap(), original);
    }

    #[test]
    fn empty_table_reads_as_object() {
        let lua = Lua::new();
        let v = Value::Table(lua.create_table().unwrap());
        assert_eq!(lua_to_json(&v).unwrap(), json!({}));
    }

    #[test]
    fn unsupported_values_are_rejected() {
        let lua = Lua::new();
        for src in [
            "return function() end",
            "return coroutine.create(function() end)",
            "return { 1, 2, x = 3 }",
            "return { [true] = 1 }",
            "return 0/0",
        ] {
            let v: Value = lua.load(src).eval().unwrap();
            assert!(
                matches!(lua_to_json(&v), Err(PolicyError::UnsupportedType(_))),
                "expected unsupported for {src}"
            );
        }
    }

    #[test]
    fn cyclic_table_is_rejected() {
        let lua = Lua::new();
        let v: Value = lua.load("local t = {} t.self = t return t").eval().unwrap();
        assert!(matches!(
            lua_to_json(&v),
            Err(PolicyError::UnsupportedType(_))
        ));
    }
}
