//! Mapping between Automerge documents and JSON trees
//!
//! Replicas expose documents as plain serde values. Reads hydrate the
//! Automerge tree into a `serde_json::Value`; writes diff the edited tree
//! against the hydrated one and apply only the differences, so concurrent
//! edits to unrelated keys merge cleanly.
//!
//! Maps are reconciled key by key. Lists and scalars are replaced wholesale
//! when they differ.

use automerge::transaction::Transactable;
use automerge::{AutoCommit, ObjId, ObjType, ReadDoc, ScalarValue, Value as AmValue, ROOT};
use serde_json::{Map, Number, Value};

use crate::error::{PincalError, PincalResult};

/// Read the whole document as a JSON object
pub(crate) fn hydrate(doc: &AutoCommit) -> PincalResult<Value> {
    hydrate_object(doc, &ROOT, ObjType::Map)
}

fn hydrate_object(doc: &AutoCommit, obj: &ObjId, kind: ObjType) -> PincalResult<Value> {
    match kind {
        ObjType::Map | ObjType::Table => {
            let mut map = Map::new();
            for key in doc.keys(obj) {
                if let Some((value, id)) = doc.get(obj, key.as_str())? {
                    map.insert(key, hydrate_value(doc, value, &id)?);
                }
            }
            Ok(Value::Object(map))
        }
        ObjType::List => {
            let len = doc.length(obj);
            let mut items = Vec::with_capacity(len);
            for index in 0..len {
                if let Some((value, id)) = doc.get(obj, index)? {
                    items.push(hydrate_value(doc, value, &id)?);
                }
            }
            Ok(Value::Array(items))
        }
        ObjType::Text => Ok(Value::String(doc.text(obj)?)),
    }
}

fn hydrate_value(doc: &AutoCommit, value: AmValue<'_>, id: &ObjId) -> PincalResult<Value> {
    match value {
        AmValue::Object(kind) => hydrate_object(doc, id, kind),
        AmValue::Scalar(scalar) => Ok(scalar_to_json(&scalar)),
    }
}

fn scalar_to_json(scalar: &ScalarValue) -> Value {
    match scalar {
        ScalarValue::Str(s) => Value::String(s.to_string()),
        ScalarValue::Int(i) => Value::from(*i),
        ScalarValue::Uint(u) => Value::from(*u),
        ScalarValue::F64(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        ScalarValue::Boolean(b) => Value::Bool(*b),
        ScalarValue::Null => Value::Null,
        // Counters and timestamps surface as plain integers
        other => other.to_i64().map(Value::from).unwrap_or(Value::Null),
    }
}

/// Apply the difference between `old` and `new` to the document root
///
/// `old` must be the hydrated state of `doc`. Both trees must be objects.
pub(crate) fn reconcile(doc: &mut AutoCommit, old: &Value, new: &Value) -> PincalResult<()> {
    let empty = Map::new();
    let old = match old {
        Value::Object(map) => map,
        _ => &empty,
    };
    let Value::Object(new) = new else {
        return Err(PincalError::Serialization(
            "document root must be a JSON object".to_string(),
        ));
    };
    reconcile_map(doc, &ROOT, old, new)
}

fn reconcile_map(
    doc: &mut AutoCommit,
    obj: &ObjId,
    old: &Map<String, Value>,
    new: &Map<String, Value>,
) -> PincalResult<()> {
    for key in old.keys() {
        if !new.contains_key(key) {
            doc.delete(obj, key.as_str())?;
        }
    }

    for (key, value) in new {
        match (old.get(key), value) {
            (Some(previous), _) if previous == value => {}
            (Some(Value::Object(previous)), Value::Object(next)) => {
                match doc.get(obj, key.as_str())? {
                    Some((AmValue::Object(ObjType::Map), child)) => {
                        reconcile_map(doc, &child, previous, next)?;
                    }
                    _ => put_value(doc, obj, key, value)?,
                }
            }
            _ => put_value(doc, obj, key, value)?,
        }
    }
    Ok(())
}

fn put_value(doc: &mut AutoCommit, obj: &ObjId, key: &str, value: &Value) -> PincalResult<()> {
    match value {
        Value::Object(map) => {
            let child = doc.put_object(obj, key, ObjType::Map)?;
            for (k, v) in map {
                put_value(doc, &child, k, v)?;
            }
        }
        Value::Array(items) => {
            let child = doc.put_object(obj, key, ObjType::List)?;
            for (index, item) in items.iter().enumerate() {
                insert_value(doc, &child, index, item)?;
            }
        }
        scalar => doc.put(obj, key, json_to_scalar(scalar))?,
    }
    Ok(())
}

fn insert_value(doc: &mut AutoCommit, list: &ObjId, index: usize, value: &Value) -> PincalResult<()> {
    match value {
        Value::Object(map) => {
            let child = doc.insert_object(list, index, ObjType::Map)?;
            for (k, v) in map {
                put_value(doc, &child, k, v)?;
            }
        }
        Value::Array(items) => {
            let child = doc.insert_object(list, index, ObjType::List)?;
            for (i, item) in items.iter().enumerate() {
                insert_value(doc, &child, i, item)?;
            }
        }
        scalar => doc.insert(list, index, json_to_scalar(scalar))?,
    }
    Ok(())
}

fn json_to_scalar(value: &Value) -> ScalarValue {
    match value {
        Value::Bool(b) => ScalarValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                ScalarValue::Uint(u)
            } else {
                ScalarValue::F64(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => ScalarValue::Str(s.as_str().into()),
        _ => ScalarValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(doc: &mut AutoCommit, value: &Value) {
        let old = hydrate(doc).unwrap();
        reconcile(doc, &old, value).unwrap();
        doc.commit();
    }

    #[test]
    fn test_empty_document_hydrates_to_empty_object() {
        let doc = AutoCommit::new();
        assert_eq!(hydrate(&doc).unwrap(), json!({}));
    }

    #[test]
    fn test_nested_values_survive() {
        let mut doc = AutoCommit::new();
        let value = json!({
            "schemaVersion": { "1": { "deviceName": "Laptop", "tags": ["a", "b"] } },
            "count": 3,
            "ratio": 0.5,
            "flag": true,
            "nothing": null,
        });
        write(&mut doc, &value);
        assert_eq!(hydrate(&doc).unwrap(), value);
    }

    #[test]
    fn test_removed_keys_are_deleted() {
        let mut doc = AutoCommit::new();
        write(&mut doc, &json!({ "a": 1, "b": { "c": 2, "d": 3 } }));
        write(&mut doc, &json!({ "b": { "c": 2 } }));
        assert_eq!(hydrate(&doc).unwrap(), json!({ "b": { "c": 2 } }));
    }

    #[test]
    fn test_unchanged_write_produces_no_change() {
        let mut doc = AutoCommit::new();
        write(&mut doc, &json!({ "a": { "b": 1 } }));
        let heads = doc.get_heads();
        write(&mut doc, &json!({ "a": { "b": 1 } }));
        assert_eq!(doc.get_heads(), heads);
    }

    #[test]
    fn test_concurrent_edits_to_distinct_keys_merge() {
        let mut base = AutoCommit::new();
        write(&mut base, &json!({ "peers": { "x": { "name": "X" } } }));

        let mut left = base.fork();
        let mut right = base.fork();
        write(&mut left, &json!({ "peers": { "x": { "name": "X" }, "l": { "name": "L" } } }));
        write(&mut right, &json!({ "peers": { "x": { "name": "X" }, "r": { "name": "R" } } }));

        left.merge(&mut right).unwrap();
        let merged = hydrate(&left).unwrap();
        assert_eq!(merged["peers"]["l"]["name"], "L");
        assert_eq!(merged["peers"]["r"]["name"], "R");
        assert_eq!(merged["peers"]["x"]["name"], "X");
    }

    #[test]
    fn test_non_object_root_rejected() {
        let mut doc = AutoCommit::new();
        let err = reconcile(&mut doc, &json!({}), &json!([1, 2])).unwrap_err();
        assert!(matches!(err, PincalError::Serialization(_)));
    }
}
