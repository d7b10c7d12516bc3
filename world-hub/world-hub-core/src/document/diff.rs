//! Object diffing and merging over JSON maps.
//!
//! Update payloads are nested objects holding only changed leaves. A key of the
//! form `-=name` requests removal of `name` from the enclosing object.

use serde_json::{Map, Value};

pub const DELETION_PREFIX: &str = "-=";

/// Expand dotted keys into nested objects: `{"a.b": 1}` becomes `{"a": {"b": 1}}`.
pub fn expand_object(source: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in source {
        let value = match value {
            Value::Object(inner) => Value::Object(expand_object(inner)),
            other => other,
        };
        insert_path(&mut out, &key, value);
    }
    out
}

fn insert_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        Some((head, rest)) => {
            let entry = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(inner) = entry {
                insert_path(inner, rest, value);
            }
        }
        None => {
            if let Value::Object(incoming) = value {
                if let Some(Value::Object(existing)) = target.get_mut(path) {
                    for (key, value) in incoming {
                        insert_path(existing, &key, value);
                    }
                    return;
                }
                target.insert(path.to_string(), Value::Object(incoming));
            } else {
                target.insert(path.to_string(), value);
            }
        }
    }
}

/// The subset of `changes` that would actually alter `original`.
pub fn diff_object(
    original: &Map<String, Value>,
    changes: &Map<String, Value>,
) -> Map<String, Value> {
    let mut diff = Map::new();
    for (key, value) in changes {
        if let Some(target) = key.strip_prefix(DELETION_PREFIX) {
            if original.contains_key(target) {
                diff.insert(key.clone(), Value::Null);
            }
            continue;
        }
        match (original.get(key), value) {
            (Some(Value::Object(before)), Value::Object(after)) => {
                let inner = diff_object(before, after);
                if !inner.is_empty() {
                    diff.insert(key.clone(), Value::Object(inner));
                }
            }
            (Some(before), after) if before == after => {}
            (None, Value::Object(after)) => {
                // A branch holding only removals of absent keys changes nothing.
                let inner = diff_object(&Map::new(), after);
                if !inner.is_empty() || after.is_empty() {
                    diff.insert(key.clone(), Value::Object(inner));
                }
            }
            (_, after) => {
                diff.insert(key.clone(), strip_deletions(after));
            }
        }
    }
    diff
}

/// Deep-merge `changes` into `target`, honouring `-=` removals.
pub fn merge_object(target: &mut Map<String, Value>, changes: &Map<String, Value>) {
    for (key, value) in changes {
        if let Some(stripped) = key.strip_prefix(DELETION_PREFIX) {
            target.remove(stripped);
            continue;
        }
        if let (Some(Value::Object(existing)), Value::Object(incoming)) =
            (target.get_mut(key), value)
        {
            merge_object(existing, incoming);
            continue;
        }
        target.insert(key.clone(), strip_deletions(value));
    }
}

fn strip_deletions(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !k.starts_with(DELETION_PREFIX))
                .map(|(k, v)| (k.clone(), strip_deletions(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn get_property<'a>(source: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = source.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Dotted paths of every leaf in a diff.
pub fn changed_paths(diff: &Map<String, Value>) -> Vec<String> {
    fn walk(prefix: &str, map: &Map<String, Value>, out: &mut Vec<String>) {
        for (key, value) in map {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            match value {
                Value::Object(inner) if !inner.is_empty() => walk(&path, inner, out),
                _ => out.push(path),
            }
        }
    }
    let mut out = Vec::new();
    walk("", diff, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn expands_dotted_keys() {
        let expanded = expand_object(obj(json!({
            "system.hp.value": 5,
            "system.hp.max": 7,
            "name": "A",
        })));
        assert_eq!(
            Value::Object(expanded),
            json!({"system": {"hp": {"value": 5, "max": 7}}, "name": "A"})
        );
    }

    #[test]
    fn unchanged_values_produce_empty_diff() {
        let original = obj(json!({"name": "A", "flags": {"core": {"x": 1}}}));
        let diff = diff_object(&original, &obj(json!({"name": "A", "flags": {"core": {"x": 1}}})));
        assert!(diff.is_empty());
    }

    #[test]
    fn diff_keeps_only_changed_leaves() {
        let original = obj(json!({"name": "A", "system": {"hp": 3, "ac": 12}}));
        let changes = obj(json!({"name": "A", "system": {"hp": 4, "ac": 12}}));
        let diff = diff_object(&original, &changes);
        assert_eq!(Value::Object(diff.clone()), json!({"system": {"hp": 4}}));
        assert_eq!(changed_paths(&diff), vec!["system.hp".to_string()]);
    }

    #[test]
    fn deletion_of_absent_key_is_dropped() {
        let original = obj(json!({"flags": {"core": {}}}));
        let diff = diff_object(&original, &obj(json!({"flags": {"core": {"-=x": null}}})));
        assert!(diff.is_empty());
        let changes = obj(json!({"flags": {"mod": {"-=x": null}}}));
        let diff = diff_object(&obj(json!({"flags": {}})), &changes);
        assert!(diff.is_empty());
    }

    #[test]
    fn merge_removes_deleted_keys() {
        let mut target = obj(json!({"flags": {"core": {"x": 5, "y": 1}}}));
        merge_object(&mut target, &obj(json!({"flags": {"core": {"-=x": null}}})));
        assert_eq!(Value::Object(target), json!({"flags": {"core": {"y": 1}}}));
    }

    #[test]
    fn merge_into_missing_branch_drops_deletion_markers() {
        let mut target = obj(json!({"flags": {}}));
        merge_object(&mut target, &obj(json!({"flags": {"mod": {"-=x": null, "y": 2}}})));
        assert_eq!(Value::Object(target), json!({"flags": {"mod": {"y": 2}}}));
    }
}
