use super::diff::{get_property, DELETION_PREFIX};
use super::Document;
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CORE_SCOPE: &str = "core";
pub const WORLD_SCOPE: &str = "world";

/// The flag namespaces currently allowed to write.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagScopes {
    pub system_id: Option<String>,
    pub modules: Vec<String>,
}

impl FlagScopes {
    pub fn new(system_id: Option<String>, modules: Vec<String>) -> Self {
        Self { system_id, modules }
    }

    pub fn validate(&self, scope: &str) -> Result<(), ValidationError> {
        let known = scope == CORE_SCOPE
            || scope == WORLD_SCOPE
            || self.system_id.as_deref() == Some(scope)
            || self.modules.iter().any(|m| m == scope);
        if known {
            Ok(())
        } else {
            Err(ValidationError::new(
                format!("flags.{scope}"),
                "flag scope is not valid or not currently active",
            ))
        }
    }
}

impl Document {
    pub fn get_flag(&self, scope: &str, key: &str) -> Option<&Value> {
        let entries = self.flags()?.get(scope)?.as_object()?;
        get_property(entries, key)
    }
}

/// Update payload writing (or, for `None`, removing) one flag.
pub(crate) fn flag_changes(scope: &str, key: &str, value: Option<Value>) -> Map<String, Value> {
    let mut segments: Vec<&str> = key.split('.').collect();
    let leaf = segments.pop().unwrap_or(key);
    let mut node = Map::new();
    match value {
        Some(value) => node.insert(leaf.to_string(), value),
        None => node.insert(format!("{DELETION_PREFIX}{leaf}"), Value::Null),
    };
    for segment in segments.into_iter().rev() {
        let mut parent = Map::new();
        parent.insert(segment.to_string(), Value::Object(node));
        node = parent;
    }
    let mut scoped = Map::new();
    scoped.insert(scope.to_string(), Value::Object(node));
    let mut changes = Map::new();
    changes.insert("flags".to_string(), Value::Object(scoped));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_nested_flag_payloads() {
        let set = flag_changes("core", "sheet.class", Some(json!("dark")));
        assert_eq!(Value::Object(set), json!({"flags": {"core": {"sheet": {"class": "dark"}}}}));
        let unset = flag_changes("core", "x", None);
        assert_eq!(Value::Object(unset), json!({"flags": {"core": {"-=x": null}}}));
    }

    #[test]
    fn only_active_scopes_validate() {
        let scopes = FlagScopes::new(Some("dnd5e".into()), vec!["tidy-sheet".into()]);
        assert!(scopes.validate("core").is_ok());
        assert!(scopes.validate("world").is_ok());
        assert!(scopes.validate("dnd5e").is_ok());
        assert!(scopes.validate("tidy-sheet").is_ok());
        assert!(scopes.validate("other").is_err());
    }
}
