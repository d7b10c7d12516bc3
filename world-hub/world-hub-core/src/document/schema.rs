use super::diff::DELETION_PREFIX;
use super::DocumentKind;
use crate::error::ValidationError;
use crate::permissions::Ownership;
use indexmap::IndexMap;
use serde_json::{json, Map, Value};

#[derive(Clone, Debug, PartialEq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
    /// An array of documents of the given kind, managed by an embedded collection.
    Embedded(DocumentKind),
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
            FieldType::Embedded(_) => value
                .as_array()
                .map_or(false, |entries| entries.iter().all(Value::is_object)),
        }
    }

    fn describe(&self) -> String {
        match self {
            FieldType::Embedded(kind) => format!("an array of {kind} documents"),
            other => format!("{other:?}").to_lowercase(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FieldSpec {
    name: &'static str,
    ty: FieldType,
    required: bool,
    nullable: bool,
    default: Option<Value>,
}

impl FieldSpec {
    pub fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
            nullable: false,
            default: None,
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn number(name: &'static str) -> Self {
        Self::new(name, FieldType::Number)
    }

    pub fn integer(name: &'static str) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn boolean(name: &'static str) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn object(name: &'static str) -> Self {
        Self::new(name, FieldType::Object).default(json!({}))
    }

    pub fn array(name: &'static str) -> Self {
        Self::new(name, FieldType::Array).default(json!([]))
    }

    pub fn any(name: &'static str) -> Self {
        Self::new(name, FieldType::Any)
    }

    pub fn embedded(name: &'static str, kind: DocumentKind) -> Self {
        Self::new(name, FieldType::Embedded(kind)).default(json!([]))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn field_type(&self) -> &FieldType {
        &self.ty
    }

    fn check(&self, value: &Value) -> Result<(), ValidationError> {
        if self.ty.accepts(value) {
            Ok(())
        } else {
            Err(ValidationError::new(
                self.name,
                format!("must be {}", self.ty.describe()),
            ))
        }
    }
}

/// Field rules for one document kind.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    fields: IndexMap<&'static str, FieldSpec>,
}

impl Schema {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The fields every document carries.
    pub fn document() -> Self {
        Self::empty()
            .field(FieldSpec::string("_id").nullable())
            .field(FieldSpec::object("flags"))
            .field(FieldSpec::object("ownership").default(json!({"default": 0})))
            .field(FieldSpec::object("_stats"))
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.insert(spec.name, spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.values()
    }

    /// Fill defaults and validate a complete candidate.
    pub fn clean_create(&self, data: &mut Map<String, Value>) -> Result<(), ValidationError> {
        if let Some(unknown) = data.keys().find(|k| !self.fields.contains_key(k.as_str())) {
            return Err(ValidationError::new(unknown.as_str(), "is not a known field"));
        }
        for spec in self.fields.values() {
            match data.get(spec.name) {
                None => {
                    if let Some(default) = &spec.default {
                        data.insert(spec.name.to_string(), default.clone());
                    } else if spec.required {
                        return Err(ValidationError::new(spec.name, "may not be undefined"));
                    }
                }
                Some(Value::Null) if spec.nullable => {}
                Some(Value::Null) => {
                    if let Some(default) = &spec.default {
                        data.insert(spec.name.to_string(), default.clone());
                    } else if spec.required {
                        return Err(ValidationError::new(spec.name, "may not be null"));
                    } else {
                        data.remove(spec.name);
                    }
                }
                Some(value) => spec.check(value)?,
            }
        }
        self.clean_special(data, false)
    }

    /// Validate the keys present in a partial update.
    pub fn validate_update(&self, changes: &mut Map<String, Value>) -> Result<(), ValidationError> {
        for (key, value) in changes.iter() {
            if let Some(target) = key.strip_prefix(DELETION_PREFIX) {
                if matches!(target, "_id" | "_stats" | "ownership" | "flags") {
                    return Err(ValidationError::new(target, "may not be removed"));
                }
                match self.fields.get(target) {
                    Some(spec) if !spec.required && !matches!(spec.ty, FieldType::Embedded(_)) => {
                        continue
                    }
                    Some(_) => return Err(ValidationError::new(target, "may not be removed")),
                    None => return Err(ValidationError::new(target, "is not a known field")),
                }
            }
            let Some(spec) = self.fields.get(key.as_str()) else {
                return Err(ValidationError::new(key.as_str(), "is not a known field"));
            };
            if matches!(key.as_str(), "_id" | "_stats") {
                return Err(ValidationError::new(key.as_str(), "may not be updated"));
            }
            if let FieldType::Embedded(kind) = &spec.ty {
                return Err(ValidationError::new(
                    key.as_str(),
                    format!("{kind} documents must be changed through embedded operations"),
                ));
            }
            if value.is_null() {
                if spec.required && !spec.nullable {
                    return Err(ValidationError::new(key.as_str(), "may not be null"));
                }
                continue;
            }
            spec.check(value)?;
        }
        self.clean_special(changes, true)
    }

    fn clean_special(
        &self,
        data: &mut Map<String, Value>,
        partial: bool,
    ) -> Result<(), ValidationError> {
        if let Some(ownership) = data.get_mut("ownership") {
            Ownership::normalize(ownership, partial)?;
        }
        if let Some(Value::Object(flags)) = data.get("flags") {
            for (scope, entries) in flags {
                if !scope.starts_with(DELETION_PREFIX) && !entries.is_object() {
                    return Err(ValidationError::new(
                        format!("flags.{scope}"),
                        "a flag scope must be an object",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::document()
            .field(FieldSpec::string("name").required())
            .field(FieldSpec::integer("sort").default(json!(0)))
            .field(FieldSpec::string("img").nullable())
            .field(FieldSpec::embedded("items", DocumentKind::ITEM))
    }

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn create_fills_defaults() {
        let mut data = obj(json!({"name": "Goblin"}));
        schema().clean_create(&mut data).unwrap();
        assert_eq!(data["sort"], json!(0));
        assert_eq!(data["ownership"], json!({"default": 0}));
        assert_eq!(data["items"], json!([]));
    }

    #[test]
    fn create_rejects_missing_required_field() {
        let mut data = obj(json!({"sort": 2}));
        let err = schema().clean_create(&mut data).unwrap_err();
        assert_eq!(err.field, "name");
    }

    #[test]
    fn create_rejects_unknown_field_and_wrong_type() {
        let mut data = obj(json!({"name": "Goblin", "colour": "red"}));
        assert_eq!(schema().clean_create(&mut data).unwrap_err().field, "colour");
        let mut data = obj(json!({"name": 7}));
        assert_eq!(schema().clean_create(&mut data).unwrap_err().field, "name");
    }

    #[test]
    fn update_rejects_embedded_and_stats_fields() {
        let mut changes = obj(json!({"items": []}));
        assert!(schema().validate_update(&mut changes).is_err());
        let mut changes = obj(json!({"_stats": {}}));
        assert!(schema().validate_update(&mut changes).is_err());
    }

    #[test]
    fn update_cannot_remove_identity_or_permission_maps() {
        for field in ["_id", "_stats", "ownership", "flags"] {
            let mut changes = Map::new();
            changes.insert(format!("-={field}"), Value::Null);
            let err = schema().validate_update(&mut changes).unwrap_err();
            assert_eq!(err.field, field);
        }
        let mut changes = obj(json!({"-=img": null}));
        assert!(schema().validate_update(&mut changes).is_ok());
    }

    #[test]
    fn update_normalizes_ownership_aliases() {
        let mut changes = obj(json!({"ownership": {"user1": "OWNER"}}));
        schema().validate_update(&mut changes).unwrap();
        assert_eq!(changes["ownership"], json!({"user1": 3}));
    }

    #[test]
    fn update_cannot_remove_default_ownership() {
        let mut changes = obj(json!({"ownership": {"-=default": null}}));
        assert!(schema().validate_update(&mut changes).is_err());
    }
}
