use crate::document::{FlagScopes, ID_LENGTH};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Client-side settings for a [`crate::registry::Registry`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    /// Id of the active game system; its flag scope is writable.
    pub system_id: Option<String>,
    /// Ids of active modules; each is a writable flag scope.
    pub modules: Vec<String>,
}

impl RegistryConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn flag_scopes(&self) -> FlagScopes {
        FlagScopes::new(self.system_id.clone(), self.modules.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthorityConfig {
    pub id_length: usize,
    /// Whether GM requests with `keepId` may choose their own ids.
    pub allow_keep_id: bool,
    /// Flag scopes the authority accepts writes to.
    pub flag_scopes: FlagScopes,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            id_length: ID_LENGTH,
            allow_keep_id: true,
            flag_scopes: FlagScopes::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn registry_config_loads_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"systemId": "dnd5e", "modules": ["tidy-sheet"]}}"#).unwrap();
        let config = RegistryConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.system_id.as_deref(), Some("dnd5e"));
        let scopes = config.flag_scopes();
        assert!(scopes.validate("tidy-sheet").is_ok());
        assert!(scopes.validate("other").is_err());
    }
}
