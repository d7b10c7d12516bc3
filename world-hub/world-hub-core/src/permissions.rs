//! Users, ownership levels and the per-action permission resolver.

use crate::document::diff::DELETION_PREFIX;
use crate::document::Document;
use crate::error::ValidationError;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UserRole {
    #[default]
    None,
    Player,
    Trusted,
    Assistant,
    GameMaster,
}

impl UserRole {
    pub fn is_gm(self) -> bool {
        self >= UserRole::Assistant
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub role: UserRole,
}

impl User {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>, role: UserRole) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
        }
    }

    pub fn is_gm(&self) -> bool {
        self.role.is_gm()
    }
}

/// The users known to a world.
#[derive(Clone, Debug, Default)]
pub struct Users {
    users: IndexMap<UserId, User>,
}

impl Users {
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
        }
    }

    /// Load a JSON array of users.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let users: Vec<User> = serde_json::from_str(&raw)?;
        Ok(Self::new(users))
    }

    pub fn insert(&mut self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn get(&self, id: &UserId) -> Option<&User> {
        self.users.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Access tier a user holds over a document. Ordered, so `>=` reads as
/// "at least".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum OwnershipLevel {
    /// Defer to the parent document.
    Inherit = -1,
    #[default]
    None = 0,
    Limited = 1,
    Observer = 2,
    Owner = 3,
}

impl OwnershipLevel {
    pub const ALL: [OwnershipLevel; 5] = [
        OwnershipLevel::Inherit,
        OwnershipLevel::None,
        OwnershipLevel::Limited,
        OwnershipLevel::Observer,
        OwnershipLevel::Owner,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OwnershipLevel::Inherit => "INHERIT",
            OwnershipLevel::None => "NONE",
            OwnershipLevel::Limited => "LIMITED",
            OwnershipLevel::Observer => "OBSERVER",
            OwnershipLevel::Owner => "OWNER",
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().and_then(|n| Self::try_from(n).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for OwnershipLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("unknown ownership level {0}")]
pub struct UnknownLevel(pub String);

impl FromStr for OwnershipLevel {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(level) = Self::ALL.into_iter().find(|l| l.as_str().eq_ignore_ascii_case(s)) {
            return Ok(level);
        }
        s.trim()
            .parse::<i64>()
            .map_err(|_| UnknownLevel(s.to_string()))
            .and_then(|n: i64| Self::try_from(n))
    }
}

impl TryFrom<&str> for OwnershipLevel {
    type Error = UnknownLevel;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<i64> for OwnershipLevel {
    type Error = UnknownLevel;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|l| *l as i64 == value)
            .ok_or_else(|| UnknownLevel(value.to_string()))
    }
}

impl TryFrom<i32> for OwnershipLevel {
    type Error = UnknownLevel;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::try_from(i64::from(value))
    }
}

impl TryFrom<i8> for OwnershipLevel {
    type Error = UnknownLevel;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        Self::try_from(i64::from(value))
    }
}

impl Serialize for OwnershipLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(*self as i8)
    }
}

impl<'de> Deserialize<'de> for OwnershipLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown ownership level {value}")))
    }
}

/// A document's `ownership` map: a default level plus per-user overrides.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ownership {
    pub default: OwnershipLevel,
    pub users: HashMap<UserId, OwnershipLevel>,
}

impl Ownership {
    /// Read an ownership map. A missing map defers to the parent.
    pub fn from_value(value: Option<&Value>) -> Self {
        let Some(Value::Object(map)) = value else {
            return Self {
                default: OwnershipLevel::Inherit,
                users: HashMap::new(),
            };
        };
        let mut ownership = Self::default();
        for (key, level) in map {
            let Some(level) = OwnershipLevel::from_value(level) else {
                continue;
            };
            if key == "default" {
                ownership.default = level;
            } else {
                ownership.users.insert(UserId::from(key.as_str()), level);
            }
        }
        ownership
    }

    pub fn level_of(&self, user: &UserId) -> Option<OwnershipLevel> {
        self.users.get(user).copied()
    }

    /// Rewrite aliases to their numeric form and enforce that `default`
    /// survives. `partial` maps are update payloads and may carry removals.
    pub fn normalize(value: &mut Value, partial: bool) -> Result<(), ValidationError> {
        let Value::Object(map) = value else {
            return Err(ValidationError::new("ownership", "must be an object"));
        };
        for (key, level) in map.iter_mut() {
            if let Some(target) = key.strip_prefix(DELETION_PREFIX) {
                if !partial || target == "default" {
                    return Err(ValidationError::new(
                        format!("ownership.{target}"),
                        "may not be removed",
                    ));
                }
                continue;
            }
            let parsed = OwnershipLevel::from_value(level).ok_or_else(|| {
                ValidationError::new(format!("ownership.{key}"), format!("{level} is not a level"))
            })?;
            *level = Value::from(parsed as i8);
        }
        if !partial && !map.contains_key("default") {
            map.insert("default".to_string(), Value::from(OwnershipLevel::None as i8));
        }
        Ok(())
    }
}

/// Give a non-GM creator `OWNER` over a new top-level document unless the
/// candidate already names a level for them.
pub(crate) fn grant_creator(data: &mut Map<String, Value>, user: &User) {
    if user.is_gm() {
        return;
    }
    let ownership = data
        .entry("ownership")
        .or_insert_with(|| serde_json::json!({ "default": 0 }));
    if let Value::Object(map) = ownership {
        map.entry(user.id.as_str())
            .or_insert_with(|| Value::from(OwnershipLevel::Owner as i8));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    View,
    Update,
    Delete,
    Configure,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Create => "create",
            Action::View => "view",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Configure => "configure",
        })
    }
}

pub type PermissionPredicate =
    dyn Fn(&User, &Document, Option<&Map<String, Value>>) -> bool + Send + Sync;

/// How one action is gated for a kind.
#[derive(Clone)]
pub enum ActionRule {
    /// Minimum ownership level over the document.
    Level(OwnershipLevel),
    /// Minimum user role.
    Role(UserRole),
    /// Kind-specific test over the user, the document and the candidate data.
    Predicate(Arc<PermissionPredicate>),
}

impl ActionRule {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&User, &Document, Option<&Map<String, Value>>) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }
}

impl fmt::Debug for ActionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionRule::Level(level) => f.debug_tuple("Level").field(level).finish(),
            ActionRule::Role(role) => f.debug_tuple("Role").field(role).finish(),
            ActionRule::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PermissionRules {
    rules: HashMap<Action, ActionRule>,
}

impl Default for PermissionRules {
    fn default() -> Self {
        let rules = HashMap::from([
            (Action::Create, ActionRule::Role(UserRole::Player)),
            (Action::View, ActionRule::Level(OwnershipLevel::Limited)),
            (Action::Update, ActionRule::Level(OwnershipLevel::Owner)),
            (Action::Delete, ActionRule::Level(OwnershipLevel::Owner)),
            (Action::Configure, ActionRule::Level(OwnershipLevel::Owner)),
        ]);
        Self { rules }
    }
}

impl PermissionRules {
    pub fn set(&mut self, action: Action, rule: ActionRule) {
        self.rules.insert(action, rule);
    }

    pub fn rule(&self, action: Action) -> Option<&ActionRule> {
        self.rules.get(&action)
    }
}

/// The level `user` holds over `document`.
///
/// An explicit entry for the user wins. Otherwise an embedded document defers
/// to its `parent`, and a top-level one falls back to its default level.
pub fn effective_level(
    user: &User,
    document: &Document,
    parent: Option<&Document>,
) -> OwnershipLevel {
    if user.is_gm() {
        return OwnershipLevel::Owner;
    }
    let ownership = document.ownership();
    if let Some(level) = ownership
        .level_of(&user.id)
        .filter(|l| *l != OwnershipLevel::Inherit)
    {
        return level;
    }
    match (parent, ownership.default) {
        (Some(parent), _) => effective_level(user, parent, None),
        (None, OwnershipLevel::Inherit) => OwnershipLevel::None,
        (None, level) => level,
    }
}

/// Whether `user` holds `level` over `document`: at least that level, or
/// exactly it when `exact` is set. Unknown aliases never grant access.
pub fn has_permission<L>(
    user: &User,
    document: &Document,
    parent: Option<&Document>,
    level: L,
    exact: bool,
) -> bool
where
    L: TryInto<OwnershipLevel>,
    L::Error: fmt::Display,
{
    let required = match level.try_into() {
        Ok(level) => level,
        Err(err) => {
            tracing::warn!(%err, "permission check against an unknown level");
            return false;
        }
    };
    let held = effective_level(user, document, parent);
    if exact {
        held == required
    } else {
        held >= required
    }
}

/// Evaluate the kind's rule for `action`. GMs may do anything.
pub fn can_user(
    user: &User,
    action: Action,
    document: &Document,
    parent: Option<&Document>,
    data: Option<&Map<String, Value>>,
) -> bool {
    if user.is_gm() {
        return true;
    }
    // Adding or removing children mutates the parent's field.
    if matches!(action, Action::Create | Action::Delete) {
        if let Some(parent) = parent {
            if !can_user(user, Action::Update, parent, None, None) {
                return false;
            }
        }
    }
    match document.descriptor().permissions().rule(action) {
        Some(ActionRule::Level(level)) => has_permission(user, document, parent, *level, false),
        Some(ActionRule::Role(role)) => user.role >= *role,
        Some(ActionRule::Predicate(test)) => test(user, document, data),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentKind, DocumentState, DocumentTypes};
    use serde_json::json;

    fn doc(types: &DocumentTypes, kind: DocumentKind, source: Value) -> Document {
        let Value::Object(source) = source else { unreachable!() };
        let descriptor = types.get(&kind).unwrap().clone();
        Document::build(descriptor, types, source, DocumentState::Stored, None)
    }

    fn player() -> User {
        User::new("p1", "Player", UserRole::Player)
    }

    #[test]
    fn levels_parse_from_aliases_and_numbers() {
        assert_eq!("OWNER".parse::<OwnershipLevel>(), Ok(OwnershipLevel::Owner));
        assert_eq!("limited".parse::<OwnershipLevel>(), Ok(OwnershipLevel::Limited));
        assert_eq!(OwnershipLevel::try_from(2i8), Ok(OwnershipLevel::Observer));
        assert_eq!(OwnershipLevel::try_from(-1i32), Ok(OwnershipLevel::Inherit));
        assert!(OwnershipLevel::try_from(7i64).is_err());
        assert!("ADMIN".parse::<OwnershipLevel>().is_err());
        assert_eq!(serde_json::to_value(OwnershipLevel::Owner).unwrap(), json!(3));
    }

    #[test]
    fn non_exact_checks_are_monotonic() {
        let types = DocumentTypes::standard();
        let actor = doc(
            &types,
            DocumentKind::ACTOR,
            json!({"_id": "a1", "name": "A", "type": "npc", "ownership": {"default": 0, "p1": 2}}),
        );
        let user = player();
        let granted: Vec<bool> = [
            OwnershipLevel::None,
            OwnershipLevel::Limited,
            OwnershipLevel::Observer,
            OwnershipLevel::Owner,
        ]
        .into_iter()
        .map(|level| has_permission(&user, &actor, None, level, false))
        .collect();
        assert_eq!(granted, vec![true, true, true, false]);
        assert!(has_permission(&user, &actor, None, "OBSERVER", true));
        assert!(!has_permission(&user, &actor, None, "LIMITED", true));
        assert!(!has_permission(&user, &actor, None, "ADMIN", false));
    }

    #[test]
    fn gm_resolves_to_owner_without_entries() {
        let types = DocumentTypes::standard();
        let actor = doc(
            &types,
            DocumentKind::ACTOR,
            json!({"_id": "a1", "name": "A", "type": "npc", "ownership": {"default": 0}}),
        );
        let gm = User::new("gm", "GM", UserRole::GameMaster);
        assert_eq!(effective_level(&gm, &actor, None), OwnershipLevel::Owner);
        assert!(has_permission(&gm, &actor, None, 3, false));
        assert!(!has_permission(&player(), &actor, None, OwnershipLevel::Limited, false));
    }

    #[test]
    fn embedded_documents_inherit_from_parent() {
        let types = DocumentTypes::standard();
        let actor = doc(
            &types,
            DocumentKind::ACTOR,
            json!({"_id": "a1", "name": "A", "type": "npc", "ownership": {"default": 0, "p1": 3}}),
        );
        let token = doc(
            &types,
            DocumentKind::TOKEN,
            json!({"_id": "t1", "ownership": {"default": -1}}),
        );
        assert_eq!(effective_level(&player(), &token, Some(&actor)), OwnershipLevel::Owner);
        assert_eq!(effective_level(&player(), &token, None), OwnershipLevel::None);
    }

    #[test]
    fn chat_messages_are_gated_on_author() {
        let types = DocumentTypes::standard();
        let message = doc(&types, DocumentKind::CHAT_MESSAGE, json!({"_id": "m1", "author": "p1"}));
        let user = player();
        let other = User::new("p2", "Other", UserRole::Player);
        assert!(can_user(&user, Action::Update, &message, None, None));
        assert!(!can_user(&other, Action::Update, &message, None, None));
        let Value::Object(steal) = json!({"author": "p2"}) else { unreachable!() };
        assert!(!can_user(&user, Action::Update, &message, None, Some(&steal)));
    }

    #[test]
    fn normalize_requires_default_on_full_maps() {
        let mut value = json!({"p1": "OBSERVER"});
        Ownership::normalize(&mut value, false).unwrap();
        assert_eq!(value, json!({"p1": 2, "default": 0}));
        let mut removal = json!({"-=p1": null});
        assert!(Ownership::normalize(&mut removal, true).is_ok());
        assert!(Ownership::normalize(&mut removal, false).is_err());
    }
}
