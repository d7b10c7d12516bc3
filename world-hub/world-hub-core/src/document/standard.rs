//! Descriptors for the stock document kinds.

use super::{DocumentDescriptor, DocumentKind, DocumentTypes, FieldSpec};
use crate::permissions::{Action, ActionRule, User, UserRole};
use crate::document::Document;
use serde_json::{json, Map, Value};

impl DocumentTypes {
    /// Every stock kind with its schema, subtypes, embedded fields and rules.
    pub fn standard() -> Self {
        Self::new()
            .with(actor())
            .with(item())
            .with(active_effect())
            .with(scene())
            .with(token())
            .with(wall())
            .with(region())
            .with(chat_message())
            .with(combat())
            .with(combatant())
            .with(playlist())
            .with(playlist_sound())
            .with(folder())
            .with(journal_entry())
    }
}

fn named(kind: DocumentKind) -> super::DescriptorBuilder {
    DocumentDescriptor::builder(kind)
        .field(FieldSpec::string("name").required())
        .field(FieldSpec::string("img").nullable())
        .field(FieldSpec::string("folder").nullable())
        .field(FieldSpec::integer("sort").default(json!(0)))
}

fn actor() -> std::sync::Arc<DocumentDescriptor> {
    named(DocumentKind::ACTOR)
        .field(FieldSpec::object("system"))
        .field(FieldSpec::object("prototypeToken"))
        .subtypes(["character", "npc", "vehicle"])
        .embed("items", DocumentKind::ITEM)
        .embed("effects", DocumentKind::ACTIVE_EFFECT)
        .permission(Action::Create, ActionRule::Role(UserRole::Player))
        .build()
}

fn item() -> std::sync::Arc<DocumentDescriptor> {
    named(DocumentKind::ITEM)
        .field(FieldSpec::object("system"))
        .subtypes(["weapon", "equipment", "consumable", "spell", "feat", "loot"])
        .embed("effects", DocumentKind::ACTIVE_EFFECT)
        .permission(Action::Create, ActionRule::Role(UserRole::Player))
        .build()
}

fn active_effect() -> std::sync::Arc<DocumentDescriptor> {
    DocumentDescriptor::builder(DocumentKind::ACTIVE_EFFECT)
        .field(FieldSpec::string("name").required())
        .field(FieldSpec::string("img").nullable())
        .field(FieldSpec::boolean("disabled").default(json!(false)))
        .field(FieldSpec::array("changes"))
        .field(FieldSpec::object("duration"))
        .field(FieldSpec::string("origin").nullable())
        .embedded_only()
        .build()
}

fn scene() -> std::sync::Arc<DocumentDescriptor> {
    named(DocumentKind::SCENE)
        .field(FieldSpec::boolean("active").default(json!(false)))
        .field(FieldSpec::integer("width").default(json!(4000)))
        .field(FieldSpec::integer("height").default(json!(3000)))
        .field(FieldSpec::object("grid"))
        .embed("tokens", DocumentKind::TOKEN)
        .embed("walls", DocumentKind::WALL)
        .embed("regions", DocumentKind::REGION)
        .permission(Action::Create, ActionRule::Role(UserRole::Assistant))
        .build()
}

fn token() -> std::sync::Arc<DocumentDescriptor> {
    DocumentDescriptor::builder(DocumentKind::TOKEN)
        .field(FieldSpec::string("name").default(json!("")))
        .field(FieldSpec::string("actorId").nullable())
        .field(FieldSpec::number("x").default(json!(0)))
        .field(FieldSpec::number("y").default(json!(0)))
        .field(FieldSpec::boolean("hidden").default(json!(false)))
        .embedded_only()
        .build()
}

fn wall() -> std::sync::Arc<DocumentDescriptor> {
    DocumentDescriptor::builder(DocumentKind::WALL)
        .field(FieldSpec::array("c").required())
        .field(FieldSpec::integer("move").default(json!(20)))
        .field(FieldSpec::integer("sight").default(json!(20)))
        .field(FieldSpec::integer("door").default(json!(0)))
        .embedded_only()
        .permission(Action::Create, ActionRule::Role(UserRole::Assistant))
        .build()
}

fn region() -> std::sync::Arc<DocumentDescriptor> {
    DocumentDescriptor::builder(DocumentKind::REGION)
        .field(FieldSpec::string("name").required())
        .field(FieldSpec::array("shapes"))
        .field(FieldSpec::string("color").nullable())
        .embedded_only()
        .permission(Action::Create, ActionRule::Role(UserRole::Assistant))
        .build()
}

/// Chat messages are gated on authorship rather than ownership.
fn chat_message() -> std::sync::Arc<DocumentDescriptor> {
    DocumentDescriptor::builder(DocumentKind::CHAT_MESSAGE)
        .field(FieldSpec::string("author").required())
        .field(FieldSpec::string("content").default(json!("")))
        .field(FieldSpec::array("whisper"))
        .field(FieldSpec::object("speaker"))
        .field(FieldSpec::number("timestamp").nullable())
        .permission(Action::Create, ActionRule::predicate(authored_by_user))
        .permission(Action::Update, ActionRule::predicate(author_keeps_message))
        .permission(Action::Delete, ActionRule::predicate(author_keeps_message))
        .permission(Action::View, ActionRule::predicate(can_see_message))
        .build()
}

fn author_of<'a>(document: &'a Document, data: Option<&'a Map<String, Value>>) -> Option<&'a str> {
    data.and_then(|d| d.get("author"))
        .or_else(|| document.source().get("author"))
        .and_then(Value::as_str)
}

fn authored_by_user(user: &User, document: &Document, data: Option<&Map<String, Value>>) -> bool {
    author_of(document, data) == Some(user.id.as_str())
}

fn author_keeps_message(
    user: &User,
    document: &Document,
    data: Option<&Map<String, Value>>,
) -> bool {
    let current = document.source().get("author").and_then(Value::as_str);
    current == Some(user.id.as_str()) && author_of(document, data) == Some(user.id.as_str())
}

fn can_see_message(user: &User, document: &Document, _data: Option<&Map<String, Value>>) -> bool {
    let whisper = document.source().get("whisper").and_then(Value::as_array);
    match whisper {
        Some(targets) if !targets.is_empty() => {
            authored_by_user(user, document, None)
                || targets.iter().any(|t| t.as_str() == Some(user.id.as_str()))
        }
        _ => true,
    }
}

fn combat() -> std::sync::Arc<DocumentDescriptor> {
    DocumentDescriptor::builder(DocumentKind::COMBAT)
        .field(FieldSpec::string("scene").nullable())
        .field(FieldSpec::boolean("active").default(json!(false)))
        .field(FieldSpec::integer("round").default(json!(0)))
        .field(FieldSpec::integer("turn").nullable())
        .embed("combatants", DocumentKind::COMBATANT)
        .permission(Action::Create, ActionRule::Role(UserRole::Assistant))
        .build()
}

fn combatant() -> std::sync::Arc<DocumentDescriptor> {
    DocumentDescriptor::builder(DocumentKind::COMBATANT)
        .field(FieldSpec::string("actorId").nullable())
        .field(FieldSpec::string("tokenId").nullable())
        .field(FieldSpec::number("initiative").nullable())
        .field(FieldSpec::boolean("defeated").default(json!(false)))
        .field(FieldSpec::boolean("hidden").default(json!(false)))
        .embedded_only()
        .build()
}

fn playlist() -> std::sync::Arc<DocumentDescriptor> {
    named(DocumentKind::PLAYLIST)
        .field(FieldSpec::integer("mode").default(json!(0)))
        .field(FieldSpec::boolean("playing").default(json!(false)))
        .embed("sounds", DocumentKind::PLAYLIST_SOUND)
        .permission(Action::Create, ActionRule::Role(UserRole::Assistant))
        .build()
}

fn playlist_sound() -> std::sync::Arc<DocumentDescriptor> {
    DocumentDescriptor::builder(DocumentKind::PLAYLIST_SOUND)
        .field(FieldSpec::string("name").required())
        .field(FieldSpec::string("path").nullable())
        .field(FieldSpec::boolean("playing").default(json!(false)))
        .field(FieldSpec::boolean("repeat").default(json!(false)))
        .field(FieldSpec::number("volume").default(json!(0.5)))
        .embedded_only()
        .build()
}

fn folder() -> std::sync::Arc<DocumentDescriptor> {
    DocumentDescriptor::builder(DocumentKind::FOLDER)
        .field(FieldSpec::string("name").required())
        .field(FieldSpec::string("folder").nullable())
        .field(FieldSpec::string("sorting").default(json!("a")))
        .field(FieldSpec::string("color").nullable())
        .subtypes(["Actor", "Item", "Scene", "JournalEntry", "Playlist"])
        .permission(Action::Create, ActionRule::Role(UserRole::Assistant))
        .build()
}

fn journal_entry() -> std::sync::Arc<DocumentDescriptor> {
    named(DocumentKind::JOURNAL_ENTRY)
        .field(FieldSpec::string("content").default(json!("")))
        .permission(Action::Create, ActionRule::Role(UserRole::Trusted))
        .build()
}
