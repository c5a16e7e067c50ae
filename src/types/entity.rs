//! Entity model shared by the store, conflict engine, and sync pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kinds of entities that can be synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Note,
    Folder,
    Review,
}

impl EntityKind {
    /// Get the table name for this entity kind.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Note => "notes",
            EntityKind::Folder => "folders",
            EntityKind::Review => "reviews",
        }
    }

    /// All entity kinds, in the order server updates are collected.
    pub fn all() -> [EntityKind; 3] {
        [EntityKind::Folder, EntityKind::Note, EntityKind::Review]
    }

    /// Field names a client may change for this kind.
    pub fn mutable_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Note => &["title", "content", "folderId", "pinned"],
            EntityKind::Folder => &["name", "parentId"],
            EntityKind::Review => &[
                "date",
                "content",
                "mood",
                "achievements",
                "improvements",
                "plans",
            ],
        }
    }

    /// The field carrying this kind's parent pointer, if it has one.
    pub fn parent_field(&self) -> Option<&'static str> {
        match self {
            EntityKind::Note => Some("folderId"),
            EntityKind::Folder => Some("parentId"),
            EntityKind::Review => None,
        }
    }

    /// The kind a parent pointer of this kind references.
    pub fn parent_kind(&self) -> Option<EntityKind> {
        match self {
            EntityKind::Note | EntityKind::Folder => Some(EntityKind::Folder),
            EntityKind::Review => None,
        }
    }
}

/// Note payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotePayload {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<i64>,
    #[serde(default)]
    pub pinned: bool,
    /// Hex SHA-256 of `content`, maintained by the store.
    #[serde(default)]
    pub content_hash: String,
}

/// Folder payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderPayload {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
}

/// Periodic review payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPayload {
    /// ISO-8601 date the review covers.
    pub date: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub achievements: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub plans: Vec<String>,
}

/// Tagged sum over the kind-specific payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityKind", rename_all = "snake_case")]
pub enum EntityPayload {
    Note(NotePayload),
    Folder(FolderPayload),
    Review(ReviewPayload),
}

impl EntityPayload {
    /// The kind this payload belongs to.
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPayload::Note(_) => EntityKind::Note,
            EntityPayload::Folder(_) => EntityKind::Folder,
            EntityPayload::Review(_) => EntityKind::Review,
        }
    }

    /// Flatten into a JSON object for field-level diffing and merging.
    /// The `entityKind` tag is stripped so only data fields remain.
    pub fn to_json_map(&self) -> Map<String, Value> {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = value {
            map.remove("entityKind");
            return map.clone();
        }
        Map::new()
    }

    /// Rebuild a payload of the given kind from a flat JSON object.
    pub fn from_json_map(kind: EntityKind, map: Map<String, Value>) -> Result<Self, String> {
        let mut value = Value::Object(map);
        if let Value::Object(ref mut obj) = value {
            obj.insert(
                "entityKind".to_string(),
                serde_json::to_value(kind).unwrap_or(Value::Null),
            );
        }
        serde_json::from_value(value).map_err(|e| format!("invalid {:?} payload: {}", kind, e))
    }
}

/// Common envelope carried by every synchronized entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: i64,
    pub user_id: i64,
    /// Monotonic per (kind, id); starts at 1, bumped on every applied write.
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
    /// Set on soft delete; tombstones stay queryable for conflict detection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    /// Client id of the last writer, "server" for server-side writes.
    #[serde(default)]
    pub modified_by: String,
    #[serde(flatten)]
    pub payload: EntityPayload,
}

impl Entity {
    /// Entity kind, derived from the payload.
    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    /// Whether this row is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Payload fields as a flat JSON object.
    pub fn payload_json(&self) -> Map<String, Value> {
        self.payload.to_json_map()
    }
}

/// Validate a change map against the kind's mutable field set.
/// Returns the offending field name on failure.
pub fn validate_changes(kind: EntityKind, changes: &Map<String, Value>) -> Result<(), String> {
    let allowed = kind.mutable_fields();
    for key in changes.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(format!("unknown field '{}' for {:?}", key, kind));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_table_names() {
        assert_eq!(EntityKind::Note.table_name(), "notes");
        assert_eq!(EntityKind::Folder.table_name(), "folders");
        assert_eq!(EntityKind::Review.table_name(), "reviews");
    }

    #[test]
    fn test_payload_json_round_trip() {
        let payload = EntityPayload::Note(NotePayload {
            title: "Groceries".to_string(),
            content: "milk, eggs".to_string(),
            folder_id: Some(3),
            pinned: true,
            content_hash: String::new(),
        });

        let map = payload.to_json_map();
        assert_eq!(map.get("title").and_then(Value::as_str), Some("Groceries"));
        assert!(!map.contains_key("entityKind"));

        let rebuilt = EntityPayload::from_json_map(EntityKind::Note, map).unwrap();
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn test_validate_changes_rejects_unknown_field() {
        let mut changes = Map::new();
        changes.insert("title".to_string(), Value::String("x".to_string()));
        assert!(validate_changes(EntityKind::Note, &changes).is_ok());

        changes.insert("color".to_string(), Value::String("red".to_string()));
        let err = validate_changes(EntityKind::Note, &changes).unwrap_err();
        assert!(err.contains("color"));
    }

    #[test]
    fn test_entity_serializes_camel_case() {
        let entity = Entity {
            id: 7,
            user_id: 1,
            version: 2,
            created_at: 1000,
            updated_at: 2000,
            deleted_at: None,
            modified_by: "c1".to_string(),
            payload: EntityPayload::Folder(FolderPayload {
                name: "Work".to_string(),
                parent_id: None,
            }),
        };

        let json = serde_json::to_string(&entity).unwrap();
        assert!(json.contains("\"userId\":1"));
        assert!(json.contains("\"entityKind\":\"folder\""));
        assert!(!json.contains("deletedAt"));
    }
}
