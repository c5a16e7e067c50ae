//! SQLite persistence layer for synchronized entities.
//!
//! The store is the sole custodian of entity rows: it is the only layer
//! that assigns ids, bumps versions, and refreshes `updated_at`. Soft
//! deletes leave tombstones in place so late-arriving updates can be
//! classified against them.

use rusqlite::{params, Connection, Row};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::types::{validate_changes, Entity, EntityKind, EntityPayload};

/// Writer recorded when a mutation does not originate from a client.
pub const SERVER_WRITER: &str = "server";

/// SQLite store for notes, folders, and reviews.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create a new SQLite store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("SQLite store initialized");
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("In-memory SQLite store initialized");
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER,
                modified_by TEXT NOT NULL DEFAULT 'server',
                title TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                folder_id INTEGER,
                pinned INTEGER NOT NULL DEFAULT 0,
                content_hash TEXT NOT NULL DEFAULT ''
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER,
                modified_by TEXT NOT NULL DEFAULT 'server',
                name TEXT NOT NULL,
                parent_id INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS reviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER,
                modified_by TEXT NOT NULL DEFAULT 'server',
                date TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                mood TEXT NOT NULL DEFAULT '',
                achievements TEXT NOT NULL DEFAULT '[]',
                improvements TEXT NOT NULL DEFAULT '[]',
                plans TEXT NOT NULL DEFAULT '[]'
            )",
            [],
        )?;

        // Change-cursor indexes for incremental pull
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_notes_user_updated ON notes(user_id, updated_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_folders_user_updated ON folders(user_id, updated_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_reviews_user_updated ON reviews(user_id, updated_at)",
            [],
        )?;

        Ok(())
    }

    fn columns(kind: EntityKind) -> &'static str {
        match kind {
            EntityKind::Note => {
                "id, user_id, version, created_at, updated_at, deleted_at, modified_by, \
                 title, content, folder_id, pinned, content_hash"
            }
            EntityKind::Folder => {
                "id, user_id, version, created_at, updated_at, deleted_at, modified_by, \
                 name, parent_id"
            }
            EntityKind::Review => {
                "id, user_id, version, created_at, updated_at, deleted_at, modified_by, \
                 date, content, mood, achievements, improvements, plans"
            }
        }
    }

    fn row_to_entity(kind: EntityKind, row: &Row<'_>) -> rusqlite::Result<Entity> {
        let payload = match kind {
            EntityKind::Note => EntityPayload::Note(crate::types::NotePayload {
                title: row.get(7)?,
                content: row.get(8)?,
                folder_id: row.get(9)?,
                pinned: row.get::<_, i64>(10)? != 0,
                content_hash: row.get(11)?,
            }),
            EntityKind::Folder => EntityPayload::Folder(crate::types::FolderPayload {
                name: row.get(7)?,
                parent_id: row.get(8)?,
            }),
            EntityKind::Review => EntityPayload::Review(crate::types::ReviewPayload {
                date: row.get(7)?,
                content: row.get(8)?,
                mood: row.get(9)?,
                achievements: serde_json::from_str(&row.get::<_, String>(10)?)
                    .unwrap_or_default(),
                improvements: serde_json::from_str(&row.get::<_, String>(11)?)
                    .unwrap_or_default(),
                plans: serde_json::from_str(&row.get::<_, String>(12)?).unwrap_or_default(),
            }),
        };

        Ok(Entity {
            id: row.get(0)?,
            user_id: row.get(1)?,
            version: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            deleted_at: row.get(5)?,
            modified_by: row.get(6)?,
            payload,
        })
    }

    /// Hex SHA-256 of note content.
    pub fn content_hash(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Get an entity by id, tombstones included.
    pub fn get(&self, user_id: i64, kind: EntityKind, id: i64) -> Result<Option<Entity>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM {} WHERE user_id = ?1 AND id = ?2",
            Self::columns(kind),
            kind.table_name()
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![user_id, id], |row| Self::row_to_entity(kind, row))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Entities (tombstones included) whose `updated_at >= since`.
    pub fn list_changed_since(
        &self,
        user_id: i64,
        kind: EntityKind,
        since: i64,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM {} WHERE user_id = ?1 AND updated_at >= ?2
             ORDER BY updated_at ASC LIMIT ?3",
            Self::columns(kind),
            kind.table_name()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, since, limit as i64], |row| {
            Self::row_to_entity(kind, row)
        })?;
        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }
        Ok(entities)
    }

    /// Check that a non-deleted entity exists for this user.
    pub fn exists(&self, user_id: i64, kind: EntityKind, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT 1 FROM {} WHERE user_id = ?1 AND id = ?2 AND deleted_at IS NULL",
            kind.table_name()
        );
        let found = conn
            .query_row(&sql, params![user_id, id], |_| Ok(true))
            .unwrap_or(false);
        Ok(found)
    }

    /// Whether re-parenting `folder_id` under `new_parent` would create a cycle.
    /// A folder may never be an ancestor of itself.
    pub fn would_create_cycle(
        &self,
        user_id: i64,
        folder_id: i64,
        new_parent: i64,
    ) -> Result<bool> {
        if folder_id == new_parent {
            return Ok(true);
        }

        let conn = self.conn.lock().unwrap();
        let mut current = Some(new_parent);
        // Parent chains are short; the hop bound only guards corrupt data.
        let mut hops = 0;
        while let Some(id) = current {
            if id == folder_id {
                return Ok(true);
            }
            hops += 1;
            if hops > 1_000 {
                return Err(AppError::Internal(format!(
                    "parent chain for folder {} exceeds depth bound",
                    new_parent
                )));
            }
            current = conn
                .query_row(
                    "SELECT parent_id FROM folders WHERE user_id = ?1 AND id = ?2",
                    params![user_id, id],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .unwrap_or(None);
        }
        Ok(false)
    }

    fn check_parent(&self, user_id: i64, kind: EntityKind, payload: &EntityPayload) -> Result<()> {
        let parent_id = match payload {
            EntityPayload::Note(note) => note.folder_id,
            EntityPayload::Folder(folder) => folder.parent_id,
            EntityPayload::Review(_) => None,
        };
        if let (Some(parent_id), Some(parent_kind)) = (parent_id, kind.parent_kind()) {
            if !self.exists(user_id, parent_kind, parent_id)? {
                return Err(AppError::InvariantViolation(format!(
                    "parent {} {} does not exist",
                    parent_kind.table_name(),
                    parent_id
                )));
            }
        }
        Ok(())
    }

    /// Create an entity from a client payload map. Assigns the id, sets
    /// version 1, stamps timestamps, and computes the content hash.
    pub fn create(
        &self,
        user_id: i64,
        kind: EntityKind,
        payload: Map<String, Value>,
        writer: &str,
    ) -> Result<Entity> {
        let mut built = EntityPayload::from_json_map(kind, payload)
            .map_err(AppError::BadRequest)?;
        if let EntityPayload::Note(ref mut note) = built {
            note.content_hash = Self::content_hash(&note.content);
        }
        self.check_parent(user_id, kind, &built)?;

        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock().unwrap();
        let id: i64 = match &built {
            EntityPayload::Note(note) => {
                conn.execute(
                    "INSERT INTO notes
                        (user_id, version, created_at, updated_at, modified_by,
                         title, content, folder_id, pinned, content_hash)
                     VALUES (?1, 1, ?2, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        user_id,
                        now,
                        writer,
                        note.title,
                        note.content,
                        note.folder_id,
                        note.pinned as i64,
                        note.content_hash,
                    ],
                )?;
                conn.last_insert_rowid()
            }
            EntityPayload::Folder(folder) => {
                conn.execute(
                    "INSERT INTO folders
                        (user_id, version, created_at, updated_at, modified_by, name, parent_id)
                     VALUES (?1, 1, ?2, ?2, ?3, ?4, ?5)",
                    params![user_id, now, writer, folder.name, folder.parent_id],
                )?;
                conn.last_insert_rowid()
            }
            EntityPayload::Review(review) => {
                conn.execute(
                    "INSERT INTO reviews
                        (user_id, version, created_at, updated_at, modified_by,
                         date, content, mood, achievements, improvements, plans)
                     VALUES (?1, 1, ?2, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        user_id,
                        now,
                        writer,
                        review.date,
                        review.content,
                        review.mood,
                        serde_json::to_string(&review.achievements)?,
                        serde_json::to_string(&review.improvements)?,
                        serde_json::to_string(&review.plans)?,
                    ],
                )?;
                conn.last_insert_rowid()
            }
        };
        drop(conn);

        debug!("Created {} {} for user {}", kind.table_name(), id, user_id);

        Ok(Entity {
            id,
            user_id,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            modified_by: writer.to_string(),
            payload: built,
        })
    }

    /// Apply a change map to an entity: asserts `expected_version` when
    /// supplied, applies the changes, bumps the version, refreshes
    /// `updated_at`, and recomputes the content hash when content changed.
    pub fn update(
        &self,
        user_id: i64,
        kind: EntityKind,
        id: i64,
        changes: &Map<String, Value>,
        expected_version: Option<i64>,
        writer: &str,
    ) -> Result<Entity> {
        validate_changes(kind, changes).map_err(AppError::BadRequest)?;

        let current = self
            .get(user_id, kind, id)?
            .ok_or_else(|| AppError::NotFound(format!("{} {}", kind.table_name(), id)))?;

        if let Some(expected) = expected_version {
            if current.version != expected {
                return Err(AppError::VersionMismatch {
                    expected,
                    actual: current.version,
                });
            }
        }

        let mut merged = current.payload_json();
        for (key, value) in changes {
            merged.insert(key.clone(), value.clone());
        }
        let mut built =
            EntityPayload::from_json_map(kind, merged).map_err(AppError::BadRequest)?;
        if let EntityPayload::Note(ref mut note) = built {
            note.content_hash = Self::content_hash(&note.content);
        }

        // Parent integrity on pointer changes
        if let Some(parent_field) = kind.parent_field() {
            if changes.contains_key(parent_field) {
                self.check_parent(user_id, kind, &built)?;
                if kind == EntityKind::Folder {
                    if let EntityPayload::Folder(ref folder) = built {
                        if let Some(parent_id) = folder.parent_id {
                            if self.would_create_cycle(user_id, id, parent_id)? {
                                return Err(AppError::InvariantViolation(format!(
                                    "folder {} would become its own ancestor",
                                    id
                                )));
                            }
                        }
                    }
                }
            }
        }

        // CAS on the version the merge was derived from; a concurrent
        // writer surfaces as a version mismatch instead of a lost update.
        let new_version = current.version + 1;
        self.write_payload(user_id, kind, id, &built, new_version, Some(current.version), writer)?;

        let now = chrono::Utc::now().timestamp_millis();
        Ok(Entity {
            version: new_version,
            updated_at: now,
            deleted_at: None,
            modified_by: writer.to_string(),
            payload: built,
            ..current
        })
    }

    /// Overwrite an entity with a resolved payload at an explicit version.
    /// Only the sync pipeline calls this, after a successful resolution.
    pub fn apply_resolved(
        &self,
        user_id: i64,
        kind: EntityKind,
        id: i64,
        payload: Map<String, Value>,
        new_version: i64,
        writer: &str,
    ) -> Result<Entity> {
        let current = self
            .get(user_id, kind, id)?
            .ok_or_else(|| AppError::NotFound(format!("{} {}", kind.table_name(), id)))?;

        let mut built =
            EntityPayload::from_json_map(kind, payload).map_err(AppError::BadRequest)?;
        if let EntityPayload::Note(ref mut note) = built {
            note.content_hash = Self::content_hash(&note.content);
        }

        self.write_payload(user_id, kind, id, &built, new_version, None, writer)?;

        let now = chrono::Utc::now().timestamp_millis();
        Ok(Entity {
            version: new_version,
            updated_at: now,
            deleted_at: None,
            modified_by: writer.to_string(),
            payload: built,
            ..current
        })
    }

    /// Write a payload at the given version. With `guard_version`, the
    /// write only lands if the stored version still matches (CAS); a lost
    /// race reports VersionMismatch. Writing a payload always yields a
    /// live row; a resolution that keeps a tombstone never reaches this.
    fn write_payload(
        &self,
        user_id: i64,
        kind: EntityKind,
        id: i64,
        payload: &EntityPayload,
        version: i64,
        guard_version: Option<i64>,
        writer: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock().unwrap();
        let affected = match payload {
            EntityPayload::Note(note) => conn.execute(
                "UPDATE notes SET version = ?1, updated_at = ?2, modified_by = ?3,
                    deleted_at = NULL,
                    title = ?4, content = ?5, folder_id = ?6, pinned = ?7, content_hash = ?8
                 WHERE user_id = ?9 AND id = ?10 AND (?11 IS NULL OR version = ?11)",
                params![
                    version,
                    now,
                    writer,
                    note.title,
                    note.content,
                    note.folder_id,
                    note.pinned as i64,
                    note.content_hash,
                    user_id,
                    id,
                    guard_version,
                ],
            )?,
            EntityPayload::Folder(folder) => conn.execute(
                "UPDATE folders SET version = ?1, updated_at = ?2, modified_by = ?3,
                    deleted_at = NULL,
                    name = ?4, parent_id = ?5
                 WHERE user_id = ?6 AND id = ?7 AND (?8 IS NULL OR version = ?8)",
                params![
                    version,
                    now,
                    writer,
                    folder.name,
                    folder.parent_id,
                    user_id,
                    id,
                    guard_version,
                ],
            )?,
            EntityPayload::Review(review) => conn.execute(
                "UPDATE reviews SET version = ?1, updated_at = ?2, modified_by = ?3,
                    deleted_at = NULL,
                    date = ?4, content = ?5, mood = ?6,
                    achievements = ?7, improvements = ?8, plans = ?9
                 WHERE user_id = ?10 AND id = ?11 AND (?12 IS NULL OR version = ?12)",
                params![
                    version,
                    now,
                    writer,
                    review.date,
                    review.content,
                    review.mood,
                    serde_json::to_string(&review.achievements)?,
                    serde_json::to_string(&review.improvements)?,
                    serde_json::to_string(&review.plans)?,
                    user_id,
                    id,
                    guard_version,
                ],
            )?,
        };
        if affected == 0 {
            let sql = format!(
                "SELECT version FROM {} WHERE user_id = ?1 AND id = ?2",
                kind.table_name()
            );
            let actual: Option<i64> = conn
                .query_row(&sql, params![user_id, id], |row| row.get(0))
                .ok();
            drop(conn);
            return match (guard_version, actual) {
                (Some(expected), Some(actual)) => {
                    Err(AppError::VersionMismatch { expected, actual })
                }
                _ => Err(AppError::NotFound(format!("{} {}", kind.table_name(), id))),
            };
        }
        Ok(())
    }

    /// Soft-delete: set `deleted_at`, bump the version. The tombstone stays
    /// queryable so conflict detection can tell "deleted" from "never existed".
    pub fn soft_delete(
        &self,
        user_id: i64,
        kind: EntityKind,
        id: i64,
        writer: &str,
    ) -> Result<Entity> {
        let current = self
            .get(user_id, kind, id)?
            .ok_or_else(|| AppError::NotFound(format!("{} {}", kind.table_name(), id)))?;
        if current.is_deleted() {
            return Err(AppError::NotFound(format!(
                "{} {} is already deleted",
                kind.table_name(),
                id
            )));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let new_version = current.version + 1;
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "UPDATE {} SET deleted_at = ?1, updated_at = ?1, version = ?2, modified_by = ?3
             WHERE user_id = ?4 AND id = ?5",
            kind.table_name()
        );
        conn.execute(&sql, params![now, new_version, writer, user_id, id])?;
        drop(conn);

        debug!("Soft-deleted {} {} for user {}", kind.table_name(), id, user_id);

        Ok(Entity {
            version: new_version,
            updated_at: now,
            deleted_at: Some(now),
            modified_by: writer.to_string(),
            ..current
        })
    }

    /// Drop tombstones older than the given instant. Retention policy is a
    /// deployment concern; nothing schedules this by default.
    pub fn purge_tombstones(&self, kind: EntityKind, older_than: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "DELETE FROM {} WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
            kind.table_name()
        );
        let purged = conn.execute(&sql, params![older_than])?;
        if purged > 0 {
            info!("Purged {} {} tombstones", purged, kind.table_name());
        }
        Ok(purged)
    }
}
