//! Durable SQLite backend
//!
//! Persists to a single database file: per-document-type row and content
//! tables, per-structure contents tables, and key-value info tables. The
//! connection sits behind a `Mutex`; the database file's write lock
//! serializes physical transactions. Document backings are cached in core
//! per type; attachment content stays on disk and is read on demand.
//!
//! Layout:
//! - `Info` / `Internal` - string key-value (engine version under
//!   `Info["version"]`)
//! - `Documents(type, lastRevision)` - monotonic revision counters
//! - `"{Type}s"(id, documentID, revision, active)` plus
//!   `"{Type}Contents"(id, creationDate, modificationDate, json)` and
//!   `"{Type}Attachments"(id, attachmentID, documentID, revision, info,
//!   content)`
//! - `Collections` / `Indexes` / `Caches` registries plus
//!   `"Collection-{name}"`, `"Index-{name}"`, `"Cache-{name}"` contents
//! - `Associations` registry plus `"Associations-{name}"(fromID, toID)`

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::association::{AssociationAction, AssociationDef, AssociationItem, AssociationUpdate};
use crate::backing::{AttachmentRecord, DocumentBacking};
use crate::document::{new_opaque_id, universal_time_now, AttachmentInfo, UniversalTime};
use crate::error::{StorageError, StorageResult};
use crate::index::KeysInfo;
use crate::value::{dict_from_json, dict_to_json, Value, ValueDict};

use super::Backend;

/// Conservative bound on variables bound into one statement
const VARIABLE_LIMIT: usize = 999;

/// Durable realization of the persistence contract
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    /// In-core backings by external document id
    backings: RwLock<HashMap<String, Arc<DocumentBacking>>>,
    /// Document types whose backings are fully loaded into core
    loaded_types: RwLock<HashSet<String>>,
}

impl SqliteBackend {
    /// Open or create a database file
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let backend = Self {
            conn: Mutex::new(conn),
            backings: RwLock::new(HashMap::new()),
            loaded_types: RwLock::new(HashSet::new()),
        };
        backend.init_schema()?;
        info!("opened durable store");
        Ok(backend)
    }

    /// In-memory database, for tests
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let backend = Self {
            conn: Mutex::new(conn),
            backings: RwLock::new(HashMap::new()),
            loaded_types: RwLock::new(HashSet::new()),
        };
        backend.init_schema()?;
        Ok(backend)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS Info (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS Internal (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS Documents (
                type TEXT UNIQUE NOT NULL,
                lastRevision INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS Collections (
                name TEXT UNIQUE NOT NULL,
                version INTEGER NOT NULL,
                lastRevision INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS Indexes (
                name TEXT UNIQUE NOT NULL,
                version INTEGER NOT NULL,
                lastRevision INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS Caches (
                name TEXT UNIQUE NOT NULL,
                declaration BLOB NOT NULL,
                lastRevision INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS Associations (
                name TEXT UNIQUE NOT NULL,
                fromType TEXT NOT NULL,
                toType TEXT NOT NULL
            );
            INSERT OR IGNORE INTO Info (key, value) VALUES ('version', '1');
            "#,
        )?;
        Ok(())
    }

    fn ensure_document_type(&self, conn: &Connection, document_type: &str) -> StorageResult<()> {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO Documents (type, lastRevision) VALUES (?1, 0)",
            params![document_type],
        )?;
        if inserted > 0 {
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {rows} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    documentID TEXT UNIQUE NOT NULL,
                    revision INTEGER NOT NULL,
                    active INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS {contents} (
                    id INTEGER PRIMARY KEY,
                    creationDate TEXT NOT NULL,
                    modificationDate TEXT NOT NULL,
                    json BLOB NOT NULL
                );
                CREATE TABLE IF NOT EXISTS {attachments} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    attachmentID TEXT UNIQUE NOT NULL,
                    documentID INTEGER NOT NULL,
                    revision INTEGER NOT NULL,
                    info BLOB NOT NULL,
                    content BLOB NOT NULL
                );
                CREATE INDEX IF NOT EXISTS {attachments_index}
                    ON {attachments} (documentID);
                "#,
                rows = rows_table(document_type),
                contents = contents_table(document_type),
                attachments = attachments_table(document_type),
                attachments_index = quoted(&format!("{}AttachmentsByDocument", document_type)),
            ))?;
            debug!("created tables for document type {}", document_type);
        }
        Ok(())
    }

    fn document_type_known(&self, conn: &Connection, document_type: &str) -> StorageResult<bool> {
        let known: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM Documents WHERE type = ?1",
                params![document_type],
                |row| row.get(0),
            )
            .optional()?;
        Ok(known.is_some())
    }

    /// Load one backing row (with its attachment infos) from disk
    fn load_backing(
        &self,
        conn: &Connection,
        document_type: &str,
        document_id: &str,
    ) -> StorageResult<Option<Arc<DocumentBacking>>> {
        if !self.document_type_known(conn, document_type)? {
            return Ok(None);
        }

        let row = conn
            .query_row(
                &format!(
                    "SELECT s.id, s.revision, s.active, c.creationDate, c.modificationDate, c.json
                     FROM {rows} s JOIN {contents} c ON c.id = s.id
                     WHERE s.documentID = ?1",
                    rows = rows_table(document_type),
                    contents = contents_table(document_type),
                ),
                params![document_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, i64>(2)? == 1,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((internal_id, revision, active, creation, modification, json)) = row else {
            return Ok(None);
        };

        let property_map = dict_from_json(&serde_json::from_slice(&json)?)?;
        let mut attachments = HashMap::new();
        let mut statement = conn.prepare(&format!(
            "SELECT attachmentID, revision, info FROM {attachments} WHERE documentID = ?1",
            attachments = attachments_table(document_type),
        ))?;
        let rows = statement.query_map(params![internal_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;
        for row in rows {
            let (attachment_id, attachment_revision, info_json) = row?;
            attachments.insert(
                attachment_id.clone(),
                AttachmentRecord {
                    info: AttachmentInfo {
                        id: attachment_id,
                        revision: attachment_revision,
                        info: dict_from_json(&serde_json::from_slice(&info_json)?)?,
                    },
                    content: None,
                },
            );
        }

        let backing = Arc::new(DocumentBacking::restored(
            internal_id,
            document_id.to_string(),
            document_type.to_string(),
            revision,
            active,
            from_rfc3339(&creation)?,
            from_rfc3339(&modification)?,
            property_map,
            attachments,
        ));
        Ok(Some(backing))
    }

    /// Make sure every backing of a type is in core.
    /// Lock order is the backings map before the connection, everywhere.
    fn load_type(&self, document_type: &str) -> StorageResult<()> {
        if self.loaded_types.read().unwrap().contains(document_type) {
            return Ok(());
        }

        let mut backings = self.backings.write().unwrap();
        let conn = self.conn.lock().unwrap();
        if !self.document_type_known(&conn, document_type)? {
            return Ok(());
        }

        let document_ids: Vec<String> = {
            let mut statement = conn.prepare(&format!(
                "SELECT documentID FROM {rows}",
                rows = rows_table(document_type)
            ))?;
            let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };

        for document_id in document_ids {
            if !backings.contains_key(&document_id) {
                if let Some(backing) = self.load_backing(&conn, document_type, &document_id)? {
                    backings.insert(document_id, backing);
                }
            }
        }
        self.loaded_types
            .write()
            .unwrap()
            .insert(document_type.to_string());
        Ok(())
    }

    /// Bump the document row and content after a content-changing write
    fn persist_document_row(
        &self,
        conn: &Connection,
        backing: &DocumentBacking,
        revision: u32,
        modification_time: UniversalTime,
    ) -> StorageResult<()> {
        conn.execute(
            &format!(
                "UPDATE {rows} SET revision = ?1 WHERE id = ?2",
                rows = rows_table(&backing.document_type)
            ),
            params![revision, backing.internal_id],
        )?;
        conn.execute(
            &format!(
                "UPDATE {contents} SET modificationDate = ?1 WHERE id = ?2",
                contents = contents_table(&backing.document_type)
            ),
            params![to_rfc3339(modification_time), backing.internal_id],
        )?;
        Ok(())
    }
}

impl Backend for SqliteBackend {
    fn variable_limit(&self) -> usize {
        VARIABLE_LIMIT
    }

    fn write_batch(&self, f: &mut dyn FnMut() -> StorageResult<()>) -> StorageResult<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        let result = f();
        let conn = self.conn.lock().unwrap();
        match &result {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(_) => {
                // Keep the successfully applied prefix; in-core state has
                // already advanced with it
                let _ = conn.execute_batch("COMMIT");
            }
        }
        result
    }

    fn info_get(&self, keys: &[&str]) -> StorageResult<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut result = HashMap::new();
        let mut statement = conn.prepare("SELECT value FROM Info WHERE key = ?1")?;
        for key in keys {
            if let Some(value) = statement
                .query_row(params![key], |row| row.get::<_, String>(0))
                .optional()?
            {
                result.insert(key.to_string(), value);
            }
        }
        Ok(result)
    }

    fn info_set(&self, info: &HashMap<String, String>) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let mut statement =
            conn.prepare("INSERT OR REPLACE INTO Info (key, value) VALUES (?1, ?2)")?;
        for (key, value) in info {
            statement.execute(params![key, value])?;
        }
        Ok(())
    }

    fn info_remove(&self, keys: &[&str]) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare("DELETE FROM Info WHERE key = ?1")?;
        for key in keys {
            statement.execute(params![key])?;
        }
        Ok(())
    }

    fn internal_get(&self, keys: &[&str]) -> StorageResult<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut result = HashMap::new();
        let mut statement = conn.prepare("SELECT value FROM Internal WHERE key = ?1")?;
        for key in keys {
            if let Some(value) = statement
                .query_row(params![key], |row| row.get::<_, String>(0))
                .optional()?
            {
                result.insert(key.to_string(), value);
            }
        }
        Ok(result)
    }

    fn internal_set(&self, info: &HashMap<String, String>) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let mut statement =
            conn.prepare("INSERT OR REPLACE INTO Internal (key, value) VALUES (?1, ?2)")?;
        for (key, value) in info {
            statement.execute(params![key, value])?;
        }
        Ok(())
    }

    fn next_revision(&self, document_type: &str) -> StorageResult<u32> {
        let conn = self.conn.lock().unwrap();
        self.ensure_document_type(&conn, document_type)?;
        conn.execute(
            "UPDATE Documents SET lastRevision = lastRevision + 1 WHERE type = ?1",
            params![document_type],
        )?;
        let revision: u32 = conn.query_row(
            "SELECT lastRevision FROM Documents WHERE type = ?1",
            params![document_type],
            |row| row.get(0),
        )?;
        Ok(revision)
    }

    fn last_revision(&self, document_type: &str) -> StorageResult<u32> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT lastRevision FROM Documents WHERE type = ?1",
                params![document_type],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0))
    }

    fn document_types(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare("SELECT type FROM Documents")?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn document_create(
        &self,
        document_type: &str,
        document_id: &str,
        creation_time: UniversalTime,
        modification_time: UniversalTime,
        property_map: &ValueDict,
    ) -> StorageResult<Arc<DocumentBacking>> {
        let mut backings = self.backings.write().unwrap();
        if backings.contains_key(document_id) {
            return Err(StorageError::BackendIo(format!(
                "document ID already in use: {}",
                document_id
            )));
        }

        let conn = self.conn.lock().unwrap();
        self.ensure_document_type(&conn, document_type)?;

        // External ids are unique across every document type
        let known_types: Vec<String> = {
            let mut statement = conn.prepare("SELECT type FROM Documents")?;
            let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for known_type in known_types {
            let exists: Option<i64> = conn
                .query_row(
                    &format!(
                        "SELECT 1 FROM {rows} WHERE documentID = ?1",
                        rows = rows_table(&known_type)
                    ),
                    params![document_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StorageError::BackendIo(format!(
                    "document ID already in use: {}",
                    document_id
                )));
            }
        }

        conn.execute(
            "UPDATE Documents SET lastRevision = lastRevision + 1 WHERE type = ?1",
            params![document_type],
        )?;
        let revision: u32 = conn.query_row(
            "SELECT lastRevision FROM Documents WHERE type = ?1",
            params![document_type],
            |row| row.get(0),
        )?;

        conn.execute(
            &format!(
                "INSERT INTO {rows} (documentID, revision, active) VALUES (?1, ?2, 1)",
                rows = rows_table(document_type)
            ),
            params![document_id, revision],
        )?;
        let internal_id = conn.last_insert_rowid();
        conn.execute(
            &format!(
                "INSERT INTO {contents} (id, creationDate, modificationDate, json)
                 VALUES (?1, ?2, ?3, ?4)",
                contents = contents_table(document_type)
            ),
            params![
                internal_id,
                to_rfc3339(creation_time),
                to_rfc3339(modification_time),
                serde_json::to_vec(&dict_to_json(property_map))?,
            ],
        )?;

        let backing = Arc::new(DocumentBacking::new(
            internal_id,
            document_id.to_string(),
            document_type.to_string(),
            revision,
            creation_time,
            modification_time,
            property_map.clone(),
        ));
        backings.insert(document_id.to_string(), Arc::clone(&backing));
        Ok(backing)
    }

    fn document_backing(
        &self,
        document_type: &str,
        document_id: &str,
    ) -> StorageResult<Option<Arc<DocumentBacking>>> {
        if let Some(backing) = self.backings.read().unwrap().get(document_id) {
            if backing.document_type == document_type {
                return Ok(Some(Arc::clone(backing)));
            }
            return Ok(None);
        }

        let mut backings = self.backings.write().unwrap();
        // Another thread may have loaded it while we waited for the lock
        if let Some(backing) = backings.get(document_id) {
            if backing.document_type == document_type {
                return Ok(Some(Arc::clone(backing)));
            }
            return Ok(None);
        }
        let conn = self.conn.lock().unwrap();
        match self.load_backing(&conn, document_type, document_id)? {
            Some(backing) => {
                backings.insert(document_id.to_string(), Arc::clone(&backing));
                Ok(Some(backing))
            }
            None => Ok(None),
        }
    }

    fn document_backings_by_ids(
        &self,
        document_type: &str,
        document_ids: &[String],
    ) -> StorageResult<Vec<Arc<DocumentBacking>>> {
        document_ids
            .iter()
            .map(|document_id| {
                self.document_backing(document_type, document_id)?
                    .ok_or_else(|| StorageError::UnknownDocumentId(document_id.clone()))
            })
            .collect()
    }

    fn document_backings_by_internal_ids(
        &self,
        document_type: &str,
        internal_ids: &[i64],
    ) -> StorageResult<Vec<Arc<DocumentBacking>>> {
        self.load_type(document_type)?;
        let wanted: HashSet<i64> = internal_ids.iter().copied().collect();
        Ok(self
            .backings
            .read()
            .unwrap()
            .values()
            .filter(|backing| {
                backing.document_type == document_type && wanted.contains(&backing.internal_id)
            })
            .cloned()
            .collect())
    }

    fn document_backings(
        &self,
        document_type: &str,
        active_only: bool,
    ) -> StorageResult<Vec<Arc<DocumentBacking>>> {
        self.load_type(document_type)?;
        let mut backings: Vec<Arc<DocumentBacking>> = self
            .backings
            .read()
            .unwrap()
            .values()
            .filter(|backing| {
                backing.document_type == document_type && (!active_only || backing.is_active())
            })
            .cloned()
            .collect();
        backings.sort_by_key(|backing| backing.internal_id);
        Ok(backings)
    }

    fn document_backings_since_revision(
        &self,
        document_type: &str,
        since_revision: u32,
        count: Option<usize>,
    ) -> StorageResult<Vec<Arc<DocumentBacking>>> {
        let mut backings = self.document_backings(document_type, false)?;
        backings.retain(|backing| backing.revision() > since_revision);
        backings.sort_by_key(|backing| backing.revision());
        if let Some(count) = count {
            backings.truncate(count);
        }
        Ok(backings)
    }

    fn document_count(&self, document_type: &str) -> StorageResult<u64> {
        let conn = self.conn.lock().unwrap();
        if !self.document_type_known(&conn, document_type)? {
            return Ok(0);
        }
        Ok(conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {rows} WHERE active = 1",
                rows = rows_table(document_type)
            ),
            [],
            |row| row.get::<_, i64>(0),
        )? as u64)
    }

    fn document_update(
        &self,
        backing: &DocumentBacking,
        updated: &ValueDict,
        removed: &HashSet<String>,
    ) -> StorageResult<()> {
        self.document_update_at(backing, updated, removed, universal_time_now())
    }

    fn document_update_at(
        &self,
        backing: &DocumentBacking,
        updated: &ValueDict,
        removed: &HashSet<String>,
        modification_time: UniversalTime,
    ) -> StorageResult<()> {
        let revision = self.next_revision(&backing.document_type)?;
        backing.update(
            updated,
            removed,
            Some((revision, modification_time)),
            |merged| {
                let conn = self.conn.lock().unwrap();
                conn.execute(
                    &format!(
                        "UPDATE {rows} SET revision = ?1 WHERE id = ?2",
                        rows = rows_table(&backing.document_type)
                    ),
                    params![revision, backing.internal_id],
                )?;
                conn.execute(
                    &format!(
                        "UPDATE {contents} SET modificationDate = ?1, json = ?2 WHERE id = ?3",
                        contents = contents_table(&backing.document_type)
                    ),
                    params![
                        to_rfc3339(modification_time),
                        serde_json::to_vec(&dict_to_json(merged))?,
                        backing.internal_id,
                    ],
                )?;
                Ok(())
            },
        )
    }

    fn document_remove(&self, backing: &DocumentBacking) -> StorageResult<()> {
        let revision = self.next_revision(&backing.document_type)?;
        let modification_time = universal_time_now();
        backing.tombstone(revision, modification_time, || {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                &format!(
                    "UPDATE {rows} SET revision = ?1, active = 0 WHERE id = ?2",
                    rows = rows_table(&backing.document_type)
                ),
                params![revision, backing.internal_id],
            )?;
            conn.execute(
                &format!(
                    "UPDATE {contents} SET modificationDate = ?1 WHERE id = ?2",
                    contents = contents_table(&backing.document_type)
                ),
                params![to_rfc3339(modification_time), backing.internal_id],
            )?;
            Ok(())
        })
    }

    fn attachment_add(
        &self,
        backing: &DocumentBacking,
        attachment_id: Option<&str>,
        info: &ValueDict,
        content: &[u8],
    ) -> StorageResult<AttachmentInfo> {
        let record = AttachmentRecord {
            info: AttachmentInfo {
                id: attachment_id
                    .map(str::to_string)
                    .unwrap_or_else(new_opaque_id),
                revision: 1,
                info: info.clone(),
            },
            content: None,
        };
        let revision = self.next_revision(&backing.document_type)?;
        let modification_time = universal_time_now();
        backing.attachment_add(record, revision, modification_time, |record| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                &format!(
                    "INSERT INTO {attachments} (attachmentID, documentID, revision, info, content)
                     VALUES (?1, ?2, 1, ?3, ?4)",
                    attachments = attachments_table(&backing.document_type)
                ),
                params![
                    record.info.id,
                    backing.internal_id,
                    serde_json::to_vec(&dict_to_json(&record.info.info))?,
                    content,
                ],
            )?;
            self.persist_document_row(&conn, backing, revision, modification_time)
        })
    }

    fn attachment_content(
        &self,
        backing: &DocumentBacking,
        attachment_id: &str,
    ) -> StorageResult<Vec<u8>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT content FROM {attachments} WHERE attachmentID = ?1 AND documentID = ?2",
                attachments = attachments_table(&backing.document_type)
            ),
            params![attachment_id, backing.internal_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StorageError::UnknownAttachmentId(attachment_id.to_string()))
    }

    fn attachment_update(
        &self,
        backing: &DocumentBacking,
        attachment_id: &str,
        info: &ValueDict,
        content: &[u8],
    ) -> StorageResult<u32> {
        let revision = self.next_revision(&backing.document_type)?;
        let modification_time = universal_time_now();
        backing.attachment_update(
            attachment_id,
            info.clone(),
            None,
            revision,
            modification_time,
            |attachment_revision| {
                let conn = self.conn.lock().unwrap();
                conn.execute(
                    &format!(
                        "UPDATE {attachments} SET revision = ?1, info = ?2, content = ?3
                         WHERE attachmentID = ?4 AND documentID = ?5",
                        attachments = attachments_table(&backing.document_type)
                    ),
                    params![
                        attachment_revision,
                        serde_json::to_vec(&dict_to_json(info))?,
                        content,
                        attachment_id,
                        backing.internal_id,
                    ],
                )?;
                self.persist_document_row(&conn, backing, revision, modification_time)
            },
        )
    }

    fn attachment_remove(
        &self,
        backing: &DocumentBacking,
        attachment_id: &str,
    ) -> StorageResult<()> {
        let revision = self.next_revision(&backing.document_type)?;
        let modification_time = universal_time_now();
        backing.attachment_remove(attachment_id, revision, modification_time, || {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                &format!(
                    "DELETE FROM {attachments} WHERE attachmentID = ?1 AND documentID = ?2",
                    attachments = attachments_table(&backing.document_type)
                ),
                params![attachment_id, backing.internal_id],
            )?;
            self.persist_document_row(&conn, backing, revision, modification_time)
        })
    }

    fn association_register(&self, def: &AssociationDef) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO Associations (name, fromType, toType) VALUES (?1, ?2, ?3)",
            params![def.name, def.from_document_type, def.to_document_type],
        )?;
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {pairs} (
                fromID TEXT NOT NULL,
                toID TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {pair_index} ON {pairs} (fromID, toID);
            CREATE INDEX IF NOT EXISTS {to_index} ON {pairs} (toID);
            "#,
            pairs = association_table(&def.name),
            pair_index = quoted(&format!("Associations-{}-pair", def.name)),
            to_index = quoted(&format!("Associations-{}-to", def.name)),
        ))?;
        Ok(())
    }

    fn association_def(&self, name: &str) -> StorageResult<Option<AssociationDef>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT fromType, toType FROM Associations WHERE name = ?1",
                params![name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
            .map(|(from_document_type, to_document_type)| AssociationDef {
                name: name.to_string(),
                from_document_type,
                to_document_type,
            }))
    }

    fn association_items(&self, name: &str) -> StorageResult<Vec<AssociationItem>> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(&format!(
            "SELECT fromID, toID FROM {pairs}",
            pairs = association_table(name)
        ))?;
        let rows = statement.query_map([], |row| {
            Ok(AssociationItem {
                from_document_id: row.get(0)?,
                to_document_id: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn association_update(
        &self,
        name: &str,
        updates: &[AssociationUpdate],
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let mut insert = conn.prepare(&format!(
            "INSERT OR IGNORE INTO {pairs} (fromID, toID) VALUES (?1, ?2)",
            pairs = association_table(name)
        ))?;
        let mut delete = conn.prepare(&format!(
            "DELETE FROM {pairs} WHERE fromID = ?1 AND toID = ?2",
            pairs = association_table(name)
        ))?;
        for update in updates {
            match update.action {
                AssociationAction::Add => {
                    insert.execute(params![
                        update.item.from_document_id,
                        update.item.to_document_id
                    ])?;
                }
                AssociationAction::Remove => {
                    delete.execute(params![
                        update.item.from_document_id,
                        update.item.to_document_id
                    ])?;
                }
            }
        }
        Ok(())
    }

    fn association_to_ids(&self, name: &str, from_document_id: &str) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(&format!(
            "SELECT toID FROM {pairs} WHERE fromID = ?1",
            pairs = association_table(name)
        ))?;
        let rows = statement.query_map(params![from_document_id], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn association_from_ids(&self, name: &str, to_document_id: &str) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(&format!(
            "SELECT fromID FROM {pairs} WHERE toID = ?1",
            pairs = association_table(name)
        ))?;
        let rows = statement.query_map(params![to_document_id], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn collection_register(
        &self,
        name: &str,
        document_type: &str,
        version: u32,
        is_up_to_date: bool,
    ) -> StorageResult<u32> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<(u32, u32)> = conn
            .query_row(
                "SELECT version, lastRevision FROM Collections WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((stored_version, last_revision)) if stored_version == version => Ok(last_revision),
            Some(_) => {
                conn.execute(
                    &format!(
                        "DELETE FROM {contents}",
                        contents = collection_table(name)
                    ),
                    [],
                )?;
                conn.execute(
                    "UPDATE Collections SET version = ?1, lastRevision = 0 WHERE name = ?2",
                    params![version, name],
                )?;
                Ok(0)
            }
            None => {
                self.ensure_document_type(&conn, document_type)?;
                let last_revision = if is_up_to_date {
                    conn.query_row(
                        "SELECT lastRevision FROM Documents WHERE type = ?1",
                        params![document_type],
                        |row| row.get(0),
                    )?
                } else {
                    0
                };
                conn.execute(
                    "INSERT INTO Collections (name, version, lastRevision) VALUES (?1, ?2, ?3)",
                    params![name, version, last_revision],
                )?;
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {contents} (id INTEGER PRIMARY KEY)",
                    contents = collection_table(name)
                ))?;
                Ok(last_revision)
            }
        }
    }

    fn collection_update(
        &self,
        name: &str,
        included_ids: &[i64],
        not_included_ids: &[i64],
        last_revision: Option<u32>,
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        for chunk in not_included_ids.chunks(VARIABLE_LIMIT) {
            conn.execute(
                &format!(
                    "DELETE FROM {contents} WHERE id IN ({placeholders})",
                    contents = collection_table(name),
                    placeholders = placeholders(chunk.len()),
                ),
                params_from_iter(chunk.iter()),
            )?;
        }
        {
            let mut insert = conn.prepare(&format!(
                "INSERT OR IGNORE INTO {contents} (id) VALUES (?1)",
                contents = collection_table(name)
            ))?;
            for id in included_ids {
                insert.execute(params![id])?;
            }
        }
        if let Some(last_revision) = last_revision {
            conn.execute(
                "UPDATE Collections SET lastRevision = ?1 WHERE name = ?2 AND lastRevision < ?1",
                params![last_revision, name],
            )?;
        }
        Ok(())
    }

    fn collection_remove_ids(&self, name: &str, internal_ids: &[i64]) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        for chunk in internal_ids.chunks(VARIABLE_LIMIT) {
            conn.execute(
                &format!(
                    "DELETE FROM {contents} WHERE id IN ({placeholders})",
                    contents = collection_table(name),
                    placeholders = placeholders(chunk.len()),
                ),
                params_from_iter(chunk.iter()),
            )?;
        }
        Ok(())
    }

    fn collection_ids(&self, name: &str) -> StorageResult<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(&format!(
            "SELECT id FROM {contents} ORDER BY id",
            contents = collection_table(name)
        ))?;
        let rows = statement.query_map([], |row| row.get::<_, i64>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn collection_count(&self, name: &str) -> StorageResult<u64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {contents}",
                contents = collection_table(name)
            ),
            [],
            |row| row.get::<_, i64>(0),
        )? as u64)
    }

    fn index_register(
        &self,
        name: &str,
        document_type: &str,
        version: u32,
    ) -> StorageResult<u32> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<(u32, u32)> = conn
            .query_row(
                "SELECT version, lastRevision FROM Indexes WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((stored_version, last_revision)) if stored_version == version => Ok(last_revision),
            Some(_) => {
                conn.execute(
                    &format!("DELETE FROM {contents}", contents = index_table(name)),
                    [],
                )?;
                conn.execute(
                    "UPDATE Indexes SET version = ?1, lastRevision = 0 WHERE name = ?2",
                    params![version, name],
                )?;
                Ok(0)
            }
            None => {
                self.ensure_document_type(&conn, document_type)?;
                conn.execute(
                    "INSERT INTO Indexes (name, version, lastRevision) VALUES (?1, ?2, 0)",
                    params![name, version],
                )?;
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {contents} (key TEXT PRIMARY KEY NOT NULL, id INTEGER NOT NULL)",
                    contents = index_table(name)
                ))?;
                Ok(0)
            }
        }
    }

    fn index_update(
        &self,
        name: &str,
        keys_infos: &[KeysInfo],
        last_revision: Option<u32>,
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated_ids: Vec<i64> = keys_infos.iter().map(|info| info.internal_id).collect();
        for chunk in updated_ids.chunks(VARIABLE_LIMIT) {
            conn.execute(
                &format!(
                    "DELETE FROM {contents} WHERE id IN ({placeholders})",
                    contents = index_table(name),
                    placeholders = placeholders(chunk.len()),
                ),
                params_from_iter(chunk.iter()),
            )?;
        }
        {
            let mut insert = conn.prepare(&format!(
                "INSERT OR REPLACE INTO {contents} (key, id) VALUES (?1, ?2)",
                contents = index_table(name)
            ))?;
            for keys_info in keys_infos {
                for key in &keys_info.keys {
                    insert.execute(params![key, keys_info.internal_id])?;
                }
            }
        }
        if let Some(last_revision) = last_revision {
            conn.execute(
                "UPDATE Indexes SET lastRevision = ?1 WHERE name = ?2 AND lastRevision < ?1",
                params![last_revision, name],
            )?;
        }
        Ok(())
    }

    fn index_remove_ids(&self, name: &str, internal_ids: &[i64]) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        for chunk in internal_ids.chunks(VARIABLE_LIMIT) {
            conn.execute(
                &format!(
                    "DELETE FROM {contents} WHERE id IN ({placeholders})",
                    contents = index_table(name),
                    placeholders = placeholders(chunk.len()),
                ),
                params_from_iter(chunk.iter()),
            )?;
        }
        Ok(())
    }

    fn index_get(&self, name: &str, keys: &[String]) -> StorageResult<HashMap<String, i64>> {
        let conn = self.conn.lock().unwrap();
        let mut result = HashMap::new();
        let mut statement = conn.prepare(&format!(
            "SELECT id FROM {contents} WHERE key = ?1",
            contents = index_table(name)
        ))?;
        for key in keys {
            if let Some(id) = statement
                .query_row(params![key], |row| row.get::<_, i64>(0))
                .optional()?
            {
                result.insert(key.clone(), id);
            }
        }
        Ok(result)
    }

    fn cache_register(
        &self,
        name: &str,
        document_type: &str,
        declaration: &str,
        value_names: &[String],
    ) -> StorageResult<u32> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<(Vec<u8>, u32)> = conn
            .query_row(
                "SELECT declaration, lastRevision FROM Caches WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((stored_declaration, last_revision)) = existing {
            if stored_declaration == declaration.as_bytes() {
                return Ok(last_revision);
            }
            // Declaration changed: rebuild from scratch with new columns
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {contents}",
                contents = cache_table(name)
            ))?;
            conn.execute(
                "UPDATE Caches SET declaration = ?1, lastRevision = 0 WHERE name = ?2",
                params![declaration.as_bytes(), name],
            )?;
        } else {
            self.ensure_document_type(&conn, document_type)?;
            conn.execute(
                "INSERT INTO Caches (name, declaration, lastRevision) VALUES (?1, ?2, 0)",
                params![name, declaration.as_bytes()],
            )?;
        }

        let columns: Vec<String> = value_names
            .iter()
            .map(|value_name| format!("{} INTEGER", quoted(value_name)))
            .collect();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {contents} (id INTEGER PRIMARY KEY{separator}{columns})",
            contents = cache_table(name),
            separator = if columns.is_empty() { "" } else { ", " },
            columns = columns.join(", "),
        ))?;
        Ok(0)
    }

    fn cache_update(
        &self,
        name: &str,
        values_by_id: &[(i64, ValueDict)],
        last_revision: Option<u32>,
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        for (internal_id, values) in values_by_id {
            let mut names: Vec<&String> = values.keys().collect();
            names.sort();
            let columns: Vec<String> = names.iter().map(|name| quoted(name)).collect();
            let mut bound: Vec<i64> = vec![*internal_id];
            for value_name in &names {
                bound.push(values[*value_name].coerce_i64()?);
            }
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {contents} (id{separator}{columns})
                     VALUES ({placeholders})",
                    contents = cache_table(name),
                    separator = if columns.is_empty() { "" } else { ", " },
                    columns = columns.join(", "),
                    placeholders = placeholders(bound.len()),
                ),
                params_from_iter(bound.iter()),
            )?;
        }
        if let Some(last_revision) = last_revision {
            conn.execute(
                "UPDATE Caches SET lastRevision = ?1 WHERE name = ?2 AND lastRevision < ?1",
                params![last_revision, name],
            )?;
        }
        Ok(())
    }

    fn cache_remove_ids(&self, name: &str, internal_ids: &[i64]) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        for chunk in internal_ids.chunks(VARIABLE_LIMIT) {
            conn.execute(
                &format!(
                    "DELETE FROM {contents} WHERE id IN ({placeholders})",
                    contents = cache_table(name),
                    placeholders = placeholders(chunk.len()),
                ),
                params_from_iter(chunk.iter()),
            )?;
        }
        Ok(())
    }

    fn cache_rows(
        &self,
        name: &str,
        internal_ids: &[i64],
    ) -> StorageResult<HashMap<i64, ValueDict>> {
        let conn = self.conn.lock().unwrap();
        let column_names: Vec<String> = {
            let statement = conn.prepare(&format!(
                "SELECT * FROM {contents} LIMIT 0",
                contents = cache_table(name)
            ))?;
            statement
                .column_names()
                .iter()
                .map(|column| column.to_string())
                .collect()
        };

        let mut result = HashMap::new();
        for chunk in internal_ids.chunks(VARIABLE_LIMIT) {
            let mut statement = conn.prepare(&format!(
                "SELECT * FROM {contents} WHERE id IN ({placeholders})",
                contents = cache_table(name),
                placeholders = placeholders(chunk.len()),
            ))?;
            let mut rows = statement.query(params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                let internal_id: i64 = row.get(0)?;
                let mut values = ValueDict::new();
                for (column_index, column_name) in column_names.iter().enumerate().skip(1) {
                    if let Some(value) = row.get::<_, Option<i64>>(column_index)? {
                        values.insert(column_name.clone(), Value::I64(value));
                    }
                }
                result.insert(internal_id, values);
            }
        }
        Ok(result)
    }
}

// ---- naming and encoding helpers ----

/// Double-quote an identifier, escaping embedded quotes
fn quoted(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn rows_table(document_type: &str) -> String {
    quoted(&format!("{}s", document_type))
}

fn contents_table(document_type: &str) -> String {
    quoted(&format!("{}Contents", document_type))
}

fn attachments_table(document_type: &str) -> String {
    quoted(&format!("{}Attachments", document_type))
}

fn collection_table(name: &str) -> String {
    quoted(&format!("Collection-{}", name))
}

fn index_table(name: &str) -> String {
    quoted(&format!("Index-{}", name))
}

fn cache_table(name: &str) -> String {
    quoted(&format!("Cache-{}", name))
}

fn association_table(name: &str) -> String {
    quoted(&format!("Associations-{}", name))
}

fn placeholders(count: usize) -> String {
    let mut result = String::with_capacity(count * 2);
    for index in 0..count {
        if index > 0 {
            result.push(',');
        }
        result.push('?');
    }
    result
}

/// RFC-3339 extended rendering of a universal time
fn to_rfc3339(time: UniversalTime) -> String {
    DateTime::<Utc>::from_timestamp_micros((time * 1_000_000.0) as i64)
        .unwrap_or(DateTime::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_rfc3339(text: &str) -> StorageResult<UniversalTime> {
    let parsed = DateTime::parse_from_rfc3339(text)
        .map_err(|e| StorageError::SerializationFailure(format!("bad date {}: {}", text, e)))?;
    Ok(parsed.with_timezone(&Utc).timestamp_micros() as f64 / 1_000_000.0)
}
