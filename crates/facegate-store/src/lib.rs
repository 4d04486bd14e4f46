//! facegate-store — SQLite gallery of enrolled faces.
//!
//! One row per enrolled image. Rows are loaded as an ordered snapshot
//! (ascending id) that the verifier borrows for a session; edits made after
//! a snapshot is taken show up in the next one.

use chrono::{DateTime, Utc};
use facegate_core::{Embedding, GalleryRecord};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS face_images (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    path        TEXT NOT NULL,
    feature     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("record {id} has a malformed feature vector")]
    CorruptFeature { id: i64 },
    #[error("record {id} has a malformed timestamp: {value}")]
    CorruptTimestamp { id: i64, value: String },
}

/// Listing entry: record metadata without the embedding.
#[derive(Debug, Clone, Serialize)]
pub struct StoredFace {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub dimension: usize,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed gallery. Construct one explicitly and pass it where needed.
pub struct FaceStore {
    conn: Connection,
}

impl FaceStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "opened face store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Enroll one face image. Returns the new record id.
    pub fn insert(&self, name: &str, path: &str, embedding: &Embedding) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO face_images (name, path, feature, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                path,
                encode_feature(embedding.as_slice()),
                Utc::now().to_rfc3339()
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(id, name, dimension = embedding.len(), "enrolled face");
        Ok(id)
    }

    /// Every record, in ascending id order.
    pub fn load_all(&self) -> Result<Vec<GalleryRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, path, feature FROM face_images ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, name, path, feature) = row?;
            let values = decode_feature(&feature).ok_or(StoreError::CorruptFeature { id })?;
            records.push(GalleryRecord {
                id,
                name,
                path,
                embedding: Embedding::new(values),
            });
        }
        tracing::debug!(count = records.len(), "loaded gallery snapshot");
        Ok(records)
    }

    /// Record metadata, in ascending id order.
    pub fn list(&self) -> Result<Vec<StoredFace>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, path, feature, created_at FROM face_images ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut faces = Vec::new();
        for row in rows {
            let (id, name, path, feature, created_at) = row?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|_| StoreError::CorruptTimestamp {
                    id,
                    value: created_at.clone(),
                })?
                .with_timezone(&Utc);
            let dimension = decode_feature(&feature)
                .ok_or(StoreError::CorruptFeature { id })?
                .len();
            faces.push(StoredFace {
                id,
                name,
                path,
                dimension,
                created_at,
            });
        }
        Ok(faces)
    }

    /// Look up one record by id.
    pub fn get(&self, id: i64) -> Result<Option<GalleryRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT name, path, feature FROM face_images WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((name, path, feature)) = row else {
            return Ok(None);
        };
        let values = decode_feature(&feature).ok_or(StoreError::CorruptFeature { id })?;
        Ok(Some(GalleryRecord {
            id,
            name,
            path,
            embedding: Embedding::new(values),
        }))
    }

    /// Remove one record. Returns whether it existed.
    pub fn delete_one(&self, id: i64) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM face_images WHERE id = ?1", params![id])?;
        if n > 0 {
            tracing::info!(id, "removed face");
        }
        Ok(n > 0)
    }

    /// Remove every record. Returns how many were removed.
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let n = self.conn.execute("DELETE FROM face_images", [])?;
        tracing::info!(count = n, "cleared gallery");
        Ok(n)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM face_images", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

/// Serialize a feature vector as comma-separated decimals.
pub fn encode_feature(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a comma-separated feature vector. `None` if empty or malformed.
pub fn decode_feature(text: &str) -> Option<Vec<f32>> {
    if text.trim().is_empty() {
        return None;
    }
    text.split(',').map(|part| part.trim().parse().ok()).collect()
}
