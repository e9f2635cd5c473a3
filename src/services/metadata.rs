//! File/version metadata in SQLite.
//!
//! The storage core only needs three things from metadata: register a new
//! file together with its first version, append a later version, and resolve
//! the current version of a file for a given requester. Visibility (owner,
//! admin, or explicit permission) is decided here, and a file that is
//! missing, deleted or invisible all look the same to the caller.

use crate::models::{
    file::{FileRecord, FileVersion},
    requester::Requester,
    stored_object::StoredObject,
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

const FILE_COLUMNS: &str = "id, owner_id, folder_id, name, mime_type, size_bytes, \
     current_version_id, is_deleted, created_at, updated_at";
const VERSION_COLUMNS: &str =
    "id, file_id, storage_key, version_number, checksum, size_bytes, created_at";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("file not found")]
    FileNotFound,
    #[error("file `{0}` has no current version")]
    MissingVersion(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Fields of a new file supplied by the upload path.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub owner_id: String,
    pub folder_id: Option<String>,
    pub name: String,
    pub mime_type: Option<String>,
}

#[derive(Clone)]
pub struct MetadataStore {
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> MetadataResult<()> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Insert the file row and version 1, then point the file at it, in one
    /// transaction. Either all three writes land or none do.
    pub async fn create_file_with_version(
        &self,
        new_file: NewFile,
        stored: &StoredObject,
    ) -> MetadataResult<(FileRecord, FileVersion)> {
        let now = Utc::now();
        let file_id = Uuid::new_v4();
        let version_id = Uuid::new_v4();
        let size_bytes = stored.size_bytes as i64;

        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO files (id, owner_id, folder_id, name, mime_type, size_bytes,
                                current_version_id, is_deleted, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, NULL, 0, ?, ?)",
        )
        .bind(file_id)
        .bind(&new_file.owner_id)
        .bind(&new_file.folder_id)
        .bind(&new_file.name)
        .bind(&new_file.mime_type)
        .bind(size_bytes)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let version = insert_version(&mut tx, version_id, file_id, 1, stored).await?;

        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET current_version_id = ?, updated_at = ?
             WHERE id = ?
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(version.id)
        .bind(now)
        .bind(file_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(file_id = %file.id, key = %version.storage_key, "registered new file");
        Ok((file, version))
    }

    /// Add the next version of an existing file and make it current.
    ///
    /// Only the owner or an admin may add versions; anyone else gets
    /// `FileNotFound`.
    pub async fn append_version(
        &self,
        file_id: Uuid,
        requester: &Requester,
        stored: &StoredObject,
    ) -> MetadataResult<(FileRecord, FileVersion)> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let owned: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM files
             WHERE id = ? AND is_deleted = 0 AND (? OR owner_id = ?)",
        )
        .bind(file_id)
        .bind(requester.is_admin())
        .bind(&requester.user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if owned.is_none() {
            return Err(MetadataError::FileNotFound);
        }

        let (next,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version_number), 0) + 1 FROM versions WHERE file_id = ?",
        )
        .bind(file_id)
        .fetch_one(&mut *tx)
        .await?;

        let version = insert_version(&mut tx, Uuid::new_v4(), file_id, next, stored).await?;

        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET current_version_id = ?, size_bytes = ?, updated_at = ?
             WHERE id = ?
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(version.id)
        .bind(version.size_bytes)
        .bind(now)
        .bind(file_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((file, version))
    }

    /// Resolve the file and its current version if `requester` may read it.
    pub async fn resolve_current_version(
        &self,
        file_id: Uuid,
        requester: &Requester,
    ) -> MetadataResult<(FileRecord, FileVersion)> {
        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files f
             WHERE f.id = ?
               AND f.is_deleted = 0
               AND (? OR f.owner_id = ? OR EXISTS (
                     SELECT 1 FROM file_permissions p
                     WHERE p.file_id = f.id AND p.subject_user_id = ?))"
        ))
        .bind(file_id)
        .bind(requester.is_admin())
        .bind(&requester.user_id)
        .bind(&requester.user_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(MetadataError::FileNotFound)?;

        let version_id = file
            .current_version_id
            .ok_or(MetadataError::FileNotFound)?;

        let version = sqlx::query_as::<_, FileVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions WHERE id = ?"
        ))
        .bind(version_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(MetadataError::MissingVersion(file.id))?;

        Ok((file, version))
    }

    /// `SELECT 1` for the readiness check.
    pub async fn ping(&self) -> Result<(), String> {
        match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await
        {
            Ok(1) => Ok(()),
            Ok(v) => Err(format!("unexpected result: {}", v)),
            Err(e) => Err(format!("error: {}", e)),
        }
    }
}

async fn insert_version(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    version_id: Uuid,
    file_id: Uuid,
    version_number: i64,
    stored: &StoredObject,
) -> MetadataResult<FileVersion> {
    let version = sqlx::query_as::<_, FileVersion>(&format!(
        "INSERT INTO versions (id, file_id, storage_key, version_number, checksum,
                               size_bytes, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         RETURNING {VERSION_COLUMNS}"
    ))
    .bind(version_id)
    .bind(file_id)
    .bind(&stored.storage_key)
    .bind(version_number)
    .bind(&stored.checksum)
    .bind(stored.size_bytes as i64)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(version)
}
