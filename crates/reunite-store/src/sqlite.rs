//! SQLite-backed gallery.
//!
//! One row per record. Reference images live in a [`MediaDir`] next to the
//! database; the row only carries the image location and digest. The cached
//! descriptor is stored on the row as a little-endian `f32` blob together
//! with the model id and the digest of the image it was computed from.

use chrono::{DateTime, Utc};
use reunite_core::{
    CachedDescriptor, Descriptor, GalleryStore, ImageRef, ImageUpload, MissingPersonRecord,
    NewRecord, RecordId, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::media::MediaDir;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS missing_persons (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    full_name             TEXT NOT NULL,
    contact_info          TEXT NOT NULL,
    reporter_address      TEXT NOT NULL,
    missing_place_address TEXT NOT NULL,
    identity_details      TEXT NOT NULL,
    image_location        TEXT,
    image_digest          TEXT,
    descriptor_model      TEXT,
    descriptor_digest     TEXT,
    descriptor_version    TEXT,
    descriptor            BLOB,
    created_at            TEXT NOT NULL
);
";

const RECORD_COLUMNS: &str = "id, full_name, contact_info, reporter_address, missing_place_address,
    identity_details, image_location, image_digest, descriptor_model, descriptor_digest,
    descriptor_version, descriptor, created_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid database value: {0}")]
    InvalidDbValue(String),
}

impl From<SqliteStoreError> for StoreError {
    fn from(err: SqliteStoreError) -> Self {
        StoreError::backend(err)
    }
}

type Result<T> = std::result::Result<T, SqliteStoreError>;

pub struct SqliteGallery {
    conn: Mutex<Connection>,
    media: MediaDir,
}

impl SqliteGallery {
    /// Open or create the gallery database, with images under `media_root`.
    pub fn open(db_path: impl AsRef<Path>, media_root: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %db_path.display(), journal, "gallery database opened");
        Self::init(conn, media_root.into())
    }

    /// Database in memory, images still on disk. Used by tests and tooling.
    pub fn open_in_memory(media_root: impl Into<PathBuf>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, media_root.into())
    }

    fn init(conn: Connection, media_root: PathBuf) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Mutex::new(conn), media: MediaDir::new(media_root) })
    }

    pub fn media_root(&self) -> &Path {
        self.media.root()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn select_one(conn: &Connection, id: RecordId) -> Result<Option<MissingPersonRecord>> {
        let raw = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM missing_persons WHERE id = ?1"),
                params![to_sql_id(id)?],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// Delete an image file once no row refers to it any more.
    fn release_image(&self, conn: &Connection, location: &str) -> Result<()> {
        let refs: i64 = conn.query_row(
            "SELECT COUNT(*) FROM missing_persons WHERE image_location = ?1",
            params![location],
            |row| row.get(0),
        )?;
        if refs == 0 {
            self.media.remove(location)?;
        }
        Ok(())
    }

    /// Undo `put_image` after the row write failed. The original error wins.
    fn discard_image(&self, conn: &Connection, image: Option<&ImageRef>) {
        let Some(image) = image else { return };
        if let Err(err) = self.release_image(conn, &image.location) {
            tracing::warn!(location = %image.location, error = %err, "failed to remove orphaned image");
        }
    }

    fn insert_record(&self, record: NewRecord) -> Result<MissingPersonRecord> {
        // Held across the file write so a concurrent release of the same
        // content cannot delete it before the row exists.
        let conn = self.conn();
        let image = match &record.reference_image {
            Some(upload) => Some(self.put_image(upload)?),
            None => None,
        };
        let created_at = Utc::now();

        let inserted = conn.execute(
            "INSERT INTO missing_persons (
                full_name, contact_info, reporter_address, missing_place_address,
                identity_details, image_location, image_digest, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.full_name,
                record.contact_info,
                record.reporter_address,
                record.missing_place_address,
                record.identity_details,
                image.as_ref().map(|i| i.location.as_str()),
                image.as_ref().map(|i| i.digest.as_str()),
                created_at.to_rfc3339(),
            ],
        );
        if let Err(err) = inserted {
            self.discard_image(&conn, image.as_ref());
            return Err(err.into());
        }
        let id = from_sql_id(conn.last_insert_rowid())?;

        Ok(MissingPersonRecord {
            id,
            full_name: record.full_name,
            contact_info: record.contact_info,
            reporter_address: record.reporter_address,
            missing_place_address: record.missing_place_address,
            identity_details: record.identity_details,
            reference_image: image,
            descriptor: None,
            created_at,
        })
    }

    fn put_image(&self, upload: &ImageUpload) -> Result<ImageRef> {
        let location = self.media.put(upload)?;
        Ok(ImageRef { location, digest: upload.digest.clone() })
    }

    fn scan(&self) -> Result<Vec<MissingPersonRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM missing_persons
             WHERE image_location IS NOT NULL
             ORDER BY id ASC"
        ))?;
        let mut records = Vec::new();
        for row in stmt.query_map([], RawRecord::from_row)? {
            let raw = match row {
                Ok(raw) => raw,
                Err(err) if is_row_error(&err) => {
                    tracing::warn!(error = %err, "skipping unreadable gallery row");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let id = raw.id;
            match raw.into_record() {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!(id, error = %err, "skipping malformed gallery row"),
            }
        }
        Ok(records)
    }

    fn write_descriptor(&self, id: RecordId, cached: &CachedDescriptor) -> Result<bool> {
        let (blob, version) = match &cached.descriptor {
            Some(d) => (Some(encode_descriptor(&d.values)), d.model_version.as_deref()),
            None => (None, None),
        };
        let changed = self.conn().execute(
            "UPDATE missing_persons
             SET descriptor_model = ?2, descriptor_digest = ?3,
                 descriptor_version = ?4, descriptor = ?5
             WHERE id = ?1 AND image_digest = ?3",
            params![to_sql_id(id)?, cached.model_id, cached.source_digest, version, blob],
        )?;
        Ok(changed > 0)
    }

    fn swap_image(&self, id: RecordId, image: Option<ImageUpload>) -> Result<Option<MissingPersonRecord>> {
        let conn = self.conn();
        let new_ref = match &image {
            Some(upload) => Some(self.put_image(upload)?),
            None => None,
        };

        let Some(existing) = Self::select_one(&conn, id)? else {
            if let Some(new_ref) = &new_ref {
                self.release_image(&conn, &new_ref.location)?;
            }
            return Ok(None);
        };

        let updated = conn.execute(
            "UPDATE missing_persons
             SET image_location = ?2, image_digest = ?3,
                 descriptor_model = NULL, descriptor_digest = NULL,
                 descriptor_version = NULL, descriptor = NULL
             WHERE id = ?1",
            params![
                to_sql_id(id)?,
                new_ref.as_ref().map(|i| i.location.as_str()),
                new_ref.as_ref().map(|i| i.digest.as_str()),
            ],
        );
        if let Err(err) = updated {
            self.discard_image(&conn, new_ref.as_ref());
            return Err(err.into());
        }

        if let Some(old) = existing.reference_image {
            if Some(&old) != new_ref.as_ref() {
                self.release_image(&conn, &old.location)?;
            }
        }
        Self::select_one(&conn, id)
    }

    fn delete(&self, id: RecordId) -> Result<bool> {
        let conn = self.conn();
        let Some(existing) = Self::select_one(&conn, id)? else {
            return Ok(false);
        };
        conn.execute("DELETE FROM missing_persons WHERE id = ?1", params![to_sql_id(id)?])?;
        if let Some(image) = existing.reference_image {
            self.release_image(&conn, &image.location)?;
        }
        Ok(true)
    }
}

impl GalleryStore for SqliteGallery {
    fn insert(&self, record: NewRecord) -> std::result::Result<MissingPersonRecord, StoreError> {
        Ok(self.insert_record(record)?)
    }

    fn get(&self, id: RecordId) -> std::result::Result<Option<MissingPersonRecord>, StoreError> {
        Ok(Self::select_one(&self.conn(), id)?)
    }

    fn scan_with_images(&self) -> std::result::Result<Vec<MissingPersonRecord>, StoreError> {
        Ok(self.scan()?)
    }

    fn load_image(&self, image: &ImageRef) -> std::result::Result<Vec<u8>, StoreError> {
        self.media.read(&image.location).map_err(|source| StoreError::ImageUnavailable {
            location: image.location.clone(),
            source,
        })
    }

    fn store_descriptor(
        &self,
        id: RecordId,
        cached: &CachedDescriptor,
    ) -> std::result::Result<bool, StoreError> {
        Ok(self.write_descriptor(id, cached)?)
    }

    fn replace_image(
        &self,
        id: RecordId,
        image: Option<ImageUpload>,
    ) -> std::result::Result<MissingPersonRecord, StoreError> {
        self.swap_image(id, image)?.ok_or(StoreError::NotFound(id))
    }

    fn remove(&self, id: RecordId) -> std::result::Result<bool, StoreError> {
        Ok(self.delete(id)?)
    }

    fn count(&self) -> std::result::Result<usize, StoreError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM missing_persons", [], |row| row.get(0))
            .map_err(SqliteStoreError::from)?;
        usize::try_from(count)
            .map_err(|_| SqliteStoreError::InvalidDbValue(format!("row count {count}")).into())
    }
}

/// Row as read from SQLite, before domain validation.
struct RawRecord {
    id: i64,
    full_name: String,
    contact_info: String,
    reporter_address: String,
    missing_place_address: String,
    identity_details: String,
    image_location: Option<String>,
    image_digest: Option<String>,
    descriptor_model: Option<String>,
    descriptor_digest: Option<String>,
    descriptor_version: Option<String>,
    descriptor: Option<Vec<u8>>,
    created_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            full_name: row.get(1)?,
            contact_info: row.get(2)?,
            reporter_address: row.get(3)?,
            missing_place_address: row.get(4)?,
            identity_details: row.get(5)?,
            image_location: row.get(6)?,
            image_digest: row.get(7)?,
            descriptor_model: row.get(8)?,
            descriptor_digest: row.get(9)?,
            descriptor_version: row.get(10)?,
            descriptor: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<MissingPersonRecord> {
        let reference_image = match (self.image_location, self.image_digest) {
            (Some(location), Some(digest)) => Some(ImageRef { location, digest }),
            (None, None) => None,
            _ => {
                return Err(SqliteStoreError::InvalidDbValue(format!(
                    "record {}: image location and digest must be set together",
                    self.id
                )))
            }
        };

        // A damaged cache entry only costs a recomputation.
        let descriptor = match (self.descriptor_model, self.descriptor_digest) {
            (Some(model_id), Some(source_digest)) => match self.descriptor.as_deref().map(decode_descriptor) {
                Some(Err(err)) => {
                    tracing::warn!(id = self.id, error = %err, "discarding unreadable cached descriptor");
                    None
                }
                decoded => Some(CachedDescriptor {
                    model_id,
                    source_digest,
                    descriptor: decoded
                        .and_then(|r| r.ok())
                        .map(|values| Descriptor { values, model_version: self.descriptor_version }),
                }),
            },
            _ => None,
        };

        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| SqliteStoreError::InvalidDbValue(format!("created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(MissingPersonRecord {
            id: from_sql_id(self.id)?,
            full_name: self.full_name,
            contact_info: self.contact_info,
            reporter_address: self.reporter_address,
            missing_place_address: self.missing_place_address,
            identity_details: self.identity_details,
            reference_image,
            descriptor,
            created_at,
        })
    }
}

/// Conversion failures confined to one row, as opposed to connection or
/// statement failures.
fn is_row_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::Utf8Error(..)
    )
}

fn to_sql_id(id: RecordId) -> Result<i64> {
    i64::try_from(id.0).map_err(|_| SqliteStoreError::InvalidDbValue(format!("record id {id}")))
}

fn from_sql_id(id: i64) -> Result<RecordId> {
    u64::try_from(id)
        .map(RecordId)
        .map_err(|_| SqliteStoreError::InvalidDbValue(format!("record id {id}")))
}

fn encode_descriptor(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_descriptor(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(SqliteStoreError::InvalidDbValue(format!(
            "descriptor blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reunite_core::{
        DescriptorExtractor, ExtractError, IngestionPipeline, MatchConfig, FaceSearch,
        RegistrationForm,
    };
    use std::sync::Arc;

    fn png(tag: &str) -> Vec<u8> {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend_from_slice(tag.as_bytes());
        bytes
    }

    fn new_record(name: &str, image: Option<Vec<u8>>) -> NewRecord {
        NewRecord {
            full_name: name.to_string(),
            contact_info: "555-0100".into(),
            reporter_address: "12 Elm St".into(),
            missing_place_address: "Central Station".into(),
            identity_details: "red jacket".into(),
            reference_image: image.map(|b| ImageUpload::new(b).unwrap()),
        }
    }

    /// Reads the descriptor straight out of the image body after the PNG magic.
    struct BodyExtractor;

    impl DescriptorExtractor for BodyExtractor {
        fn model_id(&self) -> &str {
            "body"
        }

        fn extract(&self, image: &[u8]) -> std::result::Result<Vec<Descriptor>, ExtractError> {
            let body = std::str::from_utf8(&image[8..]).map_err(|e| ExtractError::Failed(e.to_string()))?;
            Ok(body
                .split(';')
                .filter(|s| !s.is_empty())
                .map(|face| {
                    let values = face.split(',').map(|v| v.parse().unwrap()).collect();
                    Descriptor::with_model(values, "body")
                })
                .collect())
        }
    }

    #[test]
    fn test_insert_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteGallery::open(dir.path().join("gallery.db"), dir.path().join("media")).unwrap();

        let record = store.insert(new_record("Jane Doe", Some(png("0,0")))).unwrap();
        let fetched = store.get(record.id).unwrap().unwrap();
        assert_eq!(fetched.full_name, "Jane Doe");
        assert_eq!(fetched.reference_image, record.reference_image);
        assert_eq!(fetched.created_at.timestamp(), record.created_at.timestamp());
        assert!(fetched.descriptor.is_none());

        let location = &record.reference_image.unwrap().location;
        assert!(dir.path().join("media").join(location).exists());
    }

    #[test]
    fn test_ids_are_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteGallery::open_in_memory(dir.path()).unwrap();
        let a = store.insert(new_record("A", None)).unwrap();
        let b = store.insert(new_record("B", None)).unwrap();
        assert!(store.remove(b.id).unwrap());
        let c = store.insert(new_record("C", None)).unwrap();
        assert!(a.id < b.id && b.id < c.id);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_scan_order_and_image_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteGallery::open_in_memory(dir.path()).unwrap();
        let a = store.insert(new_record("A", Some(png("a")))).unwrap();
        store.insert(new_record("no photo", None)).unwrap();
        let c = store.insert(new_record("C", Some(png("c")))).unwrap();

        let ids: Vec<_> = store.scan_with_images().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[test]
    fn test_descriptor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("gallery.db");
        let media = dir.path().join("media");

        let (id, digest) = {
            let store = SqliteGallery::open(&db, &media).unwrap();
            let record = store.insert(new_record("A", Some(png("a")))).unwrap();
            let digest = record.reference_image.unwrap().digest;
            let cached = CachedDescriptor {
                model_id: "body".into(),
                source_digest: digest.clone(),
                descriptor: Some(Descriptor::with_model(vec![0.25, -1.5, 3.0], "body")),
            };
            assert!(store.store_descriptor(record.id, &cached).unwrap());
            (record.id, digest)
        };

        let store = SqliteGallery::open(&db, &media).unwrap();
        let cached = store.get(id).unwrap().unwrap().descriptor.unwrap();
        assert_eq!(cached.source_digest, digest);
        let descriptor = cached.descriptor.unwrap();
        assert_eq!(descriptor.values, vec![0.25, -1.5, 3.0]);
        assert_eq!(descriptor.model_version.as_deref(), Some("body"));
    }

    #[test]
    fn test_absent_descriptor_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteGallery::open_in_memory(dir.path()).unwrap();
        let record = store.insert(new_record("A", Some(png("")))).unwrap();
        let cached = CachedDescriptor {
            model_id: "body".into(),
            source_digest: record.reference_image.unwrap().digest,
            descriptor: None,
        };
        assert!(store.store_descriptor(record.id, &cached).unwrap());
        assert_eq!(store.get(record.id).unwrap().unwrap().descriptor, Some(cached));
    }

    #[test]
    fn test_descriptor_write_for_replaced_image_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteGallery::open_in_memory(dir.path()).unwrap();
        let record = store.insert(new_record("A", Some(png("old")))).unwrap();
        let old_digest = record.reference_image.unwrap().digest;

        store.replace_image(record.id, Some(ImageUpload::new(png("new")).unwrap())).unwrap();
        let stale = CachedDescriptor {
            model_id: "body".into(),
            source_digest: old_digest,
            descriptor: Some(Descriptor::new(vec![1.0])),
        };
        assert!(!store.store_descriptor(record.id, &stale).unwrap());
        assert!(store.get(record.id).unwrap().unwrap().descriptor.is_none());
    }

    #[test]
    fn test_replace_image_clears_descriptor_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteGallery::open_in_memory(dir.path()).unwrap();
        let record = store.insert(new_record("A", Some(png("old")))).unwrap();
        let old = record.reference_image.unwrap();
        let cached = CachedDescriptor {
            model_id: "body".into(),
            source_digest: old.digest.clone(),
            descriptor: None,
        };
        store.store_descriptor(record.id, &cached).unwrap();

        let updated = store
            .replace_image(record.id, Some(ImageUpload::new(png("new")).unwrap()))
            .unwrap();
        assert!(updated.descriptor.is_none());
        assert!(!dir.path().join(&old.location).exists());
        assert!(dir.path().join(updated.reference_image.unwrap().location).exists());

        let cleared = store.replace_image(record.id, None).unwrap();
        assert!(cleared.reference_image.is_none());
        assert!(store.scan_with_images().unwrap().is_empty());
    }

    #[test]
    fn test_shared_image_is_kept_until_last_reference() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteGallery::open_in_memory(dir.path()).unwrap();
        let a = store.insert(new_record("A", Some(png("same")))).unwrap();
        let b = store.insert(new_record("B", Some(png("same")))).unwrap();
        let location = a.reference_image.unwrap().location;

        store.remove(a.id).unwrap();
        assert!(dir.path().join(&location).exists());
        store.remove(b.id).unwrap();
        assert!(!dir.path().join(&location).exists());
    }

    #[test]
    fn test_replace_unknown_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteGallery::open_in_memory(dir.path()).unwrap();
        let err = store.replace_image(RecordId(7), None).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(RecordId(7))));
    }

    #[test]
    fn test_search_skips_missing_file_and_persists_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteGallery::open_in_memory(dir.path()).unwrap());
        let ingest = IngestionPipeline::new(store.clone());
        let search = FaceSearch::new(store.clone(), Arc::new(BodyExtractor), MatchConfig::default());

        let form = |name: &str, image: Vec<u8>| RegistrationForm {
            full_name: name.into(),
            contact_info: "555-0100".into(),
            reporter_address: "12 Elm St".into(),
            missing_place_address: "Central Station".into(),
            identity_details: "red jacket".into(),
            reference_image: Some(image),
        };
        let broken = ingest.register(form("broken", png("0,0"))).unwrap();
        std::fs::remove_file(dir.path().join(broken.reference_image.unwrap().location)).unwrap();
        let valid = ingest.register(form("valid", png("0.1,0.1"))).unwrap();

        let found = search.match_image(&png("0.05,0.05")).unwrap().unwrap();
        assert_eq!(found.record.id, valid.id);
        assert_eq!(found.summary.failed, 1);

        let cached = store.get(valid.id).unwrap().unwrap().descriptor.unwrap();
        assert_eq!(cached.descriptor.unwrap().values, vec![0.1, 0.1]);
        assert!(store.get(broken.id).unwrap().unwrap().descriptor.is_none());
    }

    #[test]
    fn test_search_survives_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteGallery::open_in_memory(dir.path()).unwrap());
        let search = FaceSearch::new(store.clone(), Arc::new(BodyExtractor), MatchConfig::default());

        let bad_date = store.insert(new_record("bad date", Some(png("0,0")))).unwrap();
        let half_image = store.insert(new_record("half image", Some(png("0,0.01")))).unwrap();
        let bad_blob = store.insert(new_record("bad blob", Some(png("0.1,0.1")))).unwrap();
        let digest = bad_blob.reference_image.as_ref().unwrap().digest.clone();
        {
            let conn = store.conn();
            conn.execute(
                "UPDATE missing_persons SET created_at = 'yesterday' WHERE id = ?1",
                params![bad_date.id.0 as i64],
            )
            .unwrap();
            conn.execute(
                "UPDATE missing_persons SET image_digest = NULL WHERE id = ?1",
                params![half_image.id.0 as i64],
            )
            .unwrap();
            conn.execute(
                "UPDATE missing_persons
                 SET descriptor_model = 'body', descriptor_digest = ?2, descriptor = x'010203'
                 WHERE id = ?1",
                params![bad_blob.id.0 as i64, digest],
            )
            .unwrap();
        }

        let ids: Vec<_> = store.scan_with_images().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![bad_blob.id]);
        assert!(store.get(bad_blob.id).unwrap().unwrap().descriptor.is_none());

        let found = search.match_image(&png("0.05,0.05")).unwrap().unwrap();
        assert_eq!(found.record.id, bad_blob.id);

        // The damaged entry was recomputed and written back.
        let cached = store.get(bad_blob.id).unwrap().unwrap().descriptor.unwrap();
        assert_eq!(cached.descriptor.unwrap().values, vec![0.1, 0.1]);
    }

    fn freeze(store: &SqliteGallery, event: &str) {
        store
            .conn()
            .execute_batch(&format!(
                "CREATE TRIGGER frozen BEFORE {event} ON missing_persons
                 BEGIN SELECT RAISE(ABORT, 'frozen'); END;"
            ))
            .unwrap();
    }

    #[test]
    fn test_failed_insert_leaves_no_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteGallery::open_in_memory(dir.path()).unwrap();
        freeze(&store, "INSERT");

        let upload = ImageUpload::new(png("orphan")).unwrap();
        assert!(store.insert(new_record("A", Some(png("orphan")))).is_err());
        assert!(!dir.path().join(upload.location()).exists());
    }

    #[test]
    fn test_failed_replace_leaves_no_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteGallery::open_in_memory(dir.path()).unwrap();
        let record = store.insert(new_record("A", Some(png("old")))).unwrap();
        let old = record.reference_image.unwrap();
        freeze(&store, "UPDATE");

        let upload = ImageUpload::new(png("new")).unwrap();
        assert!(store.replace_image(record.id, Some(upload.clone())).is_err());
        assert!(!dir.path().join(upload.location()).exists());
        assert!(dir.path().join(&old.location).exists());
        assert_eq!(store.get(record.id).unwrap().unwrap().reference_image, Some(old));
    }

    #[test]
    fn test_decode_descriptor_rejects_bad_length() {
        assert!(decode_descriptor(&[0, 1, 2]).is_err());
        assert_eq!(decode_descriptor(&encode_descriptor(&[1.5, -2.0])).unwrap(), vec![1.5, -2.0]);
    }
}
