use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("malformed metadata: {0}")]
    Meta(#[from] serde_json::Error),
    #[error("Checksum mismatch for file {file_id}: expected {expected}, got {actual}")]
    Checksum {
        file_id: String,
        expected: String,
        actual: String,
    },
}

pub type Result<T> = std::result::Result<T, BlobError>;

/// Metadata kept for every stored attachment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: String,
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
    /// SHA-256 of the stored bytes, hex encoded.
    pub content_hash: String,
}

#[derive(Clone, Debug)]
pub struct BlobStore {
    blob_dir: PathBuf,
    meta_conn: Arc<Mutex<Connection>>,
}

impl BlobStore {
    pub async fn new(blob_dir: PathBuf, meta_db_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&blob_dir).await?;
        if let Some(parent) = meta_db_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&meta_db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (
                file_id TEXT PRIMARY KEY,
                value JSON NOT NULL
            )",
            [],
        )?;

        info!("[Files] Blob store ready at {:?}", blob_dir);

        Ok(Self {
            blob_dir,
            meta_conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Store `data` under a freshly generated file id.
    pub async fn put(&self, file_name: &str, content_type: &str, data: Bytes) -> Result<FileMeta> {
        let file_id = uuid::Uuid::new_v4().to_string();
        self.put_with_id(&file_id, file_name, content_type, data)
            .await
    }

    /// Store `data` under `file_id`, replacing anything already there.
    pub async fn put_with_id(
        &self,
        file_id: &str,
        file_name: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<FileMeta> {
        let meta = FileMeta {
            file_id: file_id.to_string(),
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            size: data.len() as u64,
            content_hash: sha256_hex(&data),
        };

        let temp_folder = self.blob_dir.join("tmp");
        atomic_write(&self.file_path(file_id), &data, &temp_folder).await?;

        {
            let conn = self.meta_conn.lock().await;
            let value = serde_json::to_string(&meta)?;
            conn.execute(
                "INSERT OR REPLACE INTO meta (file_id, value) VALUES (?, ?)",
                params![file_id, value],
            )?;
        }

        debug!(file_id, size = meta.size, "stored attachment");
        Ok(meta)
    }

    pub async fn get_meta(&self, file_id: &str) -> Result<Option<FileMeta>> {
        let conn = self.meta_conn.lock().await;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE file_id = ?",
                params![file_id],
                |row| row.get(0),
            )
            .optional()?;

        match value {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Fetch bytes and metadata, verifying the stored hash.
    pub async fn get(&self, file_id: &str) -> Result<Option<(Bytes, FileMeta)>> {
        let Some(meta) = self.get_meta(file_id).await? else {
            return Ok(None);
        };

        let file_path = self.file_path(file_id);
        if !fs::try_exists(&file_path).await? {
            return Ok(None);
        }

        let data = fs::read(&file_path).await?;
        let actual = sha256_hex(&data);
        if actual != meta.content_hash {
            return Err(BlobError::Checksum {
                file_id: file_id.to_string(),
                expected: meta.content_hash,
                actual,
            });
        }

        Ok(Some((Bytes::from(data), meta)))
    }

    /// On-disk location of the bytes for `file_id`.
    pub fn file_path(&self, file_id: &str) -> PathBuf {
        self.blob_dir.join(encode_filename(file_id))
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Map a file id onto a single safe path component.
///
/// Separators, dots, control characters and characters reserved on common
/// filesystems are percent-encoded, so ids like `../x` stay inside the blob
/// directory.
pub fn encode_filename(s: &str) -> String {
    let mut encoded = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(
            c,
            '<' | '>' | ':' | '"' | '/' | '|' | '\\' | '?' | '*' | '%' | '.' | '\x00'..='\x1f' | '\x7f'
        ) {
            encoded.push_str(&format!("%{:02X}", c as u32));
        } else {
            encoded.push(c);
        }
    }
    if encoded.is_empty() {
        encoded.push_str("%00");
    }
    encoded
}

/// Write `data` to a temp file under `temp_folder`, then rename it over `dest`.
pub async fn atomic_write(
    dest: &Path,
    data: &[u8],
    temp_folder: &Path,
) -> Result<std::fs::Metadata> {
    fs::create_dir_all(temp_folder).await?;

    let temp_path = temp_folder.join(format!("tmp_{}", uuid::Uuid::new_v4()));
    fs::write(&temp_path, data).await?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(&temp_path, dest).await?;

    Ok(fs::metadata(dest).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_in(dir: &Path) -> BlobStore {
        BlobStore::new(dir.join("blobs"), dir.join("meta.sqlite"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        let meta = store
            .put("a.png", "image/png", Bytes::from_static(b"\x89PNG"))
            .await
            .unwrap();
        assert_eq!(meta.size, 4);
        assert_eq!(meta.file_name, "a.png");

        let (data, fetched) = store.get(&meta.file_id).await.unwrap().unwrap();
        assert_eq!(&data[..], b"\x89PNG");
        assert_eq!(fetched, meta);
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupted_file_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        let meta = store
            .put("doc.pdf", "application/pdf", Bytes::from("original"))
            .await
            .unwrap();
        std::fs::write(store.file_path(&meta.file_id), "tampered").unwrap();

        let err = store.get(&meta.file_id).await.unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[test]
    fn test_encode_filename_stays_in_directory() {
        assert_eq!(encode_filename("../etc/passwd"), "%2E%2E%2Fetc%2Fpasswd");
        assert_eq!(
            encode_filename("0b7f3c2e-1a2b-4c5d-9e8f-001122334455"),
            "0b7f3c2e-1a2b-4c5d-9e8f-001122334455"
        );
        assert_eq!(encode_filename(""), "%00");
    }
}
