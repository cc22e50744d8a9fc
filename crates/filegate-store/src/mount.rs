//! POSIX mount backend. Objects are plain files under the mount root;
//! chunked uploads are assembled in an exclusively-owned staging file and
//! promoted with an atomic rename.
//!
//! Staged chunks are appended in arrival order, so the caller must serialize
//! part writes for one upload ([`PartWriteDiscipline::Serialized`]) and
//! clients must send parts in order. Out-of-order arrival on this backend
//! corrupts the assembled file; the remote backends do not share this
//! limitation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use filegate_common::error::{FilegateError, Result};
use filegate_common::path::normalize_key;
use filegate_common::types::{CompletedPart, FileInfo, ObjectInfo, StorageUsage};
use md5::{Digest, Md5};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::traits::{ObjectStore, PartWriteDiscipline};

const SYS_DIR_NAME: &str = ".filegate";
const UPLOADS_DIR_NAME: &str = "uploads";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

struct StagingUpload {
    target: PathBuf,
    staging_path: PathBuf,
    file: Mutex<Option<fs::File>>,
}

pub struct MountStore {
    root: PathBuf,
    uploads: RwLock<HashMap<String, Arc<StagingUpload>>>,
}

impl MountStore {
    pub async fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).await?;
        fs::create_dir_all(root.join(SYS_DIR_NAME).join(UPLOADS_DIR_NAME)).await?;
        Ok(Self {
            root,
            uploads: RwLock::new(HashMap::new()),
        })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let key = normalize_key(key)?;
        Ok(self.root.join(key))
    }

    fn resolve_dir(&self, path: &str) -> Result<PathBuf> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(self.root.clone());
        }
        self.resolve(trimmed)
    }

    fn staging_path(&self, upload_id: &str) -> PathBuf {
        self.root
            .join(SYS_DIR_NAME)
            .join(UPLOADS_DIR_NAME)
            .join(format!("{upload_id}.part"))
    }

    fn staging_upload(&self, upload_id: &str) -> Result<Arc<StagingUpload>> {
        self.uploads
            .read()
            .expect("uploads lock poisoned")
            .get(upload_id)
            .cloned()
            .ok_or_else(|| {
                FilegateError::InvalidArgument(format!("unknown upload id: {upload_id}"))
            })
    }

    fn take_staging_upload(&self, upload_id: &str) -> Result<Arc<StagingUpload>> {
        self.uploads
            .write()
            .expect("uploads lock poisoned")
            .remove(upload_id)
            .ok_or_else(|| {
                FilegateError::InvalidArgument(format!("unknown upload id: {upload_id}"))
            })
    }

    async fn file_info(&self, key: &str, path: &Path) -> Result<ObjectInfo> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|err| map_not_found(key, err))?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: metadata.len() as i64,
            etag: String::new(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            last_modified: modified_time(&metadata),
        })
    }
}

#[async_trait]
impl ObjectStore for MountStore {
    fn part_write_discipline(&self) -> PartWriteDiscipline {
        PartWriteDiscipline::Serialized
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        _content_type: Option<&str>,
    ) -> Result<ObjectInfo> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let etag = format!("{:x}", Md5::digest(&data));
        let size = data.len() as i64;
        fs::write(&path, data).await?;

        let metadata = fs::metadata(&path).await?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size,
            etag,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            last_modified: modified_time(&metadata),
        })
    }

    async fn get_object(&self, key: &str) -> Result<(ObjectInfo, Bytes)> {
        let path = self.resolve(key)?;
        let data = fs::read(&path)
            .await
            .map_err(|err| map_not_found(key, err))?;
        let mut info = self.file_info(key, &path).await?;
        info.etag = format!("{:x}", Md5::digest(&data));
        info.size = data.len() as i64;
        Ok((info, Bytes::from(data)))
    }

    async fn stat_object(&self, key: &str) -> Result<ObjectInfo> {
        let path = self.resolve(key)?;
        self.file_info(key, &path).await
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|err| map_not_found(key, err))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let dir = self.resolve_dir(path)?;
        let at_root = dir == self.root;
        let base = format!("/{}", path.trim_matches('/'));
        let base = if base == "/" { String::new() } else { base };

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|err| map_not_found(path, err))?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if at_root && name == SYS_DIR_NAME {
                continue;
            }
            let metadata = entry.metadata().await?;
            files.push(FileInfo {
                path: format!("{base}/{name}"),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() {
                    0
                } else {
                    metadata.len() as i64
                },
                modified: modified_time(&metadata),
                name,
            });
        }

        files.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(files)
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let target = self.resolve(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let upload_id = Uuid::new_v4().to_string();
        let staging_path = self.staging_path(&upload_id);
        let file = fs::File::create(&staging_path).await?;

        let upload = Arc::new(StagingUpload {
            target,
            staging_path,
            file: Mutex::new(Some(file)),
        });
        self.uploads
            .write()
            .expect("uploads lock poisoned")
            .insert(upload_id.clone(), upload);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        _part_number: i32,
        data: Bytes,
    ) -> Result<String> {
        let upload = self.staging_upload(upload_id)?;
        let etag = format!("{:x}", Md5::digest(&data));

        let mut guard = upload.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| {
            FilegateError::InternalError(format!("staging file already closed: {upload_id}"))
        })?;
        file.write_all(&data).await?;
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo> {
        let upload = self.staging_upload(upload_id)?;

        {
            let mut guard = upload.file.lock().await;
            // Flushed at most once; a finalize retry finds the handle
            // already closed and goes straight to the promote.
            if let Some(mut file) = guard.take() {
                file.flush().await?;
                file.sync_all().await?;
            }
        }

        if let Err(rename_err) = fs::rename(&upload.staging_path, &upload.target).await {
            // Cross-device staging cannot be renamed; the copy fallback is
            // not atomic and a crash mid-copy may leave a partial target.
            tracing::warn!(
                upload_id = %upload_id,
                error = %rename_err,
                "rename of staging file failed, falling back to copy"
            );
            fs::copy(&upload.staging_path, &upload.target).await?;
            fs::remove_file(&upload.staging_path).await?;
        }

        // The handle is consumed only once the promote has landed, so a
        // failed promote stays retryable and abort can still clean up.
        self.uploads
            .write()
            .expect("uploads lock poisoned")
            .remove(upload_id);

        let mut info = self.file_info(key, &upload.target).await?;
        info.etag = multipart_etag(&parts);
        Ok(info)
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        let upload = self.take_staging_upload(upload_id)?;
        upload.file.lock().await.take();
        fs::remove_file(&upload.staging_path).await?;
        Ok(())
    }

    async fn presign_put(&self, _key: &str, _expires_secs: u64) -> Result<String> {
        Err(FilegateError::NotImplemented(
            "presigned uploads are not available on the mount backend".to_string(),
        ))
    }

    async fn usage(&self) -> Result<StorageUsage> {
        let mut usage = StorageUsage::default();
        let mut dirs = vec![self.root.clone()];
        let sys_dir = self.root.join(SYS_DIR_NAME);

        while let Some(dir) = dirs.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path == sys_dir {
                    continue;
                }
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    dirs.push(path);
                    continue;
                }

                let size = metadata.len() as i64;
                usage.total_objects += 1;
                usage.total_size += size;
                if size > usage.largest_file_size {
                    usage.largest_file_size = size;
                    usage.largest_file = path
                        .strip_prefix(&self.root)
                        .ok()
                        .map(|rel| rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }

        Ok(usage)
    }
}

fn modified_time(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

fn map_not_found(key: &str, err: std::io::Error) -> FilegateError {
    if err.kind() == std::io::ErrorKind::NotFound {
        FilegateError::ObjectNotFound(key.to_string())
    } else {
        FilegateError::Io(err)
    }
}

/// S3-style composite etag: digest over the part tags, suffixed with the
/// part count.
fn multipart_etag(parts: &[CompletedPart]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part.etag.as_bytes());
    }
    format!("{:x}-{}", hasher.finalize(), parts.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, MountStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = MountStore::new(dir.path().to_path_buf())
            .await
            .expect("mount store");
        (dir, store)
    }

    #[tokio::test]
    async fn put_list_delete_round() {
        let (_dir, store) = store().await;

        store
            .put_object("docs/a.txt", Bytes::from_static(b"hello"), None)
            .await
            .unwrap();
        store
            .put_object("b.txt", Bytes::from_static(b"world!"), None)
            .await
            .unwrap();

        let root = store.list_dir("/").await.unwrap();
        let names: Vec<&str> = root.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "b.txt"]);
        assert!(root[0].is_dir);

        let docs = store.list_dir("/docs").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path, "/docs/a.txt");
        assert_eq!(docs[0].size, 5);

        store.delete_object("docs/a.txt").await.unwrap();
        assert!(matches!(
            store.stat_object("docs/a.txt").await,
            Err(FilegateError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn listing_hides_staging_dir() {
        let (_dir, store) = store().await;
        let root = store.list_dir("/").await.unwrap();
        assert!(root.is_empty());
    }

    #[tokio::test]
    async fn staged_upload_assembles_in_order() {
        let (dir, store) = store().await;

        let upload_id = store.create_multipart_upload("big.bin").await.unwrap();
        let mut parts = Vec::new();
        for (number, chunk) in [(1, "aaa"), (2, "bb"), (3, "cccc")] {
            let etag = store
                .upload_part("big.bin", &upload_id, number, Bytes::from(chunk))
                .await
                .unwrap();
            parts.push(CompletedPart {
                part_number: number,
                etag,
            });
        }

        let info = store
            .complete_multipart_upload("big.bin", &upload_id, parts)
            .await
            .unwrap();
        assert_eq!(info.size, 9);
        assert!(info.etag.ends_with("-3"));

        let assembled = std::fs::read(dir.path().join("big.bin")).unwrap();
        assert_eq!(assembled, b"aaabbcccc");

        // handle released exactly once
        assert!(
            store
                .complete_multipart_upload("big.bin", &upload_id, Vec::new())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn failed_promote_keeps_upload_retryable() {
        let (dir, store) = store().await;

        let upload_id = store.create_multipart_upload("out.bin").await.unwrap();
        let etag = store
            .upload_part("out.bin", &upload_id, 1, Bytes::from_static(b"payload"))
            .await
            .unwrap();
        let parts = vec![CompletedPart {
            part_number: 1,
            etag,
        }];

        // a directory at the target path defeats both rename and copy
        std::fs::create_dir(dir.path().join("out.bin")).unwrap();
        assert!(
            store
                .complete_multipart_upload("out.bin", &upload_id, parts.clone())
                .await
                .is_err()
        );

        // the handle survives the failed promote, so once the obstruction
        // is gone the same upload id finalizes
        std::fs::remove_dir_all(dir.path().join("out.bin")).unwrap();
        let info = store
            .complete_multipart_upload("out.bin", &upload_id, parts)
            .await
            .unwrap();
        assert_eq!(info.size, 7);
        assert_eq!(
            std::fs::read(dir.path().join("out.bin")).unwrap(),
            b"payload"
        );
    }

    #[tokio::test]
    async fn abort_releases_upload_after_failed_promote() {
        let (dir, store) = store().await;

        let upload_id = store.create_multipart_upload("held.bin").await.unwrap();
        let etag = store
            .upload_part("held.bin", &upload_id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();

        std::fs::create_dir(dir.path().join("held.bin")).unwrap();
        assert!(
            store
                .complete_multipart_upload(
                    "held.bin",
                    &upload_id,
                    vec![CompletedPart {
                        part_number: 1,
                        etag,
                    }],
                )
                .await
                .is_err()
        );

        store
            .abort_multipart_upload("held.bin", &upload_id)
            .await
            .unwrap();
        let staging = dir
            .path()
            .join(SYS_DIR_NAME)
            .join(UPLOADS_DIR_NAME)
            .join(format!("{upload_id}.part"));
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn abort_removes_staging_file() {
        let (dir, store) = store().await;

        let upload_id = store.create_multipart_upload("gone.bin").await.unwrap();
        store
            .upload_part("gone.bin", &upload_id, 1, Bytes::from_static(b"data"))
            .await
            .unwrap();

        let staging = dir
            .path()
            .join(SYS_DIR_NAME)
            .join(UPLOADS_DIR_NAME)
            .join(format!("{upload_id}.part"));
        assert!(staging.exists());

        store
            .abort_multipart_upload("gone.bin", &upload_id)
            .await
            .unwrap();
        assert!(!staging.exists());
        assert!(!dir.path().join("gone.bin").exists());

        assert!(
            store
                .abort_multipart_upload("gone.bin", &upload_id)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let (_dir, store) = store().await;
        assert!(
            store
                .put_object("../escape.txt", Bytes::from_static(b"x"), None)
                .await
                .is_err()
        );
        assert!(store.list_dir("/../..").await.is_err());
    }
}
