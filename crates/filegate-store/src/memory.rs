//! In-memory backend. Hermetic stand-in for the remote store, used by the
//! coordinator and router tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use filegate_common::error::{FilegateError, Result};
use filegate_common::types::{CompletedPart, FileInfo, ObjectInfo, StorageUsage};
use md5::{Digest, Md5};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::traits::{ObjectStore, PartWriteDiscipline};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

struct PendingUpload {
    key: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, (ObjectInfo, Bytes)>>,
    uploads: RwLock<HashMap<String, PendingUpload>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn object_size(&self, key: &str) -> Option<i64> {
        self.objects.read().await.get(key).map(|(info, _)| info.size)
    }

    /// Number of multipart uploads whose backing resource has not been
    /// released yet.
    pub async fn pending_upload_count(&self) -> usize {
        self.uploads.read().await.len()
    }

    fn object_info(key: &str, data: &Bytes) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size: data.len() as i64,
            etag: format!("{:x}", Md5::digest(data)),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            last_modified: Utc::now(),
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn part_write_discipline(&self) -> PartWriteDiscipline {
        PartWriteDiscipline::Independent
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        _content_type: Option<&str>,
    ) -> Result<ObjectInfo> {
        let info = Self::object_info(key, &data);
        self.objects
            .write()
            .await
            .insert(key.to_string(), (info.clone(), data));
        Ok(info)
    }

    async fn get_object(&self, key: &str) -> Result<(ObjectInfo, Bytes)> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| FilegateError::ObjectNotFound(key.to_string()))
    }

    async fn stat_object(&self, key: &str) -> Result<ObjectInfo> {
        Ok(self.get_object(key).await?.0)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| FilegateError::ObjectNotFound(key.to_string()))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let trimmed = path.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };

        let objects = self.objects.read().await;
        let mut files = Vec::new();
        let mut dirs = Vec::new();

        for (key, (info, _)) in objects.iter() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    if !dirs.contains(&dir.to_string()) {
                        dirs.push(dir.to_string());
                    }
                }
                None => files.push(FileInfo {
                    name: rest.to_string(),
                    path: format!("/{key}"),
                    is_dir: false,
                    size: info.size,
                    modified: info.last_modified,
                }),
            }
        }

        let mut out: Vec<FileInfo> = dirs
            .into_iter()
            .map(|dir| FileInfo {
                path: format!("/{prefix}{dir}"),
                name: dir,
                is_dir: true,
                size: 0,
                modified: Utc::now(),
            })
            .collect();
        out.extend(files);
        out.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let upload_id = Uuid::new_v4().to_string();
        self.uploads.write().await.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String> {
        let etag = format!("{:x}", Md5::digest(&data));
        let mut uploads = self.uploads.write().await;
        let upload = uploads.get_mut(upload_id).ok_or_else(|| {
            FilegateError::InvalidArgument(format!("unknown upload id: {upload_id}"))
        })?;
        // A retry of the same part number replaces the previous chunk.
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo> {
        let mut uploads = self.uploads.write().await;
        let upload = uploads.remove(upload_id).ok_or_else(|| {
            FilegateError::InvalidArgument(format!("unknown upload id: {upload_id}"))
        })?;
        drop(uploads);

        let mut assembled = BytesMut::new();
        for part in &parts {
            let (etag, data) = upload.parts.get(&part.part_number).ok_or_else(|| {
                FilegateError::InvalidArgument(format!(
                    "part {} was never uploaded",
                    part.part_number
                ))
            })?;
            if etag != &part.etag {
                return Err(FilegateError::InvalidArgument(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            assembled.extend_from_slice(data);
        }

        debug_assert_eq!(key, upload.key);
        self.put_object(&upload.key, assembled.freeze(), None).await
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads
            .write()
            .await
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| {
                FilegateError::InvalidArgument(format!("unknown upload id: {upload_id}"))
            })
    }

    async fn presign_put(&self, _key: &str, _expires_secs: u64) -> Result<String> {
        Err(FilegateError::NotImplemented(
            "presigned uploads are not available on the in-memory backend".to_string(),
        ))
    }

    async fn usage(&self) -> Result<StorageUsage> {
        let objects = self.objects.read().await;
        let mut usage = StorageUsage::default();
        for (key, (info, _)) in objects.iter() {
            usage.total_objects += 1;
            usage.total_size += info.size;
            if info.size > usage.largest_file_size {
                usage.largest_file_size = info.size;
                usage.largest_file = Some(key.clone());
            }
        }
        Ok(usage)
    }
}
