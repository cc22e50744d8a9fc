use async_trait::async_trait;
use bytes::Bytes;
use filegate_common::error::Result;
use filegate_common::types::{CompletedPart, FileInfo, ObjectInfo, StorageUsage};

/// How part writes for one upload session may be interleaved.
///
/// The coordinator holds the session lock across `upload_part` only when the
/// backend demands serialized writes. Remote parts are independently
/// addressed by part number, so concurrent writes for one session are safe;
/// a staging file appended in arrival order is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartWriteDiscipline {
    /// Parts may be persisted concurrently for the same session.
    Independent,
    /// Part writes for one session must be serialized by the caller.
    Serialized,
}

/// Storage capability consumed by the gateway: single-shot object I/O,
/// directory-style listing, and the multipart primitives the upload
/// coordinator is built on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn part_write_discipline(&self) -> PartWriteDiscipline;

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<ObjectInfo>;
    async fn get_object(&self, key: &str) -> Result<(ObjectInfo, Bytes)>;
    async fn stat_object(&self, key: &str) -> Result<ObjectInfo>;
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Lists the immediate children of a directory-style path.
    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>>;

    /// Creates the backing resource for a chunked upload and returns its
    /// opaque handle. The handle is released exactly once, by
    /// `complete_multipart_upload` or `abort_multipart_upload`.
    async fn create_multipart_upload(&self, key: &str) -> Result<String>;

    /// Persists one part and returns its completion tag. Re-uploading a part
    /// number replaces the previous tag for backends with
    /// [`PartWriteDiscipline::Independent`].
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Presigned PUT URL for direct-to-store uploads. Backends without a
    /// presign concept return `NotImplemented`.
    async fn presign_put(&self, key: &str, expires_secs: u64) -> Result<String>;

    async fn usage(&self) -> Result<StorageUsage>;
}
