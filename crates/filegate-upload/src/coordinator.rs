//! Chunked upload coordination. Browsers slice a file into numbered parts
//! and send them concurrently; the coordinator records each persisted part
//! and finalizes the object when the set is complete.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use filegate_common::error::{FilegateError, Result};
use filegate_common::path::object_key;
use filegate_common::types::CompletedPart;
use filegate_store::traits::{ObjectStore, PartWriteDiscipline};
use tokio::sync::MutexGuard;
use tracing::{info, warn};
use uuid::Uuid;

use crate::session::{SessionRegistry, SessionState, UploadSession};

/// S3 caps multipart uploads at 10000 parts; the local backend inherits
/// the same bound so clients see one limit.
const MAX_PARTS: i32 = 10_000;

#[derive(Debug, Clone)]
pub struct InitiatedUpload {
    pub session_id: String,
    pub target_key: String,
    pub total_parts: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Progress {
        received: i32,
        total: i32,
        percent: f64,
    },
    Completed {
        path: String,
        size: i64,
    },
}

pub struct UploadCoordinator {
    store: Arc<dyn ObjectStore>,
    registry: Arc<SessionRegistry>,
}

impl UploadCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, registry: Arc<SessionRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn initiate(
        &self,
        dir_path: &str,
        file_name: &str,
        total_parts: i32,
        file_size: Option<i64>,
    ) -> Result<InitiatedUpload> {
        if total_parts < 1 {
            return Err(FilegateError::InvalidArgument(format!(
                "total_parts must be at least 1, got {total_parts}"
            )));
        }
        if total_parts > MAX_PARTS {
            return Err(FilegateError::InvalidArgument(format!(
                "total_parts exceeds the {MAX_PARTS} part limit"
            )));
        }

        let key = object_key(dir_path, file_name)?;
        let upload_id = self.store.create_multipart_upload(&key).await?;
        let session_id = Uuid::new_v4().to_string();
        self.registry.insert(
            session_id.clone(),
            UploadSession::new(key.clone(), upload_id.clone(), total_parts),
        );

        info!(
            session_id,
            upload_id,
            key,
            total_parts,
            file_size = file_size.unwrap_or(-1),
            "initiated chunked upload"
        );
        Ok(InitiatedUpload {
            session_id,
            target_key: key,
            total_parts,
        })
    }

    /// Persists one part and records it. Duplicate part numbers are
    /// accepted; the retry overwrites the earlier chunk at the store and
    /// the recorded etag is replaced.
    pub async fn receive_chunk(
        &self,
        session_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<ChunkOutcome> {
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| FilegateError::SessionNotFound(session_id.to_string()))?;

        match self.store.part_write_discipline() {
            PartWriteDiscipline::Independent => {
                // Part writes go to independent slots, so the session lock
                // is released for the duration of the store call and other
                // chunks of the same session proceed in parallel.
                let (key, upload_id) = {
                    let guard = session.lock().await;
                    Self::check_receiving(&guard, session_id)?;
                    Self::check_part_number(&guard, part_number)?;
                    (guard.target_key.clone(), guard.upload_id.clone())
                };

                let etag = self
                    .store
                    .upload_part(&key, &upload_id, part_number, data)
                    .await
                    .map_err(|err| FilegateError::ChunkPersistFailure {
                        part_number,
                        reason: err.to_string(),
                    })?;

                let mut guard = session.lock().await;
                // An abort may have won the race while the part was in
                // flight. The persisted bytes are orphaned at the store and
                // covered by its own cleanup.
                Self::check_receiving(&guard, session_id)?;
                guard.parts.insert(part_number, etag);
                self.record_progress(session_id, guard).await
            }
            PartWriteDiscipline::Serialized => {
                // Parts append to shared staging state, so the lock spans
                // the write itself.
                let mut guard = session.lock().await;
                Self::check_receiving(&guard, session_id)?;
                Self::check_part_number(&guard, part_number)?;

                let etag = self
                    .store
                    .upload_part(&guard.target_key, &guard.upload_id, part_number, data)
                    .await
                    .map_err(|err| FilegateError::ChunkPersistFailure {
                        part_number,
                        reason: err.to_string(),
                    })?;

                guard.parts.insert(part_number, etag);
                self.record_progress(session_id, guard).await
            }
        }
    }

    /// Removes the session and releases its backing upload. A release
    /// failure is logged and swallowed; the session is already gone and
    /// the orphaned upload is store-side garbage.
    pub async fn abort(&self, session_id: &str) -> Result<()> {
        let session = self
            .registry
            .remove(session_id)
            .ok_or_else(|| FilegateError::SessionNotFound(session_id.to_string()))?;

        let mut guard = session.lock().await;
        guard.state = SessionState::Aborted;

        if let Err(err) = self
            .store
            .abort_multipart_upload(&guard.target_key, &guard.upload_id)
            .await
        {
            let release = FilegateError::ResourceReleaseFailure {
                upload_id: guard.upload_id.clone(),
                reason: err.to_string(),
            };
            warn!(session_id, error = %release, "failed to release backing upload");
        }

        info!(session_id, key = %guard.target_key, "upload session aborted");
        Ok(())
    }

    /// Creation timestamps of all live sessions, for the expiry sweeper.
    pub async fn session_ages(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut ages = Vec::new();
        for (id, session) in self.registry.snapshot() {
            let guard = session.lock().await;
            ages.push((id, guard.created_at));
        }
        ages
    }

    fn check_receiving(guard: &UploadSession, session_id: &str) -> Result<()> {
        if guard.state != SessionState::Receiving {
            return Err(FilegateError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    fn check_part_number(guard: &UploadSession, part_number: i32) -> Result<()> {
        if part_number < 1 || part_number > guard.total_parts {
            return Err(FilegateError::InvalidArgument(format!(
                "part number {part_number} outside 1..={}",
                guard.total_parts
            )));
        }
        Ok(())
    }

    async fn record_progress(
        &self,
        session_id: &str,
        mut guard: MutexGuard<'_, UploadSession>,
    ) -> Result<ChunkOutcome> {
        let received = guard.received_count();
        let total = guard.total_parts;
        if received < total {
            return Ok(ChunkOutcome::Progress {
                received,
                total,
                percent: f64::from(received) / f64::from(total) * 100.0,
            });
        }

        // Counting alone cannot be trusted, a stray part number would let
        // a short set look complete. Finalize only on the contiguous set.
        let missing = guard.missing_parts();
        if !missing.is_empty() {
            return Err(FilegateError::InvalidArgument(format!(
                "part count reached {total} but parts {missing:?} were never received"
            )));
        }

        let parts: Vec<CompletedPart> = guard
            .parts
            .iter()
            .map(|(&part_number, etag)| CompletedPart {
                part_number,
                etag: etag.clone(),
            })
            .collect();

        let completed = self
            .store
            .complete_multipart_upload(&guard.target_key, &guard.upload_id, parts)
            .await
            .map_err(|err| FilegateError::FinalizeFailure(err.to_string()))?;

        // Remove before the session lock drops so no late chunk can find
        // the session and observe a half-finalized state.
        self.registry.remove(session_id);
        guard.state = SessionState::Completed;

        info!(
            session_id,
            key = %guard.target_key,
            size = completed.size,
            "chunked upload completed"
        );
        Ok(ChunkOutcome::Completed {
            path: format!("/{}", guard.target_key),
            size: completed.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use filegate_common::types::{FileInfo, ObjectInfo, StorageUsage};
    use filegate_store::memory::InMemoryObjectStore;
    use filegate_store::mount::MountStore;

    fn memory_coordinator() -> (Arc<InMemoryObjectStore>, Arc<UploadCoordinator>) {
        let store = Arc::new(InMemoryObjectStore::new());
        let coordinator = Arc::new(UploadCoordinator::new(
            store.clone(),
            Arc::new(SessionRegistry::new()),
        ));
        (store, coordinator)
    }

    /// Delegating store that fails a configurable number of part writes
    /// and completions before recovering.
    struct FlakyStore {
        inner: InMemoryObjectStore,
        part_failures: AtomicUsize,
        complete_failures: AtomicUsize,
    }

    impl FlakyStore {
        fn new(part_failures: usize, complete_failures: usize) -> Self {
            Self {
                inner: InMemoryObjectStore::new(),
                part_failures: AtomicUsize::new(part_failures),
                complete_failures: AtomicUsize::new(complete_failures),
            }
        }

        fn take(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        fn part_write_discipline(&self) -> PartWriteDiscipline {
            PartWriteDiscipline::Independent
        }

        async fn put_object(
            &self,
            key: &str,
            data: Bytes,
            content_type: Option<&str>,
        ) -> Result<ObjectInfo> {
            self.inner.put_object(key, data, content_type).await
        }

        async fn get_object(&self, key: &str) -> Result<(ObjectInfo, Bytes)> {
            self.inner.get_object(key).await
        }

        async fn stat_object(&self, key: &str) -> Result<ObjectInfo> {
            self.inner.stat_object(key).await
        }

        async fn delete_object(&self, key: &str) -> Result<()> {
            self.inner.delete_object(key).await
        }

        async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
            self.inner.list_dir(path).await
        }

        async fn create_multipart_upload(&self, key: &str) -> Result<String> {
            self.inner.create_multipart_upload(key).await
        }

        async fn upload_part(
            &self,
            key: &str,
            upload_id: &str,
            part_number: i32,
            data: Bytes,
        ) -> Result<String> {
            if Self::take(&self.part_failures) {
                return Err(FilegateError::InternalError("injected write fault".into()));
            }
            self.inner.upload_part(key, upload_id, part_number, data).await
        }

        async fn complete_multipart_upload(
            &self,
            key: &str,
            upload_id: &str,
            parts: Vec<CompletedPart>,
        ) -> Result<ObjectInfo> {
            if Self::take(&self.complete_failures) {
                return Err(FilegateError::InternalError(
                    "injected completion fault".into(),
                ));
            }
            self.inner
                .complete_multipart_upload(key, upload_id, parts)
                .await
        }

        async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
            self.inner.abort_multipart_upload(key, upload_id).await
        }

        async fn presign_put(&self, key: &str, expires_secs: u64) -> Result<String> {
            self.inner.presign_put(key, expires_secs).await
        }

        async fn usage(&self) -> Result<StorageUsage> {
            self.inner.usage().await
        }
    }

    #[tokio::test]
    async fn out_of_order_parts_assemble_in_numbered_order() {
        let (store, coordinator) = memory_coordinator();
        let initiated = coordinator
            .initiate("docs", "report.bin", 3, Some(9))
            .await
            .unwrap();
        assert_eq!(initiated.target_key, "docs/report.bin");

        let outcome = coordinator
            .receive_chunk(&initiated.session_id, 3, Bytes::from_static(b"cccc"))
            .await
            .unwrap();
        match outcome {
            ChunkOutcome::Progress {
                received, total, percent,
            } => {
                assert_eq!((received, total), (1, 3));
                assert!((percent - 33.33).abs() < 0.5);
            }
            other => panic!("expected progress, got {other:?}"),
        }

        coordinator
            .receive_chunk(&initiated.session_id, 1, Bytes::from_static(b"aaa"))
            .await
            .unwrap();
        let outcome = coordinator
            .receive_chunk(&initiated.session_id, 2, Bytes::from_static(b"bb"))
            .await
            .unwrap();
        match outcome {
            ChunkOutcome::Completed { path, size } => {
                assert_eq!(path, "/docs/report.bin");
                assert_eq!(size, 9);
            }
            other => panic!("expected completion, got {other:?}"),
        }

        let (_, data) = store.get_object("docs/report.bin").await.unwrap();
        assert_eq!(&data[..], b"aaabbcccc");
        assert!(coordinator.registry().is_empty());
        assert_eq!(store.pending_upload_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_part_does_not_advance_progress() {
        let (_, coordinator) = memory_coordinator();
        let initiated = coordinator.initiate("", "f.bin", 2, None).await.unwrap();

        coordinator
            .receive_chunk(&initiated.session_id, 1, Bytes::from_static(b"first"))
            .await
            .unwrap();
        let outcome = coordinator
            .receive_chunk(&initiated.session_id, 1, Bytes::from_static(b"retry"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ChunkOutcome::Progress {
                received: 1,
                total: 2,
                percent: 50.0,
            }
        );
    }

    #[tokio::test]
    async fn part_numbers_outside_declared_range_are_rejected() {
        let (_, coordinator) = memory_coordinator();
        let initiated = coordinator.initiate("", "f.bin", 2, None).await.unwrap();

        for bad in [0, -1, 3] {
            let err = coordinator
                .receive_chunk(&initiated.session_id, bad, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert!(matches!(err, FilegateError::InvalidArgument(_)));
        }

        // rejections never count toward completion
        coordinator
            .receive_chunk(&initiated.session_id, 1, Bytes::from_static(b"a"))
            .await
            .unwrap();
        assert_eq!(coordinator.registry().len(), 1);
    }

    #[tokio::test]
    async fn initiate_validates_part_count() {
        let (_, coordinator) = memory_coordinator();
        for bad in [0, -5, MAX_PARTS + 1] {
            let err = coordinator.initiate("", "f.bin", bad, None).await.unwrap_err();
            assert!(matches!(err, FilegateError::InvalidArgument(_)));
        }
    }

    #[tokio::test]
    async fn completed_session_is_gone() {
        let (_, coordinator) = memory_coordinator();
        let initiated = coordinator.initiate("", "f.bin", 1, None).await.unwrap();
        coordinator
            .receive_chunk(&initiated.session_id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();

        let err = coordinator
            .receive_chunk(&initiated.session_id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FilegateError::SessionNotFound(_)));
        let err = coordinator.abort(&initiated.session_id).await.unwrap_err();
        assert!(matches!(err, FilegateError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn abort_releases_backing_upload() {
        let (store, coordinator) = memory_coordinator();
        let initiated = coordinator.initiate("", "f.bin", 3, None).await.unwrap();
        coordinator
            .receive_chunk(&initiated.session_id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();

        coordinator.abort(&initiated.session_id).await.unwrap();
        assert!(coordinator.registry().is_empty());
        assert_eq!(store.pending_upload_count().await, 0);

        let err = coordinator
            .receive_chunk(&initiated.session_id, 2, Bytes::from_static(b"y"))
            .await
            .unwrap_err();
        assert!(matches!(err, FilegateError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn abort_before_any_chunk_releases_backing_upload() {
        let (store, coordinator) = memory_coordinator();
        let initiated = coordinator.initiate("", "f.bin", 3, None).await.unwrap();
        assert_eq!(store.pending_upload_count().await, 1);

        coordinator.abort(&initiated.session_id).await.unwrap();
        assert!(coordinator.registry().is_empty());
        assert_eq!(store.pending_upload_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_sessions_do_not_interfere() {
        let (store, coordinator) = memory_coordinator();
        let a = coordinator.initiate("", "a.bin", 2, None).await.unwrap();
        let b = coordinator.initiate("", "b.bin", 1, None).await.unwrap();

        coordinator
            .receive_chunk(&a.session_id, 1, Bytes::from_static(b"a1"))
            .await
            .unwrap();
        let outcome = coordinator
            .receive_chunk(&b.session_id, 1, Bytes::from_static(b"b1"))
            .await
            .unwrap();
        assert!(matches!(outcome, ChunkOutcome::Completed { .. }));

        // a is still mid-flight
        assert_eq!(coordinator.registry().len(), 1);
        coordinator
            .receive_chunk(&a.session_id, 2, Bytes::from_static(b"a2"))
            .await
            .unwrap();

        assert_eq!(store.object_size("a.bin").await, Some(4));
        assert_eq!(store.object_size("b.bin").await, Some(2));
    }

    #[tokio::test]
    async fn failed_part_write_is_retryable() {
        let store = Arc::new(FlakyStore::new(1, 0));
        let coordinator =
            UploadCoordinator::new(store.clone(), Arc::new(SessionRegistry::new()));
        let initiated = coordinator.initiate("", "f.bin", 1, None).await.unwrap();

        let err = coordinator
            .receive_chunk(&initiated.session_id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FilegateError::ChunkPersistFailure { part_number: 1, .. }));
        assert!(err.is_retryable());

        // the session survived the fault, a retry of the same part lands
        let outcome = coordinator
            .receive_chunk(&initiated.session_id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(matches!(outcome, ChunkOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn failed_finalize_keeps_session_for_retry() {
        let store = Arc::new(FlakyStore::new(0, 1));
        let coordinator =
            UploadCoordinator::new(store.clone(), Arc::new(SessionRegistry::new()));
        let initiated = coordinator.initiate("", "f.bin", 2, None).await.unwrap();

        coordinator
            .receive_chunk(&initiated.session_id, 1, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        let err = coordinator
            .receive_chunk(&initiated.session_id, 2, Bytes::from_static(b"cd"))
            .await
            .unwrap_err();
        assert!(matches!(err, FilegateError::FinalizeFailure(_)));
        assert_eq!(coordinator.registry().len(), 1);

        // resending the last part drives finalization again
        let outcome = coordinator
            .receive_chunk(&initiated.session_id, 2, Bytes::from_static(b"cd"))
            .await
            .unwrap();
        match outcome {
            ChunkOutcome::Completed { size, .. } => assert_eq!(size, 4),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn racing_chunks_produce_one_completion() {
        let (store, coordinator) = memory_coordinator();
        let initiated = coordinator.initiate("", "race.bin", 4, None).await.unwrap();

        let mut tasks = Vec::new();
        for part in 1..=4 {
            let coordinator = coordinator.clone();
            let session_id = initiated.session_id.clone();
            tasks.push(tokio::spawn(async move {
                coordinator
                    .receive_chunk(&session_id, part, Bytes::from(vec![part as u8; 8]))
                    .await
            }));
        }

        let mut completions = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(ChunkOutcome::Completed { .. }) => completions += 1,
                Ok(ChunkOutcome::Progress { .. }) => {}
                Err(err) => panic!("chunk failed: {err}"),
            }
        }
        assert_eq!(completions, 1);
        assert_eq!(store.object_size("race.bin").await, Some(32));
        assert!(coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn serialized_backend_assembles_through_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MountStore::new(dir.path().to_path_buf()).await.unwrap());
        assert!(matches!(
            store.part_write_discipline(),
            PartWriteDiscipline::Serialized
        ));
        let coordinator =
            UploadCoordinator::new(store.clone(), Arc::new(SessionRegistry::new()));

        let initiated = coordinator.initiate("media", "clip.bin", 2, None).await.unwrap();
        coordinator
            .receive_chunk(&initiated.session_id, 1, Bytes::from_static(b"hel"))
            .await
            .unwrap();
        let outcome = coordinator
            .receive_chunk(&initiated.session_id, 2, Bytes::from_static(b"lo"))
            .await
            .unwrap();
        assert!(matches!(outcome, ChunkOutcome::Completed { .. }));

        let (_, data) = store.get_object("media/clip.bin").await.unwrap();
        assert_eq!(&data[..], b"hello");
    }
}
