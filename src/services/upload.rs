//! Upload orchestration: validate, place, store, register, signal replicas.

use crate::{
    models::{
        file::{FileRecord, FileVersion},
        node::WriteDecision,
        requester::Requester,
        stored_object::StoredObject,
    },
    services::{
        chunk_assembler::Chunk,
        cluster::{
            PlacementError, ReplicationContext, ReplicationPlanner,
            replication::ReplicationFanout,
        },
        metadata::{MetadataError, MetadataStore, NewFile},
        security::{ScanVerdict, UploadLimits, ValidationError, scan_upload, validate_upload},
        storage::{ByteStream, StorageError, StorageService, build_storage_key},
    },
};
use bytes::Bytes;
use futures::{StreamExt, future};
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("file failed security checks: {0}")]
    Rejected(String),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

pub enum UploadBody {
    Buffered(Bytes),
    Chunked(Vec<Chunk>),
    Streamed(ByteStream),
}

pub struct UploadInput {
    pub file_name: String,
    pub mime_type: String,
    pub folder_id: Option<String>,
    pub expected_checksum: Option<String>,
    pub body: UploadBody,
}

pub struct UploadOutcome {
    pub file: FileRecord,
    pub version: FileVersion,
    pub decision: WriteDecision,
    /// In-flight replication signals. Safe to drop.
    pub replication: ReplicationFanout,
}

#[derive(Clone)]
pub struct UploadService {
    storage: StorageService,
    metadata: MetadataStore,
    planner: ReplicationPlanner,
    limits: UploadLimits,
}

impl UploadService {
    pub fn new(
        storage: StorageService,
        metadata: MetadataStore,
        planner: ReplicationPlanner,
        limits: UploadLimits,
    ) -> Self {
        Self {
            storage,
            metadata,
            planner,
            limits,
        }
    }

    /// Store a new file and register it with version 1.
    pub async fn upload(
        &self,
        requester: &Requester,
        input: UploadInput,
    ) -> Result<UploadOutcome, UploadError> {
        let new_file = NewFile {
            owner_id: requester.user_id.clone(),
            folder_id: input.folder_id.clone(),
            name: input.file_name.clone(),
            mime_type: Some(input.mime_type.clone()),
        };
        self.run(requester, input, |metadata, stored| async move {
            metadata.create_file_with_version(new_file, &stored).await
        })
        .await
    }

    /// Store new content for an existing file and make it current.
    pub async fn upload_version(
        &self,
        file_id: Uuid,
        requester: &Requester,
        input: UploadInput,
    ) -> Result<UploadOutcome, UploadError> {
        let requester_owned = requester.clone();
        self.run(requester, input, |metadata, stored| async move {
            metadata
                .append_version(file_id, &requester_owned, &stored)
                .await
        })
        .await
    }

    async fn run<F, Fut>(
        &self,
        requester: &Requester,
        input: UploadInput,
        register: F,
    ) -> Result<UploadOutcome, UploadError>
    where
        F: FnOnce(MetadataStore, StoredObject) -> Fut,
        Fut: Future<Output = Result<(FileRecord, FileVersion), MetadataError>>,
    {
        let UploadInput {
            file_name,
            mime_type,
            expected_checksum,
            body,
            ..
        } = input;

        let known_size = match &body {
            UploadBody::Buffered(data) => Some(data.len() as u64),
            UploadBody::Chunked(chunks) => Some(chunks.iter().map(|c| c.bytes.len() as u64).sum()),
            UploadBody::Streamed(_) => None,
        };
        validate_upload(&file_name, &mime_type, known_size, self.limits)?;

        if let UploadBody::Buffered(data) = &body {
            if let ScanVerdict::Infected { reason } = scan_upload(&file_name, data).await {
                warn!(file_name = %file_name, reason = %reason, "upload rejected by scanner");
                return Err(UploadError::Rejected(reason));
            }
        }

        let key = build_storage_key(&requester.user_id, &file_name);
        let decision = self.planner.decide_write_placement(&key).await?;
        if !decision.handled_locally {
            info!(
                storage_key = %key,
                primary = %decision.primary_id,
                "Primary is a peer; storing locally and signalling"
            );
        }

        let content_type = Some(mime_type.as_str());
        let expected = expected_checksum.as_deref();
        let stored = match body {
            UploadBody::Buffered(data) => {
                self.storage.store(&key, data, content_type, expected).await?
            }
            UploadBody::Chunked(chunks) => {
                self.storage
                    .store_chunks(&key, chunks, content_type, expected)
                    .await?
            }
            UploadBody::Streamed(stream) => {
                self.store_capped(&key, stream, content_type, expected).await?
            }
        };

        info!(
            storage_key = %stored.storage_key,
            bytes = stored.size_bytes,
            driver = self.storage.backend().driver(),
            "Upload stored"
        );

        let (file, version) = match register(self.metadata.clone(), stored.clone()).await {
            Ok(registered) => registered,
            Err(e) => {
                self.discard(&stored.storage_key).await;
                return Err(e.into());
            }
        };

        let replication = self
            .planner
            .trigger_replication(
                &decision,
                ReplicationContext {
                    storage_key: stored.storage_key,
                    mime_type: file.mime_type.clone(),
                    size_bytes: stored.size_bytes,
                },
            )
            .await;

        Ok(UploadOutcome {
            file,
            version,
            decision,
            replication,
        })
    }

    /// Stream into storage, cutting the source off once it passes the size
    /// limit. An empty stream is stored and then discarded.
    async fn store_capped(
        &self,
        key: &str,
        stream: ByteStream,
        content_type: Option<&str>,
        expected: Option<&str>,
    ) -> Result<StoredObject, UploadError> {
        let max = self.limits.max_size_bytes;
        let exceeded = Arc::new(AtomicBool::new(false));
        let flag = exceeded.clone();

        let capped = stream.scan(0u64, move |seen, item| {
            let item = item.and_then(|chunk| {
                *seen += chunk.len() as u64;
                if *seen > max {
                    flag.store(true, Ordering::Relaxed);
                    Err(io::Error::other("upload exceeds the size limit"))
                } else {
                    Ok(chunk)
                }
            });
            future::ready(Some(item))
        });

        let stored = match self
            .storage
            .store_stream(key, capped, content_type, expected)
            .await
        {
            Ok(stored) => stored,
            Err(StorageError::SourceInterrupted(_)) if exceeded.load(Ordering::Relaxed) => {
                return Err(self.limits.too_large().into());
            }
            Err(e) => return Err(e.into()),
        };

        if stored.size_bytes == 0 {
            self.discard(key).await;
            return Err(ValidationError::Empty.into());
        }
        Ok(stored)
    }

    async fn discard(&self, key: &str) {
        if let Err(e) = self.storage.backend().delete(key).await {
            warn!(storage_key = %key, error = %e, "failed to discard unregistered object");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        checksum,
        cluster::{LeaseStore, MemoryLeaseStore, NodeRegistry, PlacementService},
        metadata::tests::memory_store,
        storage::{ObjectStoreBackend, StorageBackend},
    };
    use futures::{TryStreamExt, stream};
    use object_store::memory::InMemory;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    struct Harness {
        uploads: UploadService,
        storage: StorageService,
        metadata: MetadataStore,
    }

    async fn harness_with(registry: NodeRegistry, limits: UploadLimits) -> Harness {
        let storage = StorageService::new(StorageBackend::ObjectStore(ObjectStoreBackend::new(
            Arc::new(InMemory::new()),
        )));
        let metadata = memory_store().await;
        let planner = ReplicationPlanner::new(
            PlacementService::new(Arc::new(registry), 2),
            reqwest::Client::new(),
        );
        Harness {
            uploads: UploadService::new(storage.clone(), metadata.clone(), planner, limits),
            storage,
            metadata,
        }
    }

    async fn harness() -> Harness {
        harness_with(NodeRegistry::new("A", &[], None), UploadLimits::default()).await
    }

    fn input(name: &str, body: UploadBody) -> UploadInput {
        UploadInput {
            file_name: name.to_string(),
            mime_type: "text/plain".to_string(),
            folder_id: None,
            expected_checksum: None,
            body,
        }
    }

    async fn read(storage: &StorageService, key: &str) -> Vec<u8> {
        let reader = storage.retrieve(key).await.unwrap();
        let parts: Vec<Bytes> = reader.stream.try_collect().await.unwrap();
        parts.concat()
    }

    async fn file_count(metadata: &MetadataStore) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
            .fetch_one(&*metadata.db)
            .await
            .unwrap();
        count
    }

    #[tokio::test]
    async fn buffered_upload_is_stored_and_registered() {
        let h = harness().await;
        let body = Bytes::from_static(b"hello world");
        let mut request = input("doc.txt", UploadBody::Buffered(body.clone()));
        request.expected_checksum = Some(checksum::hash(&body));

        let outcome = h.uploads.upload(&Requester::user("u1"), request).await.unwrap();

        assert_eq!(outcome.file.owner_id, "u1");
        assert_eq!(outcome.version.version_number, 1);
        assert_eq!(outcome.version.checksum, checksum::hash(b"hello world"));
        assert!(outcome.version.storage_key.starts_with("user/u1/uploads/"));
        assert!(outcome.decision.handled_locally);
        assert!(outcome.replication.is_empty());
        assert_eq!(read(&h.storage, &outcome.version.storage_key).await, b"hello world");
    }

    #[tokio::test]
    async fn invalid_uploads_store_nothing() {
        let h = harness().await;
        let requester = Requester::user("u1");

        let err = h
            .uploads
            .upload(&requester, input("../evil", UploadBody::Buffered(Bytes::from_static(b"x"))))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UploadError::Invalid(ValidationError::UnsafeFileName)));

        let mut html = input("page.html", UploadBody::Buffered(Bytes::from_static(b"<p>")));
        html.mime_type = "text/html".to_string();
        let err = h.uploads.upload(&requester, html).await.err().unwrap();
        assert!(matches!(err, UploadError::Invalid(ValidationError::UnsupportedMimeType(_))));

        let err = h
            .uploads
            .upload(&requester, input("empty.txt", UploadBody::Buffered(Bytes::new())))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UploadError::Invalid(ValidationError::Empty)));

        assert_eq!(file_count(&h.metadata).await, 0);
    }

    #[tokio::test]
    async fn checksum_mismatch_registers_nothing() {
        let h = harness().await;
        let mut request = input("doc.txt", UploadBody::Buffered(Bytes::from_static(b"hello")));
        request.expected_checksum = Some(checksum::hash(b"hellO"));

        let err = h.uploads.upload(&Requester::user("u1"), request).await.err().unwrap();
        assert!(matches!(err, UploadError::Storage(StorageError::ChecksumMismatch { .. })));
        assert_eq!(file_count(&h.metadata).await, 0);
    }

    #[tokio::test]
    async fn scanner_rejection_registers_nothing() {
        let h = harness().await;
        let eicar = Bytes::from_static(
            br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*",
        );
        let err = h
            .uploads
            .upload(&Requester::user("u1"), input("eicar.txt", UploadBody::Buffered(eicar)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UploadError::Rejected(_)));
        assert_eq!(file_count(&h.metadata).await, 0);
    }

    #[tokio::test]
    async fn chunked_upload_is_assembled_by_index() {
        let h = harness().await;
        let chunks = vec![
            Chunk::new(2, Bytes::from_static(b"world")),
            Chunk::new(0, Bytes::from_static(b"hello")),
            Chunk::new(1, Bytes::from_static(b" ")),
        ];
        let outcome = h
            .uploads
            .upload(&Requester::user("u1"), input("hw.txt", UploadBody::Chunked(chunks)))
            .await
            .unwrap();

        assert_eq!(outcome.version.size_bytes, 11);
        assert_eq!(read(&h.storage, &outcome.version.storage_key).await, b"hello world");
    }

    #[tokio::test]
    async fn streamed_upload_respects_size_limit() {
        let limits = UploadLimits { max_size_bytes: 8 };
        let h = harness_with(NodeRegistry::new("A", &[], None), limits).await;
        let requester = Requester::user("u1");

        let small = stream::iter(vec![Ok(Bytes::from_static(b"1234")), Ok(Bytes::from_static(b"5678"))]);
        let outcome = h
            .uploads
            .upload(&requester, input("ok.txt", UploadBody::Streamed(small.boxed())))
            .await
            .unwrap();
        assert_eq!(outcome.version.size_bytes, 8);

        let big = stream::iter(vec![Ok(Bytes::from_static(b"12345")), Ok(Bytes::from_static(b"6789"))]);
        let err = h
            .uploads
            .upload(&requester, input("big.txt", UploadBody::Streamed(big.boxed())))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UploadError::Invalid(ValidationError::TooLarge { .. })));

        let empty = stream::empty::<io::Result<Bytes>>();
        let err = h
            .uploads
            .upload(&requester, input("none.txt", UploadBody::Streamed(empty.boxed())))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UploadError::Invalid(ValidationError::Empty)));

        assert_eq!(file_count(&h.metadata).await, 1);
    }

    #[tokio::test]
    async fn new_version_becomes_current() {
        let h = harness().await;
        let owner = Requester::user("u1");
        let first = h
            .uploads
            .upload(&owner, input("doc.txt", UploadBody::Buffered(Bytes::from_static(b"v1"))))
            .await
            .unwrap();

        let second = h
            .uploads
            .upload_version(
                first.file.id,
                &owner,
                input("doc.txt", UploadBody::Buffered(Bytes::from_static(b"v2!"))),
            )
            .await
            .unwrap();
        assert_eq!(second.version.version_number, 2);
        assert_eq!(second.file.current_version_id, Some(second.version.id));
        assert_eq!(second.file.size_bytes, Some(3));
    }

    #[tokio::test]
    async fn stranger_cannot_add_version_and_object_is_discarded() {
        let h = harness().await;
        let first = h
            .uploads
            .upload(
                &Requester::user("u1"),
                input("doc.txt", UploadBody::Buffered(Bytes::from_static(b"v1"))),
            )
            .await
            .unwrap();

        let err = h
            .uploads
            .upload_version(
                first.file.id,
                &Requester::user("u2"),
                input("doc.txt", UploadBody::Buffered(Bytes::from_static(b"x"))),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UploadError::Metadata(MetadataError::FileNotFound)));
    }

    #[tokio::test]
    async fn clustered_upload_signals_replica() {
        let replica = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/replicate"))
            .respond_with(ResponseTemplate::new(202))
            .expect(0..=1)
            .mount(&replica)
            .await;

        let lease: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
        // With two nodes and factor 2 every key lands on both.
        let registry = NodeRegistry::new("A", &[format!("B@{}", replica.uri())], Some(lease));
        let h = harness_with(registry, UploadLimits::default()).await;

        let outcome = h
            .uploads
            .upload(
                &Requester::user("u1"),
                input("doc.txt", UploadBody::Buffered(Bytes::from_static(b"hello"))),
            )
            .await
            .unwrap();

        let mut involved = outcome.decision.replica_ids.clone();
        involved.push(outcome.decision.primary_id.clone());
        involved.sort();
        assert_eq!(involved, ["A", "B"]);

        // The peer is signalled only when it is the replica; the local node
        // never signals itself.
        let peer_is_replica = outcome.decision.replica_ids == ["B"];
        let outcomes = outcome.replication.join().await;
        if peer_is_replica {
            assert_eq!(outcomes.len(), 1);
            assert!(outcomes[0].delivered);
        } else {
            assert!(outcomes.is_empty());
        }
    }
}
