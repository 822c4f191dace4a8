use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;

use trib_types::{
    DocumentId, LogRecord, Offset, OperationKind, PartitionId, Product, StoredDocument, TribError,
};

use crate::keys::{
    cursor_key, document_key, meta_key, name_index_id, name_index_key, name_index_prefix,
    partition_head_key, record_key, record_key_offset,
};
use crate::traits::{DocumentStore, MessageLog};
use crate::types::{PersistedDocument, PersistedRecord};

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, TribError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| TribError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, TribError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| TribError::Storage(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> TribError {
    TribError::Storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> TribError {
    TribError::Storage(e.to_string())
}

fn lock(m: &Mutex<()>) -> Result<MutexGuard<'_, ()>, TribError> {
    m.lock().map_err(|_| TribError::Storage("write lock poisoned".into()))
}

fn check_name(name: &str) -> Result<(), TribError> {
    if name.contains('\0') {
        return Err(TribError::InvalidArgument("name must not contain NUL".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// FjallStore: shared handle wrapping all keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// The log and the document collection live in one fjall `Database` so a
/// single data directory holds the whole node state and write batches stay
/// atomic within each side.
pub struct FjallStore {
    /// The underlying fjall database.
    pub db: fjall::Database,
    /// Log records: `partition(4) ++ offset(8)` → bincode(PersistedRecord)
    pub log_records: fjall::Keyspace,
    /// Group cursors: `group_utf8 ++ \x00 ++ partition(4)` → bincode(u64)
    pub log_cursors: fjall::Keyspace,
    /// Documents: `id(8)` → bincode(PersistedDocument)
    pub documents: fjall::Keyspace,
    /// Natural-key index: `name_utf8 ++ \x00 ++ id(8)` → b""
    pub doc_names: fjall::Keyspace,
    /// Partition heads, next document id, partition count.
    pub meta: fjall::Keyspace,
    partitions: u32,
    /// Serializes offset assignment across appends.
    append_lock: Mutex<()>,
    /// Serializes id assignment and index maintenance across document writes.
    doc_lock: Mutex<()>,
    appends: watch::Sender<u64>,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path` with `partitions` log
    /// partitions. Reopening with a different partition count is rejected.
    pub fn open(path: &Path, partitions: u32) -> Result<Arc<Self>, TribError> {
        if partitions == 0 {
            return Err(TribError::InvalidArgument("partition count must be positive".into()));
        }
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let log_records = db
            .keyspace("log_records", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        let log_cursors = db
            .keyspace("log_cursors", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        let documents =
            db.keyspace("documents", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let doc_names =
            db.keyspace("doc_names", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta = db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;

        match meta.get(meta_key("partitions")).map_err(fjall_err)? {
            Some(b) => {
                let stored = decode::<u32>(&b)?;
                if stored != partitions {
                    return Err(TribError::InvalidArgument(format!(
                        "log was created with {stored} partitions, configured {partitions}"
                    )));
                }
            }
            None => meta.insert(meta_key("partitions"), encode(&partitions)?).map_err(fjall_err)?,
        }

        tracing::debug!(path = %path.display(), partitions, "fjall store opened");
        let (appends, _) = watch::channel(0);
        Ok(Arc::new(FjallStore {
            db,
            log_records,
            log_cursors,
            documents,
            doc_names,
            meta,
            partitions,
            append_lock: Mutex::new(()),
            doc_lock: Mutex::new(()),
            appends,
        }))
    }

    fn check_partition(&self, partition: PartitionId) -> Result<(), TribError> {
        if partition >= self.partitions {
            return Err(TribError::InvalidArgument(format!("unknown partition {partition}")));
        }
        Ok(())
    }

    /// Id of the earliest document indexed under `name`.
    fn first_id(&self, name: &str) -> Result<Option<(DocumentId, Vec<u8>)>, TribError> {
        let mut iter = self.doc_names.prefix(name_index_prefix(name));
        match iter.next() {
            None => Ok(None),
            Some(guard) => {
                let (k, _) = guard.into_inner().map_err(fjall_err)?;
                let id = name_index_id(&k[..])
                    .ok_or_else(|| TribError::Storage("malformed name index key".into()))?;
                Ok(Some((id, k.to_vec())))
            }
        }
    }

    fn load_document(&self, id: DocumentId) -> Result<StoredDocument, TribError> {
        let bytes = self
            .documents
            .get(document_key(id))
            .map_err(fjall_err)?
            .ok_or_else(|| TribError::Storage(format!("name index points at missing document {id}")))?;
        let doc = decode::<PersistedDocument>(&bytes)?;
        Ok(StoredDocument { id, operation: doc.operation, data: doc.data })
    }
}

// ---------------------------------------------------------------------------
// FjallMessageLog
// ---------------------------------------------------------------------------

/// `MessageLog` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
pub struct FjallMessageLog(pub Arc<FjallStore>);

impl MessageLog for FjallMessageLog {
    fn partition_count(&self) -> u32 {
        self.0.partitions
    }

    async fn append(&self, partition: PartitionId, value: Vec<u8>) -> Result<Offset, TribError> {
        self.0.check_partition(partition)?;
        let store = self.0.clone();
        let offset = tokio::task::spawn_blocking(move || -> Result<Offset, TribError> {
            let _guard = lock(&store.append_lock)?;
            let head = match store.meta.get(partition_head_key(partition)).map_err(fjall_err)? {
                Some(b) => decode::<u64>(&b)?,
                None => 0,
            };
            let record = PersistedRecord { value, appended_at_ns: now_ns() };
            let mut batch = store.db.batch();
            batch.insert(&store.log_records, record_key(partition, head).to_vec(), encode(&record)?);
            batch.insert(&store.meta, partition_head_key(partition), encode(&(head + 1))?);
            batch.commit().map_err(fjall_err)?;
            Ok(head)
        })
        .await
        .map_err(join_err)??;

        self.0.appends.send_modify(|n| *n += 1);
        Ok(offset)
    }

    async fn read(
        &self,
        partition: PartitionId,
        from_offset: Offset,
        max: usize,
    ) -> Result<Vec<LogRecord>, TribError> {
        self.0.check_partition(partition)?;
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LogRecord>, TribError> {
            let start = record_key(partition, from_offset).to_vec();
            let end = record_key(partition, u64::MAX).to_vec();
            store
                .log_records
                .range(start..=end)
                .take(max)
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(k, v)| {
                        let offset = record_key_offset(&k[..])
                            .ok_or_else(|| TribError::Storage("short log record key".into()))?;
                        let record = decode::<PersistedRecord>(&v)?;
                        Ok(LogRecord {
                            partition,
                            offset,
                            value: record.value,
                            appended_at_ns: record.appended_at_ns,
                        })
                    })
                })
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn committed(&self, group: &str, partition: PartitionId) -> Result<Option<Offset>, TribError> {
        let store = self.0.clone();
        let key = cursor_key(group, partition);
        tokio::task::spawn_blocking(move || -> Result<Option<Offset>, TribError> {
            match store.log_cursors.get(key).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode::<u64>(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn commit(
        &self,
        group: &str,
        partition: PartitionId,
        next_offset: Offset,
    ) -> Result<(), TribError> {
        self.0.check_partition(partition)?;
        let store = self.0.clone();
        let key = cursor_key(group, partition);
        tokio::task::spawn_blocking(move || -> Result<(), TribError> {
            // One consumer owns a group/partition at a time, so the
            // read-compare-write below does not race with itself.
            let current = match store.log_cursors.get(&key).map_err(fjall_err)? {
                Some(b) => decode::<u64>(&b)?,
                None => 0,
            };
            if next_offset > current {
                store.log_cursors.insert(key, encode(&next_offset)?).map_err(fjall_err)?;
            }
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    fn subscribe_appends(&self) -> watch::Receiver<u64> {
        self.0.appends.subscribe()
    }
}

// ---------------------------------------------------------------------------
// FjallDocumentStore
// ---------------------------------------------------------------------------

/// `DocumentStore` backed by fjall.
pub struct FjallDocumentStore {
    pub store: Arc<FjallStore>,
}

impl FjallDocumentStore {
    pub fn new(store: Arc<FjallStore>) -> Self {
        FjallDocumentStore { store }
    }
}

impl DocumentStore for FjallDocumentStore {
    async fn find_by_key(&self, key: &str) -> Result<Option<StoredDocument>, TribError> {
        let store = self.store.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<StoredDocument>, TribError> {
            // Index entry and document are read under the write lock so a
            // concurrent delete cannot leave the lookup dangling.
            let _guard = lock(&store.doc_lock)?;
            match store.first_id(&key)? {
                Some((id, _)) => Ok(Some(store.load_document(id)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn insert(&self, operation: OperationKind, data: Product) -> Result<DocumentId, TribError> {
        check_name(&data.name)?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<DocumentId, TribError> {
            let _guard = lock(&store.doc_lock)?;
            let id = match store.meta.get(meta_key("next_doc_id")).map_err(fjall_err)? {
                Some(b) => decode::<u64>(&b)?,
                None => 1,
            };
            let name_key = name_index_key(&data.name, id);
            let doc = PersistedDocument { operation, data };

            let mut batch = store.db.batch();
            batch.insert(&store.documents, document_key(id).to_vec(), encode(&doc)?);
            batch.insert(&store.doc_names, name_key, Vec::new());
            batch.insert(&store.meta, meta_key("next_doc_id"), encode(&(id + 1))?);
            batch.commit().map_err(fjall_err)?;
            Ok(id)
        })
        .await
        .map_err(join_err)?
    }

    async fn replace_data(
        &self,
        key: &str,
        operation: OperationKind,
        data: Product,
    ) -> Result<u64, TribError> {
        check_name(&data.name)?;
        let store = self.store.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<u64, TribError> {
            let _guard = lock(&store.doc_lock)?;
            let Some((id, old_index_key)) = store.first_id(&key)? else {
                return Ok(0);
            };

            let mut batch = store.db.batch();
            if data.name != key {
                batch.remove(&store.doc_names, old_index_key);
                batch.insert(&store.doc_names, name_index_key(&data.name, id), Vec::new());
            }
            let doc = PersistedDocument { operation, data };
            batch.insert(&store.documents, document_key(id).to_vec(), encode(&doc)?);
            batch.commit().map_err(fjall_err)?;
            Ok(1)
        })
        .await
        .map_err(join_err)?
    }

    async fn delete_by_key(&self, key: &str) -> Result<u64, TribError> {
        let store = self.store.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<u64, TribError> {
            let _guard = lock(&store.doc_lock)?;
            let Some((id, index_key)) = store.first_id(&key)? else {
                return Ok(0);
            };

            let mut batch = store.db.batch();
            batch.remove(&store.documents, document_key(id).to_vec());
            batch.remove(&store.doc_names, index_key);
            batch.commit().map_err(fjall_err)?;
            Ok(1)
        })
        .await
        .map_err(join_err)?
    }

    async fn list(&self) -> Result<Vec<StoredDocument>, TribError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<StoredDocument>, TribError> {
            let start = document_key(0).to_vec();
            let end = document_key(u64::MAX).to_vec();
            store
                .documents
                .range(start..=end)
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(k, v)| {
                        let id_bytes: [u8; 8] = k[..]
                            .try_into()
                            .map_err(|_| TribError::Storage("malformed document key".into()))?;
                        let doc = decode::<PersistedDocument>(&v)?;
                        Ok(StoredDocument {
                            id: DocumentId::from_be_bytes(id_bytes),
                            operation: doc.operation,
                            data: doc.data,
                        })
                    })
                })
                .collect()
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
