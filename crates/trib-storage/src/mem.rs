use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{watch, RwLock};

use trib_types::{
    DocumentId, LogRecord, Offset, OperationKind, PartitionId, Product, StoredDocument, TribError,
};

use crate::traits::{DocumentStore, MessageLog};

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

// ---------------------------------------------------------------------------
// MemMessageLog
// ---------------------------------------------------------------------------

struct MemLogInner {
    partitions: Vec<Vec<LogRecord>>,
    cursors: HashMap<(String, PartitionId), Offset>,
}

/// In-memory `MessageLog`.
///
/// Intended for unit tests; not persisted across restarts.
pub struct MemMessageLog {
    inner: Arc<RwLock<MemLogInner>>,
    partitions: u32,
    appends: watch::Sender<u64>,
    commits_unavailable: AtomicBool,
    reads_unavailable: AtomicBool,
}

impl MemMessageLog {
    pub fn new(partitions: u32) -> Self {
        let (appends, _) = watch::channel(0);
        MemMessageLog {
            inner: Arc::new(RwLock::new(MemLogInner {
                partitions: (0..partitions).map(|_| Vec::new()).collect(),
                cursors: HashMap::new(),
            })),
            partitions,
            appends,
            commits_unavailable: AtomicBool::new(false),
            reads_unavailable: AtomicBool::new(false),
        }
    }

    /// While set, every `commit` fails with `TribError::Log`.
    pub fn set_commits_unavailable(&self, unavailable: bool) {
        self.commits_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// While set, every `read` fails with `TribError::Log`.
    pub fn set_reads_unavailable(&self, unavailable: bool) {
        self.reads_unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl Default for MemMessageLog {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MessageLog for MemMessageLog {
    fn partition_count(&self) -> u32 {
        self.partitions
    }

    async fn append(&self, partition: PartitionId, value: Vec<u8>) -> Result<Offset, TribError> {
        let offset = {
            let mut g = self.inner.write().await;
            let records = g.partitions.get_mut(partition as usize).ok_or_else(|| {
                TribError::InvalidArgument(format!("unknown partition {partition}"))
            })?;
            let offset = records.len() as Offset;
            records.push(LogRecord { partition, offset, value, appended_at_ns: now_ns() });
            offset
        };
        self.appends.send_modify(|n| *n += 1);
        Ok(offset)
    }

    async fn read(
        &self,
        partition: PartitionId,
        from_offset: Offset,
        max: usize,
    ) -> Result<Vec<LogRecord>, TribError> {
        if self.reads_unavailable.load(Ordering::SeqCst) {
            return Err(TribError::Log("log unreachable".into()));
        }
        let g = self.inner.read().await;
        let records = g.partitions.get(partition as usize).ok_or_else(|| {
            TribError::InvalidArgument(format!("unknown partition {partition}"))
        })?;
        Ok(records.iter().skip(from_offset as usize).take(max).cloned().collect())
    }

    async fn committed(&self, group: &str, partition: PartitionId) -> Result<Option<Offset>, TribError> {
        let g = self.inner.read().await;
        Ok(g.cursors.get(&(group.to_string(), partition)).copied())
    }

    async fn commit(
        &self,
        group: &str,
        partition: PartitionId,
        next_offset: Offset,
    ) -> Result<(), TribError> {
        if self.commits_unavailable.load(Ordering::SeqCst) {
            return Err(TribError::Log("commit rejected by log".into()));
        }
        let mut g = self.inner.write().await;
        if partition as usize >= g.partitions.len() {
            return Err(TribError::InvalidArgument(format!("unknown partition {partition}")));
        }
        let cursor = g.cursors.entry((group.to_string(), partition)).or_insert(0);
        *cursor = (*cursor).max(next_offset);
        Ok(())
    }

    fn subscribe_appends(&self) -> watch::Receiver<u64> {
        self.appends.subscribe()
    }
}

// ---------------------------------------------------------------------------
// MemDocumentStore
// ---------------------------------------------------------------------------

struct MemDocInner {
    docs: BTreeMap<DocumentId, StoredDocument>,
    next_id: DocumentId,
}

/// In-memory `DocumentStore` backed by a `BTreeMap` keyed by insertion id.
///
/// Intended for unit tests; not persisted across restarts. `set_unavailable`
/// makes every call fail with `TribError::Storage`, standing in for a lost
/// connection.
pub struct MemDocumentStore {
    inner: Arc<RwLock<MemDocInner>>,
    unavailable: AtomicBool,
}

impl MemDocumentStore {
    pub fn new() -> Self {
        MemDocumentStore {
            inner: Arc::new(RwLock::new(MemDocInner { docs: BTreeMap::new(), next_id: 1 })),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), TribError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TribError::Storage("document store unavailable".into()));
        }
        Ok(())
    }
}

impl Default for MemDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn first_match(docs: &BTreeMap<DocumentId, StoredDocument>, key: &str) -> Option<DocumentId> {
    docs.values().find(|d| d.data.name == key).map(|d| d.id)
}

impl DocumentStore for MemDocumentStore {
    async fn find_by_key(&self, key: &str) -> Result<Option<StoredDocument>, TribError> {
        self.check_available()?;
        let g = self.inner.read().await;
        Ok(first_match(&g.docs, key).and_then(|id| g.docs.get(&id).cloned()))
    }

    async fn insert(&self, operation: OperationKind, data: Product) -> Result<DocumentId, TribError> {
        self.check_available()?;
        let mut g = self.inner.write().await;
        let id = g.next_id;
        g.next_id += 1;
        g.docs.insert(id, StoredDocument { id, operation, data });
        Ok(id)
    }

    async fn replace_data(
        &self,
        key: &str,
        operation: OperationKind,
        data: Product,
    ) -> Result<u64, TribError> {
        self.check_available()?;
        let mut g = self.inner.write().await;
        let Some(id) = first_match(&g.docs, key) else {
            return Ok(0);
        };
        g.docs.insert(id, StoredDocument { id, operation, data });
        Ok(1)
    }

    async fn delete_by_key(&self, key: &str) -> Result<u64, TribError> {
        self.check_available()?;
        let mut g = self.inner.write().await;
        match first_match(&g.docs, key) {
            Some(id) => {
                g.docs.remove(&id);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn list(&self) -> Result<Vec<StoredDocument>, TribError> {
        self.check_available()?;
        Ok(self.inner.read().await.docs.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // MemMessageLog tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn log_append_and_read() {
        let log = MemMessageLog::new(2);
        assert_eq!(log.partition_count(), 2);

        assert_eq!(log.append(0, b"a".to_vec()).await.unwrap(), 0);
        assert_eq!(log.append(0, b"b".to_vec()).await.unwrap(), 1);
        assert_eq!(log.append(1, b"c".to_vec()).await.unwrap(), 0);

        let p0 = log.read(0, 0, 10).await.unwrap();
        assert_eq!(p0.len(), 2);
        assert_eq!(p0[1].value, b"b");
        assert_eq!(p0[1].offset, 1);

        let tail = log.read(0, 1, 10).await.unwrap();
        assert_eq!(tail.len(), 1);

        let p1 = log.read(1, 0, 10).await.unwrap();
        assert_eq!(p1[0].partition, 1);
    }

    #[tokio::test]
    async fn log_rejects_unknown_partition() {
        let log = MemMessageLog::new(1);
        let err = log.append(3, Vec::new()).await.unwrap_err();
        assert!(matches!(err, TribError::InvalidArgument(_)));
        assert!(log.read(3, 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn log_commit_is_monotonic() {
        let log = MemMessageLog::new(1);
        assert!(log.committed("g", 0).await.unwrap().is_none());

        log.commit("g", 0, 5).await.unwrap();
        log.commit("g", 0, 3).await.unwrap();
        assert_eq!(log.committed("g", 0).await.unwrap(), Some(5));

        // Other groups keep their own cursor.
        assert!(log.committed("other", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn log_append_wakes_subscribers() {
        let log = MemMessageLog::new(1);
        let mut rx = log.subscribe_appends();
        log.append(0, b"x".to_vec()).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn log_reads_fail_while_unavailable() {
        let log = MemMessageLog::new(1);
        log.append(0, b"x".to_vec()).await.unwrap();
        log.set_reads_unavailable(true);
        assert!(matches!(log.read(0, 0, 1).await, Err(TribError::Log(_))));
        // Appends are unaffected.
        assert_eq!(log.append(0, b"y".to_vec()).await.unwrap(), 1);
        log.set_reads_unavailable(false);
        assert_eq!(log.read(0, 0, 10).await.unwrap().len(), 2);
    }

    // -----------------------------------------------------------------------
    // MemDocumentStore tests
    // -----------------------------------------------------------------------

    fn milk(expired: &str) -> Product {
        Product::new("milk", expired, "X")
    }

    #[tokio::test]
    async fn docs_insert_and_find() {
        let store = MemDocumentStore::new();
        assert!(store.find_by_key("milk").await.unwrap().is_none());

        let id = store.insert(OperationKind::Create, milk("2024-01-01")).await.unwrap();
        let doc = store.find_by_key("milk").await.unwrap().unwrap();
        assert_eq!(doc.id, id);
        assert_eq!(doc.operation, OperationKind::Create);
        assert_eq!(doc.data.expired, "2024-01-01");
    }

    #[tokio::test]
    async fn docs_duplicates_resolve_to_earliest() {
        let store = MemDocumentStore::new();
        let first = store.insert(OperationKind::Create, milk("a")).await.unwrap();
        store.insert(OperationKind::Create, milk("b")).await.unwrap();

        assert_eq!(store.find_by_key("milk").await.unwrap().unwrap().id, first);
        assert_eq!(store.delete_by_key("milk").await.unwrap(), 1);
        assert_eq!(store.find_by_key("milk").await.unwrap().unwrap().data.expired, "b");
    }

    #[tokio::test]
    async fn docs_replace_and_delete_report_counts() {
        let store = MemDocumentStore::new();
        assert_eq!(store.replace_data("milk", OperationKind::Update, milk("z")).await.unwrap(), 0);
        assert_eq!(store.delete_by_key("milk").await.unwrap(), 0);

        store.insert(OperationKind::Create, milk("a")).await.unwrap();
        assert_eq!(store.replace_data("milk", OperationKind::Update, milk("z")).await.unwrap(), 1);

        let doc = store.find_by_key("milk").await.unwrap().unwrap();
        assert_eq!(doc.operation, OperationKind::Update);
        assert_eq!(doc.data.expired, "z");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn docs_unavailable_is_storage_error() {
        let store = MemDocumentStore::new();
        store.set_unavailable(true);
        let err = store.find_by_key("milk").await.unwrap_err();
        assert!(matches!(err, TribError::Storage(_)));

        store.set_unavailable(false);
        assert!(store.find_by_key("milk").await.unwrap().is_none());
    }
}
