use std::future::Future;

use tokio::sync::watch;

use trib_types::{DocumentId, LogRecord, Offset, OperationKind, PartitionId, Product, StoredDocument, TribError};

/// Durable, partitioned message log with per-group commit cursors.
///
/// Methods use RPITIT (`-> impl Future + Send`) so generic callers can hold
/// the futures across `.await` points on a multi-threaded runtime.
pub trait MessageLog: Send + Sync + 'static {
    /// Number of partitions; valid partition ids are `0..partition_count()`.
    fn partition_count(&self) -> u32;

    /// Append `value` to `partition` and return the offset it was assigned.
    /// Offsets are dense per partition and start at 0.
    fn append(&self, partition: PartitionId, value: Vec<u8>)
        -> impl Future<Output = Result<Offset, TribError>> + Send;

    /// Return up to `max` records of `partition` starting at `from_offset`.
    fn read(&self, partition: PartitionId, from_offset: Offset, max: usize)
        -> impl Future<Output = Result<Vec<LogRecord>, TribError>> + Send;

    /// Next offset the group should consume from `partition`, or `None` if
    /// the group never committed there.
    fn committed(&self, group: &str, partition: PartitionId)
        -> impl Future<Output = Result<Option<Offset>, TribError>> + Send;

    /// Advance the group's cursor for `partition` to `next_offset`.
    /// A cursor never moves backwards; committing a lower value is a no-op.
    fn commit(&self, group: &str, partition: PartitionId, next_offset: Offset)
        -> impl Future<Output = Result<(), TribError>> + Send;

    /// Counter bumped on every append, used to wake idle consumers.
    fn subscribe_appends(&self) -> watch::Receiver<u64>;
}

/// Document collection the reconciliation engine writes to.
///
/// Non-existence is reported through `Option` and match counts; `Err` is
/// reserved for storage failures so callers can tell them apart.
pub trait DocumentStore: Send + Sync + 'static {
    /// Earliest inserted document whose `data.name == key`.
    fn find_by_key(&self, key: &str)
        -> impl Future<Output = Result<Option<StoredDocument>, TribError>> + Send;

    /// Insert a new document. No uniqueness check on the natural key.
    fn insert(&self, operation: OperationKind, data: Product)
        -> impl Future<Output = Result<DocumentId, TribError>> + Send;

    /// Overwrite label and payload of the earliest document matching `key`.
    /// Returns the number of matched documents (0 or 1).
    fn replace_data(&self, key: &str, operation: OperationKind, data: Product)
        -> impl Future<Output = Result<u64, TribError>> + Send;

    /// Delete the earliest document matching `key`. Returns the number of
    /// deleted documents (0 or 1).
    fn delete_by_key(&self, key: &str)
        -> impl Future<Output = Result<u64, TribError>> + Send;

    /// All documents in insertion order.
    fn list(&self) -> impl Future<Output = Result<Vec<StoredDocument>, TribError>> + Send;
}
