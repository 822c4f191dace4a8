use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use trib_storage::MessageLog;
use trib_types::{LogRecord, Offset, PartitionId, TribError};

/// Narrow view of a log subscription used by the delivery loop.
pub trait LogConsumer: Send {
    /// Next record from any subscribed partition. Waits while none is
    /// available. Dropping the future before it resolves loses nothing.
    fn fetch(&mut self) -> impl Future<Output = Result<LogRecord, TribError>> + Send;

    /// Mark `record` and everything before it in its partition as consumed.
    fn commit(&mut self, record: &LogRecord) -> impl Future<Output = Result<(), TribError>> + Send;

    /// Move the fetch position of `partition` to `offset` without touching
    /// the committed cursor.
    fn seek(&mut self, partition: PartitionId, offset: Offset);
}

/// Consumer-group subscription over a [`MessageLog`].
///
/// Fetch positions start at the group's committed cursor. Partitions are
/// visited round-robin, one record at a time, so no partition starves while
/// each keeps its own order.
pub struct GroupConsumer<L> {
    log: Arc<L>,
    group: String,
    partitions: Vec<PartitionId>,
    positions: HashMap<PartitionId, Offset>,
    next: usize,
    poll_interval: Duration,
    appends: watch::Receiver<u64>,
}

impl<L: MessageLog> GroupConsumer<L> {
    /// Join `group` on `partitions`. An empty list subscribes to every
    /// partition of the log.
    pub async fn subscribe(
        log: Arc<L>,
        group: impl Into<String>,
        partitions: Vec<PartitionId>,
        poll_interval: Duration,
    ) -> Result<Self, TribError> {
        let group = group.into();
        if group.is_empty() {
            return Err(TribError::InvalidArgument("group id must not be empty".into()));
        }
        let count = log.partition_count();
        let mut partitions = if partitions.is_empty() { (0..count).collect() } else { partitions };
        partitions.sort_unstable();
        partitions.dedup();
        if let Some(p) = partitions.iter().find(|&&p| p >= count) {
            return Err(TribError::InvalidArgument(format!(
                "partition {p} out of range (log has {count})"
            )));
        }

        let mut positions = HashMap::with_capacity(partitions.len());
        for &p in &partitions {
            positions.insert(p, log.committed(&group, p).await?.unwrap_or(0));
        }
        info!(group = %group, ?partitions, ?positions, "consumer subscribed");

        let appends = log.subscribe_appends();
        Ok(GroupConsumer { log, group, partitions, positions, next: 0, poll_interval, appends })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    /// Offset the next fetch from `partition` will read.
    pub fn position(&self, partition: PartitionId) -> Option<Offset> {
        self.positions.get(&partition).copied()
    }

    async fn poll_once(&mut self) -> Result<Option<LogRecord>, TribError> {
        let n = self.partitions.len();
        for step in 0..n {
            let idx = (self.next + step) % n;
            let partition = self.partitions[idx];
            let from = self.positions.get(&partition).copied().unwrap_or(0);
            if let Some(record) = self.log.read(partition, from, 1).await?.into_iter().next() {
                self.positions.insert(partition, record.offset + 1);
                self.next = (idx + 1) % n;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

impl<L: MessageLog> LogConsumer for GroupConsumer<L> {
    async fn fetch(&mut self) -> Result<LogRecord, TribError> {
        loop {
            // Mark the current append count as seen before scanning so an
            // append racing with the scan still wakes the wait below.
            self.appends.borrow_and_update();
            if let Some(record) = self.poll_once().await? {
                return Ok(record);
            }
            match tokio::time::timeout(self.poll_interval, self.appends.changed()).await {
                Ok(Ok(())) | Err(_) => {}
                Ok(Err(_)) => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    async fn commit(&mut self, record: &LogRecord) -> Result<(), TribError> {
        self.log.commit(&self.group, record.partition, record.offset + 1).await
    }

    fn seek(&mut self, partition: PartitionId, offset: Offset) {
        if let Some(pos) = self.positions.get_mut(&partition) {
            *pos = offset;
        }
    }
}
