use std::sync::Arc;

use tracing::debug;

use trib_storage::MessageLog;
use trib_types::{Envelope, Offset, PartitionId, TribError};

use crate::codec;

/// Producer side of the log: encodes envelopes and appends them to the
/// partition owning their natural key, so all changes to one record stay
/// in order.
pub struct Publisher<L> {
    log: Arc<L>,
}

impl<L: MessageLog> Publisher<L> {
    pub fn new(log: Arc<L>) -> Self {
        Publisher { log }
    }

    pub async fn publish(&self, envelope: &Envelope) -> Result<(PartitionId, Offset), TribError> {
        let key = envelope.data.key();
        if key.is_empty() {
            return Err(TribError::InvalidArgument("product name must not be empty".into()));
        }
        let bytes = codec::encode(envelope)
            .map_err(|e| TribError::InvalidArgument(format!("encode envelope: {e}")))?;
        let partition = partition_for(key, self.log.partition_count());
        let offset = self.log.append(partition, bytes).await?;
        debug!(operation = %envelope.operation, name = %key, partition, offset, "envelope published");
        Ok((partition, offset))
    }
}

/// FNV-1a over the key, reduced modulo `partitions`.
pub fn partition_for(key: &str, partitions: u32) -> PartitionId {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    if partitions <= 1 {
        return 0;
    }
    let hash = key
        .bytes()
        .fold(OFFSET_BASIS, |h, b| (h ^ u32::from(b)).wrapping_mul(PRIME));
    hash % partitions
}
