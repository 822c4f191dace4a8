use trib_types::{DocumentId, Offset, PartitionId};

/// `log_records` keyspace: `partition(4) ++ offset(8)`, fixed 12 bytes.
/// Big-endian on both components → lexicographic order = numeric order.
pub fn record_key(partition: PartitionId, offset: Offset) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&partition.to_be_bytes());
    key[4..].copy_from_slice(&offset.to_be_bytes());
    key
}

/// Decode the offset component of a `log_records` key.
pub fn record_key_offset(key: &[u8]) -> Option<Offset> {
    let bytes: [u8; 8] = key.get(4..12)?.try_into().ok()?;
    Some(Offset::from_be_bytes(bytes))
}

/// `log_cursors` keyspace: `group_utf8 ++ \x00 ++ partition(4)`
pub fn cursor_key(group: &str, partition: PartitionId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(group.len() + 1 + 4);
    buf.extend_from_slice(group.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(&partition.to_be_bytes());
    buf
}

/// `documents` keyspace: `id(8)` big-endian, so a full scan yields
/// insertion order.
pub fn document_key(id: DocumentId) -> [u8; 8] {
    id.to_be_bytes()
}

/// `doc_names` keyspace: `name_utf8 ++ \x00 ++ id(8)` → b""
///
/// Several documents may share a name; the id suffix orders them by
/// insertion so the first entry under a name prefix is the earliest.
pub fn name_index_key(name: &str, id: DocumentId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + 1 + 8);
    buf.extend_from_slice(name.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(&id.to_be_bytes());
    buf
}

/// Prefix for every index entry of one name: `name_utf8 ++ \x00`.
///
/// The delimiter keeps "milk\x00" from matching entries for "milkshake".
/// Names containing NUL are rejected before they reach the index.
pub fn name_index_prefix(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + 1);
    buf.extend_from_slice(name.as_bytes());
    buf.push(0x00);
    buf
}

/// Decode the document id suffix of a `doc_names` key.
pub fn name_index_id(key: &[u8]) -> Option<DocumentId> {
    let start = key.len().checked_sub(8)?;
    let bytes: [u8; 8] = key[start..].try_into().ok()?;
    Some(DocumentId::from_be_bytes(bytes))
}

/// `meta` keyspace: next offset to assign in `partition`.
pub fn partition_head_key(partition: PartitionId) -> Vec<u8> {
    let mut buf = meta_key("head");
    buf.push(0x00);
    buf.extend_from_slice(&partition.to_be_bytes());
    buf
}

/// `meta` keyspace: `label_utf8`
pub fn meta_key(label: &str) -> Vec<u8> {
    label.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keys_sort_by_offset() {
        let a = record_key(0, 1);
        let b = record_key(0, 2);
        let c = record_key(0, 1000);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn record_keys_different_partitions_dont_interleave() {
        let p0_high = record_key(0, u64::MAX);
        let p1_low = record_key(1, 0);
        assert!(p0_high < p1_low);
    }

    #[test]
    fn record_key_offset_decodes() {
        assert_eq!(record_key_offset(&record_key(3, 42)), Some(42));
        assert_eq!(record_key_offset(&[0u8; 5]), None);
    }

    #[test]
    fn name_prefix_no_bleed() {
        let milk_prefix = name_index_prefix("milk");
        let milk = name_index_key("milk", 7);
        let milkshake = name_index_key("milkshake", 1);

        assert!(milk.starts_with(&milk_prefix));
        assert!(!milkshake.starts_with(&milk_prefix));
    }

    #[test]
    fn name_index_sorts_by_insertion_id() {
        let first = name_index_key("milk", 2);
        let second = name_index_key("milk", 10);
        assert!(first < second);
        assert_eq!(name_index_id(&second), Some(10));
    }

    #[test]
    fn cursor_keys_are_group_scoped() {
        let a = cursor_key("cons1", 0);
        let b = cursor_key("cons10", 0);
        assert!(!b.starts_with(&a));
        assert_eq!(&a[a.len() - 4..], &0u32.to_be_bytes());
    }

    #[test]
    fn head_keys_differ_per_partition() {
        assert_ne!(partition_head_key(0), partition_head_key(1));
        assert!(partition_head_key(0).starts_with(b"head\x00"));
    }
}
