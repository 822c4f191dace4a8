use trib_types::{OperationKind, Product};

/// Value stored under a `log_records` key. Partition and offset live in the
/// key itself.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct PersistedRecord {
    pub value: Vec<u8>,
    pub appended_at_ns: i64,
}

/// Value stored under a `documents` key. The id lives in the key itself.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct PersistedDocument {
    pub operation: OperationKind,
    pub data: Product,
}
