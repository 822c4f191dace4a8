use std::fmt;

pub type PartitionId = u32;
pub type Offset = u64;
pub type DocumentId = u64;

/// Entity payload carried by every envelope and stored in every document.
///
/// `name` is the natural key used for all lookups. The descriptive fields
/// default to empty strings when the producer omits them (a DELETE usually
/// carries only the name).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Product {
    pub name: String,
    #[serde(default)]
    pub expired: String,
    #[serde(default)]
    pub brand: String,
}

impl Product {
    pub fn new(name: impl Into<String>, expired: impl Into<String>, brand: impl Into<String>) -> Self {
        Product { name: name.into(), expired: expired.into(), brand: brand.into() }
    }

    /// Natural key of the record.
    pub fn key(&self) -> &str {
        &self.name
    }
}

/// Operation label as it appears on the wire and on stored documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "CREATE",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        }
    }

    /// Case-sensitive: only the exact upper-case labels are recognized.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "CREATE" => Some(OperationKind::Create),
            "UPDATE" => Some(OperationKind::Update),
            "DELETE" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation named by an envelope. Anything that is not one of the fixed
/// kinds is kept verbatim so it can be reported when skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Known(OperationKind),
    Unrecognized(String),
}

impl Operation {
    pub fn parse(raw: &str) -> Self {
        match OperationKind::parse(raw) {
            Some(kind) => Operation::Known(kind),
            None => Operation::Unrecognized(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Operation::Known(kind) => kind.as_str(),
            Operation::Unrecognized(raw) => raw,
        }
    }
}

impl From<OperationKind> for Operation {
    fn from(kind: OperationKind) -> Self {
        Operation::Known(kind)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded unit of work read from the log. Never persisted itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub operation: Operation,
    pub data: Product,
}

impl Envelope {
    pub fn new(operation: impl Into<Operation>, data: Product) -> Self {
        Envelope { operation: operation.into(), data }
    }
}

/// Persisted form of a record: the last applied operation label plus the
/// current payload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoredDocument {
    pub id: DocumentId,
    pub operation: OperationKind,
    pub data: Product,
}

/// A single message read from one partition of the log.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogRecord {
    pub partition: PartitionId,
    pub offset: Offset,
    pub value: Vec<u8>,
    pub appended_at_ns: i64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TribError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("log error: {0}")]
    Log(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
