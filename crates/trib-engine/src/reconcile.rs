use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use trib_storage::DocumentStore;
use trib_types::{Envelope, Operation, OperationKind, Product, TribError};

/// What a successfully applied envelope did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Created,
    Updated,
    /// UPDATE for a key with no stored document, applied as an insert.
    CreatedFromMissingUpdate,
    /// Also reported when no document matched.
    Deleted,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Created => "created",
            Effect::Updated => "updated",
            Effect::CreatedFromMissingUpdate => "created_from_missing_update",
            Effect::Deleted => "deleted",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnrecognizedOperation { operation: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    Applied { effect: Effect },
    Skipped { reason: SkipReason },
    Failed { cause: TribError },
}

/// Applies CREATE/UPDATE/DELETE envelopes to a [`DocumentStore`].
///
/// Store errors are returned as [`ApplyResult::Failed`] and never retried
/// here; whether to redeliver is the caller's decision.
pub struct Reconciler<S> {
    store: Arc<S>,
}

impl<S: DocumentStore> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Reconciler { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn apply(&self, envelope: Envelope) -> ApplyResult {
        let Envelope { operation, data } = envelope;
        let kind = match operation {
            Operation::Known(kind) => kind,
            Operation::Unrecognized(operation) => {
                return ApplyResult::Skipped {
                    reason: SkipReason::UnrecognizedOperation { operation },
                };
            }
        };
        match self.apply_kind(kind, data).await {
            Ok(effect) => ApplyResult::Applied { effect },
            Err(cause) => ApplyResult::Failed { cause },
        }
    }

    async fn apply_kind(&self, kind: OperationKind, data: Product) -> Result<Effect, TribError> {
        match kind {
            // No uniqueness check: replaying a CREATE inserts a second
            // document under the same name.
            OperationKind::Create => {
                let id = self.store.insert(OperationKind::Create, data).await?;
                debug!(id, "document inserted");
                Ok(Effect::Created)
            }
            OperationKind::Update => self.update(data).await,
            OperationKind::Delete => {
                let deleted = self.store.delete_by_key(data.key()).await?;
                debug!(name = %data.name, deleted, "delete applied");
                Ok(Effect::Deleted)
            }
        }
    }

    async fn update(&self, data: Product) -> Result<Effect, TribError> {
        let Some(existing) = self.store.find_by_key(data.key()).await? else {
            warn!(name = %data.name, "document not found for update, treating as create");
            self.store.insert(OperationKind::Update, data).await?;
            return Ok(Effect::CreatedFromMissingUpdate);
        };

        debug!(id = existing.id, old = ?existing.data, new = ?data, "replacing document data");
        let matched = self
            .store
            .replace_data(&existing.data.name, OperationKind::Update, data.clone())
            .await?;
        if matched == 0 {
            // Removed between lookup and replace by a writer on another partition.
            warn!(name = %data.name, "document vanished before replace, treating as create");
            self.store.insert(OperationKind::Update, data).await?;
            return Ok(Effect::CreatedFromMissingUpdate);
        }
        Ok(Effect::Updated)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use trib_storage::MemDocumentStore;
    use trib_types::{DocumentId, StoredDocument};

    use super::*;

    fn engine() -> (Reconciler<MemDocumentStore>, Arc<MemDocumentStore>) {
        let store = Arc::new(MemDocumentStore::new());
        (Reconciler::new(store.clone()), store)
    }

    fn env(op: &str, name: &str, expired: &str, brand: &str) -> Envelope {
        Envelope { operation: Operation::parse(op), data: Product::new(name, expired, brand) }
    }

    #[tokio::test]
    async fn create_inserts_document() {
        let (engine, store) = engine();
        let res = engine.apply(env("CREATE", "milk", "2024-01-01", "X")).await;
        assert_eq!(res, ApplyResult::Applied { effect: Effect::Created });

        let docs = store.list().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].operation, OperationKind::Create);
        assert_eq!(docs[0].data, Product::new("milk", "2024-01-01", "X"));
    }

    #[tokio::test]
    async fn create_twice_duplicates() {
        let (engine, store) = engine();
        engine.apply(env("CREATE", "milk", "a", "X")).await;
        engine.apply(env("CREATE", "milk", "a", "X")).await;
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_missing_falls_back_to_insert() {
        let (engine, store) = engine();
        let res = engine.apply(env("UPDATE", "milk", "2024-02-01", "X")).await;
        assert_eq!(res, ApplyResult::Applied { effect: Effect::CreatedFromMissingUpdate });

        let doc = store.find_by_key("milk").await.unwrap().unwrap();
        assert_eq!(doc.operation, OperationKind::Update);
        assert_eq!(doc.data, Product::new("milk", "2024-02-01", "X"));
    }

    #[tokio::test]
    async fn update_existing_replaces_data() {
        let (engine, store) = engine();
        engine.apply(env("CREATE", "milk", "2024-01-01", "X")).await;
        let id = store.find_by_key("milk").await.unwrap().unwrap().id;

        let res = engine.apply(env("UPDATE", "milk", "2024-03-01", "Y")).await;
        assert_eq!(res, ApplyResult::Applied { effect: Effect::Updated });

        let docs = store.list().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, id);
        assert_eq!(docs[0].operation, OperationKind::Update);
        assert_eq!(docs[0].data, Product::new("milk", "2024-03-01", "Y"));
    }

    #[tokio::test]
    async fn update_replay_is_idempotent() {
        let (engine, store) = engine();
        engine.apply(env("UPDATE", "milk", "b", "Y")).await;
        let once = store.list().await.unwrap();

        let res = engine.apply(env("UPDATE", "milk", "b", "Y")).await;
        assert_eq!(res, ApplyResult::Applied { effect: Effect::Updated });
        assert_eq!(store.list().await.unwrap(), once);
    }

    #[tokio::test]
    async fn delete_missing_is_noop() {
        let (engine, store) = engine();
        let res = engine.apply(env("DELETE", "milk", "", "")).await;
        assert_eq!(res, ApplyResult::Applied { effect: Effect::Deleted });
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_at_most_one() {
        let (engine, store) = engine();
        engine.apply(env("CREATE", "milk", "a", "X")).await;
        engine.apply(env("CREATE", "milk", "b", "X")).await;
        engine.apply(env("CREATE", "bread", "c", "Z")).await;

        engine.apply(env("DELETE", "milk", "", "")).await;
        let names: Vec<_> =
            store.list().await.unwrap().into_iter().map(|d| d.data.expired).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn unrecognized_operation_skips_without_store_access() {
        let (engine, store) = engine();
        // An unavailable store would turn any access into a failure.
        store.set_unavailable(true);
        let res = engine.apply(env("FOO", "milk", "", "")).await;
        assert_eq!(
            res,
            ApplyResult::Skipped {
                reason: SkipReason::UnrecognizedOperation { operation: "FOO".into() }
            }
        );
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_failed() {
        let (engine, store) = engine();
        store.set_unavailable(true);
        for op in ["CREATE", "UPDATE", "DELETE"] {
            let res = engine.apply(env(op, "milk", "", "")).await;
            assert!(matches!(res, ApplyResult::Failed { cause: TribError::Storage(_) }), "{op}");
        }
        store.set_unavailable(false);
        assert!(store.list().await.unwrap().is_empty());
    }

    /// Store where another writer removes the document between the
    /// UPDATE lookup and the first replace.
    struct VanishingStore {
        inner: MemDocumentStore,
        vanished: AtomicBool,
    }

    impl DocumentStore for VanishingStore {
        async fn find_by_key(&self, key: &str) -> Result<Option<StoredDocument>, TribError> {
            self.inner.find_by_key(key).await
        }

        async fn insert(&self, operation: OperationKind, data: Product) -> Result<DocumentId, TribError> {
            self.inner.insert(operation, data).await
        }

        async fn replace_data(
            &self,
            key: &str,
            operation: OperationKind,
            data: Product,
        ) -> Result<u64, TribError> {
            if !self.vanished.swap(true, Ordering::SeqCst) {
                self.inner.delete_by_key(key).await?;
                return Ok(0);
            }
            self.inner.replace_data(key, operation, data).await
        }

        async fn delete_by_key(&self, key: &str) -> Result<u64, TribError> {
            self.inner.delete_by_key(key).await
        }

        async fn list(&self) -> Result<Vec<StoredDocument>, TribError> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn update_racing_delete_falls_back_to_insert() {
        let store = Arc::new(VanishingStore {
            inner: MemDocumentStore::new(),
            vanished: AtomicBool::new(false),
        });
        let engine = Reconciler::new(store.clone());
        engine.apply(env("CREATE", "milk", "2024-01-01", "X")).await;

        let res = engine.apply(env("UPDATE", "milk", "2024-03-01", "Y")).await;
        assert_eq!(res, ApplyResult::Applied { effect: Effect::CreatedFromMissingUpdate });

        let docs = store.list().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].operation, OperationKind::Update);
        assert_eq!(docs[0].data, Product::new("milk", "2024-03-01", "Y"));
    }
}
