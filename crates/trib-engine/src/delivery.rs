use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use trib_storage::DocumentStore;
use trib_types::{LogRecord, Offset, PartitionId, TribError};

use crate::codec;
use crate::consumer::LogConsumer;
use crate::reconcile::{ApplyResult, Effect, Reconciler, SkipReason};

/// What to do with the fetch position after an envelope fails to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Leave the offset uncommitted and move on to the next message.
    #[default]
    Continue,
    /// Seek back to the failed offset and retry it after a backoff.
    Rewind,
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub on_failure: FailurePolicy,
    /// Pause after a failed fetch before fetching again.
    pub fetch_retry_backoff: Duration,
    /// Base pause before refetching a rewound message. Up to half of it
    /// again is added as jitter.
    pub rewind_backoff: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            on_failure: FailurePolicy::Continue,
            fetch_retry_backoff: Duration::from_millis(500),
            rewind_backoff: Duration::from_secs(1),
        }
    }
}

/// Per-message outcome facts published by the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Applied { partition: PartitionId, offset: Offset, effect: Effect },
    Skipped { partition: PartitionId, offset: Offset, reason: SkipReason },
    Failed { partition: PartitionId, offset: Offset, cause: TribError },
    DecodeFailed { partition: PartitionId, offset: Offset, error: String },
    CommitFailed { partition: PartitionId, offset: Offset, error: TribError },
    FetchFailed { error: TribError },
}

/// Counters accumulated over one run of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
    pub decode_failures: u64,
    pub committed: u64,
    pub commit_failures: u64,
    pub fetch_failures: u64,
}

/// Single sequential worker: fetch → decode → apply → commit.
///
/// An offset is committed only after its envelope was applied or skipped as
/// an unrecognized operation. Decode failures and store failures leave it
/// uncommitted. Cancellation is observed between messages only.
pub struct DeliveryLoop<C, S> {
    consumer: C,
    engine: Reconciler<S>,
    config: DeliveryConfig,
    events: Option<mpsc::UnboundedSender<DeliveryEvent>>,
    stats: DeliveryStats,
}

impl<C: LogConsumer, S: DocumentStore> DeliveryLoop<C, S> {
    pub fn new(consumer: C, engine: Reconciler<S>, config: DeliveryConfig) -> Self {
        DeliveryLoop { consumer, engine, config, events: None, stats: DeliveryStats::default() }
    }

    /// Publish a [`DeliveryEvent`] for every message outcome on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<DeliveryEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Run until `shutdown` turns `true` or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DeliveryStats {
        info!(on_failure = ?self.config.on_failure, "delivery loop starting");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let fetched = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                fetched = self.consumer.fetch() => fetched,
            };

            let pause = match fetched {
                Ok(record) => self.process(record).await,
                Err(error) => {
                    warn!(%error, "failed to fetch message");
                    self.stats.fetch_failures += 1;
                    self.emit(DeliveryEvent::FetchFailed { error });
                    Some(self.config.fetch_retry_backoff)
                }
            };

            if let Some(pause) = pause {
                if !sleep_unless_cancelled(&mut shutdown, pause).await {
                    break;
                }
            }
        }
        info!(
            applied = self.stats.applied,
            skipped = self.stats.skipped,
            failed = self.stats.failed,
            decode_failures = self.stats.decode_failures,
            committed = self.stats.committed,
            "delivery loop stopped"
        );
        self.stats
    }

    /// Handle one record. Returns a pause to take before the next fetch.
    async fn process(&mut self, record: LogRecord) -> Option<Duration> {
        let (partition, offset) = (record.partition, record.offset);

        let envelope = match codec::decode(&record.value) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    partition,
                    offset,
                    error = %err,
                    value = %String::from_utf8_lossy(&record.value),
                    "failed to decode envelope, offset not committed"
                );
                self.stats.decode_failures += 1;
                self.emit(DeliveryEvent::DecodeFailed { partition, offset, error: err.to_string() });
                return None;
            }
        };

        let operation = envelope.operation.to_string();
        let name = envelope.data.name.clone();
        debug!(partition, offset, %operation, %name, "envelope decoded");

        match self.engine.apply(envelope).await {
            ApplyResult::Applied { effect } => {
                info!(partition, offset, %operation, %name, %effect, "envelope applied");
                self.stats.applied += 1;
                self.commit(&record).await;
                self.emit(DeliveryEvent::Applied { partition, offset, effect });
                None
            }
            ApplyResult::Skipped { reason } => {
                warn!(partition, offset, %operation, %name, "unknown operation, skipping");
                self.stats.skipped += 1;
                self.commit(&record).await;
                self.emit(DeliveryEvent::Skipped { partition, offset, reason });
                None
            }
            ApplyResult::Failed { cause } => {
                error!(partition, offset, %operation, %name, error = %cause, "failed to apply envelope, offset not committed");
                self.stats.failed += 1;
                self.emit(DeliveryEvent::Failed { partition, offset, cause });
                match self.config.on_failure {
                    FailurePolicy::Continue => None,
                    FailurePolicy::Rewind => {
                        self.consumer.seek(partition, offset);
                        Some(with_jitter(self.config.rewind_backoff))
                    }
                }
            }
        }
    }

    async fn commit(&mut self, record: &LogRecord) {
        match self.consumer.commit(record).await {
            Ok(()) => self.stats.committed += 1,
            Err(error) => {
                warn!(partition = record.partition, offset = record.offset, %error, "failed to commit offset");
                self.stats.commit_failures += 1;
                self.emit(DeliveryEvent::CommitFailed {
                    partition: record.partition,
                    offset: record.offset,
                    error,
                });
            }
        }
    }

    fn emit(&self, event: DeliveryEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver only means nobody is listening.
            let _ = tx.send(event);
        }
    }
}

fn with_jitter(base: Duration) -> Duration {
    let spread = (base.as_millis() as u64) / 2;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::random::<u64>() % (spread + 1))
}

/// Returns `false` if cancellation was observed before `pause` elapsed.
async fn sleep_unless_cancelled(shutdown: &mut watch::Receiver<bool>, pause: Duration) -> bool {
    tokio::select! {
        biased;
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        _ = tokio::time::sleep(pause) => true,
    }
}
