pub mod codec;
pub mod consumer;
pub mod delivery;
pub mod publisher;
pub mod reconcile;

pub use codec::{decode, encode, DecodeError};
pub use consumer::{GroupConsumer, LogConsumer};
pub use delivery::{DeliveryConfig, DeliveryEvent, DeliveryLoop, DeliveryStats, FailurePolicy};
pub use publisher::{partition_for, Publisher};
pub use reconcile::{ApplyResult, Effect, Reconciler, SkipReason};
