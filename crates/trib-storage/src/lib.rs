pub mod fjall;
pub mod keys;
pub mod mem;
pub mod traits;
mod types;

pub use fjall::{FjallDocumentStore, FjallMessageLog, FjallStore};
pub use mem::{MemDocumentStore, MemMessageLog};
pub use traits::{DocumentStore, MessageLog};
