//! Durable persistence for the overlord engagement runtime.
//!
//! Owns the `Lead`/`Conversation`/`Message`/`Campaign`/`Template`/`Decision`/
//! `Communication`/`HandoverExecution`/`ScheduledStep`/`OrphanReply`/
//! `CircuitBreakerState` entities, the hash-chained decision ledger, and the
//! optimistic-concurrency primitives every mutation path relies on.

pub mod decision_ledger;
pub mod error;
pub mod id;
pub mod models;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use store::Store;
