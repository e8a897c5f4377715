//! Multi-agent lead engagement runtime: ingress, channel routing,
//! touch-sequence scheduling, reply handling, and handover evaluation.
//!
//! Library-first layout: every subsystem is a public module here, and
//! `src/main.rs` is a thin binary that wires them together and starts the
//! HTTP/tick/IMAP loops.

pub mod agents;
pub mod carriers;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod handover;
pub mod http;
#[cfg(feature = "email-carrier")]
pub mod imap_scanner;
pub mod model;
pub mod reply_ingester;
pub mod resilience;
pub mod scheduler;

pub use config::OverlordConfig;
pub use engine::{Engine, IngestInput};
pub use error::{OverlordError, OverlordResult};
pub use event::{EventHandler, OverlordEvent, TracingEventHandler};
