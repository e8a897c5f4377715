//! The resilience layer: circuit breakers guarding every external service,
//! and the durable job queue that binds the rest of the runtime together.

pub mod circuit_breaker;
pub mod job_queue;

pub use circuit_breaker::{BreakerConfig, CircuitBreakerRegistry, CircuitState, GuardError};
pub use job_queue::{Job, JobOutcome, JobQueue, JobType, JobTypeConcurrency};
