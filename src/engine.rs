//! The Engagement Engine: the per-lead state machine that turns a routed
//! lead into a sequence of outbound touches, reacts to inbound replies, and
//! decides when a conversation needs a human.
//!
//! States: `Received -> Routing -> Sending -> AwaitingReply -> Responding ->
//! {Handover, Completed, Archived}`. The states aren't a literal enum on
//! `Lead` — they're expressed as the combination of `LeadStatus`,
//! `ConversationStatus` and which job is currently queued for a lead. Each
//! processing step re-reads its inputs from the store rather than trusting
//! in-memory state, since the job queue may retry a step after a process
//! restart.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use overlord_store::id::{CampaignId, ConversationId, HandoverId, LeadId};
use overlord_store::models::{
    AgentKind, Campaign, Channel, CommunicationStatus, ConversationMode, ConversationStatus,
    Direction, Lead, LeadStatus,
};
use overlord_store::{Store, StoreError};

use crate::agents::channel::{evaluate_signals_with_router, is_opt_out};
use crate::agents::overlord::OverlordDecision;
use crate::agents::{agent_for_channel, engine_level_fallback, AgentContext, AgentRefusal, OverlordAgent};
use crate::carriers::{Carrier, CarrierError, OutboundEnvelope};
use crate::error::{OverlordError, OverlordResult};
use crate::event::{EventHandler, OverlordEvent};
use crate::handover::{self, HandoverDispatcher};
use crate::model::ModelRouter;
use crate::resilience::circuit_breaker::{BreakerConfig, CircuitBreakerRegistry, GuardError};
use crate::resilience::job_queue::{Job, JobHandler, JobOutcome, JobQueue, JobType};
use crate::scheduler;

/// Coordinates every subsystem (agents, model router, carriers, scheduler,
/// handover dispatcher) around one lead at a time. Cheap to clone-by-`Arc`;
/// holds no per-lead state of its own, since that all lives in the store.
pub struct Engine {
    store: Store,
    router: Option<ModelRouter>,
    breakers: CircuitBreakerRegistry,
    carriers: HashMap<Channel, Arc<dyn Carrier>>,
    handover: HandoverDispatcher,
    events: Arc<dyn EventHandler>,
    handover_followup: chrono::Duration,
    /// How long a lead's last touch sequence step sits with no further
    /// reply before `AwaitingReply -> Completed` fires, once the sequence
    /// itself is exhausted.
    completion_quiescence: chrono::Duration,
    // Set once, right after construction: the queue's handler is this
    // engine, so the two can't be built in one step.
    queue: OnceLock<JobQueue>,
}

impl Engine {
    pub fn new(
        store: Store,
        router: Option<ModelRouter>,
        breakers: CircuitBreakerRegistry,
        carriers: HashMap<Channel, Arc<dyn Carrier>>,
        events: Arc<dyn EventHandler>,
        handover_followup_days: i64,
        completion_quiescence_seconds: i64,
    ) -> Arc<Self> {
        let email_carrier = carriers
            .get(&Channel::Email)
            .cloned()
            .unwrap_or_else(|| Arc::new(crate::carriers::LoggingCarrier::new(Channel::Email)));
        let handover = HandoverDispatcher::new(store.clone(), breakers.clone(), email_carrier);
        Arc::new(Self {
            store,
            router,
            breakers,
            carriers,
            handover,
            events,
            handover_followup: chrono::Duration::days(handover_followup_days),
            completion_quiescence: chrono::Duration::seconds(completion_quiescence_seconds),
            queue: OnceLock::new(),
        })
    }

    /// Attach the job queue this engine drives jobs through. Must be called
    /// exactly once, before `ingest`/`tick`/`enqueue_handle_reply` are used.
    pub fn set_queue(&self, queue: JobQueue) {
        let _ = self.queue.set(queue);
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn enqueue(&self, job: Job) {
        match self.queue.get() {
            Some(queue) => {
                if let Err(err) = queue.enqueue(job).await {
                    tracing::warn!(error = %err, "job queue at capacity, dropping follow-on job");
                }
            }
            None => tracing::error!("engine job queue not attached yet"),
        }
    }

    /// Create (or idempotently reuse) a lead and kick off routing.
    /// `Received -> Routing`.
    pub async fn ingest(&self, input: IngestInput) -> OverlordResult<(Lead, bool)> {
        if input.email.is_none() && input.phone.is_none() {
            return Err(OverlordError::Validation(
                "lead requires at least one of email or phone".to_string(),
            ));
        }

        let (lead, created) = self
            .store
            .create_lead_idempotent(
                &input.name,
                input.email.as_deref(),
                input.phone.as_deref(),
                &input.source,
                input.source_external_id.as_deref(),
                input.campaign_id,
                input.metadata,
            )
            .await?;

        self.events
            .on_event(&OverlordEvent::LeadIngested {
                lead_id: lead.id,
                source: input.source.clone(),
                duplicate: !created,
            })
            .await;

        if created {
            let job = Job::new(JobType::Route, lead.id, serde_json::json!({}), format!("route:{}", lead.id));
            self.enqueue(job).await;
        }

        Ok((lead, created))
    }

    /// Record a matched inbound reply and queue it for processing. Called
    /// by the reply ingester once it has resolved which conversation an
    /// inbound webhook belongs to.
    pub async fn enqueue_handle_reply(
        &self,
        lead_id: LeadId,
        conversation_id: ConversationId,
        content: String,
        external_id: Option<String>,
        received_at: DateTime<Utc>,
    ) -> OverlordResult<()> {
        let payload = serde_json::to_value(HandleReplyPayload {
            conversation_id,
            external_id,
            content,
            received_at,
        })
        .map_err(|err| OverlordError::Validation(err.to_string()))?;
        let key = format!("{}:{}:reply:{}", lead_id, conversation_id, received_at.timestamp_micros());
        self.enqueue(Job::new(JobType::HandleReply, lead_id, payload, key)).await;
        Ok(())
    }

    /// Periodic sweep: fire due touch-sequence steps and chase unconfirmed
    /// handovers. Intended to be called on `RuntimeConfig::tick_interval`.
    pub async fn tick(&self) -> OverlordResult<()> {
        let now = Utc::now();
        self.dispatch_due_touches(now).await?;
        self.run_handover_followups(now).await?;
        Ok(())
    }

    async fn dispatch_due_touches(&self, now: DateTime<Utc>) -> OverlordResult<()> {
        let due = self.store.list_due_steps(now).await?;
        for step in due {
            let payload = serde_json::to_value(ScheduledSendPayload { campaign_id: step.campaign_id })
                .map_err(|err| OverlordError::Validation(err.to_string()))?;
            let key = format!("{}:{}:touch:{}", step.lead_id, step.campaign_id, step.current_index);
            self.enqueue(Job::new(JobType::ScheduledSend, step.lead_id, payload, key)).await;
        }
        Ok(())
    }

    /// Resolves Open Question #3: a handover only gets chased if the lead is
    /// still sitting in `HandedOver`. Once it's moved on (completed by a
    /// human, or archived some other way) the follow-up is moot.
    async fn run_handover_followups(&self, now: DateTime<Utc>) -> OverlordResult<()> {
        let pending = self.store.list_handovers_needing_followup(now).await?;
        for execution in pending {
            let lead = match self.store.get_lead(execution.lead_id).await {
                Ok(lead) => lead,
                Err(err) => {
                    tracing::warn!(handover_id = %execution.id, error = %err, "skipping follow-up, lead lookup failed");
                    continue;
                }
            };
            if lead.status != LeadStatus::HandedOver {
                continue;
            }
            let Some(campaign_id) = lead.campaign_id else { continue };
            let campaign = match self.store.get_campaign(campaign_id).await {
                Ok(campaign) => campaign,
                Err(_) => continue,
            };
            let dossier: handover::Dossier = match serde_json::from_value(execution.dossier.clone()) {
                Ok(dossier) => dossier,
                Err(err) => {
                    tracing::warn!(handover_id = %execution.id, error = %err, "stored dossier failed to deserialize");
                    continue;
                }
            };

            self.handover
                .fan_out(
                    execution.id,
                    execution.lead_id,
                    execution.conversation_id,
                    &campaign.settings.handover_criteria.handover_recipients,
                    &dossier,
                )
                .await;
            self.store.mark_handover_followup_sent(execution.id).await?;
        }
        Ok(())
    }

    // -- job processing -----------------------------------------------

    async fn process_route(&self, lead_id: LeadId) -> OverlordResult<()> {
        let lead = self.store.get_lead(lead_id).await?;
        if lead.status != LeadStatus::New {
            return Ok(());
        }
        let Some(campaign_id) = lead.campaign_id else {
            self.store.update_lead_status(lead_id, LeadStatus::Archived, lead.version).await?;
            return Ok(());
        };
        let campaign = self.store.get_campaign(campaign_id).await?;

        let outcome = OverlordAgent::decide(&lead, &campaign, self.router.as_ref()).await;
        let action = match &outcome.decision {
            OverlordDecision::AssignChannel { channel, .. } => format!("assign_channel:{channel:?}"),
            OverlordDecision::Skip { .. } => "skip".to_string(),
            OverlordDecision::ManualReview { .. } => "manual_review".to_string(),
        };
        self.store
            .append_decision(lead_id, AgentKind::Overlord, &action, &outcome.reasoning, serde_json::json!({}))
            .await?;
        if let Some(router_outcome) = outcome.router_outcome.clone() {
            self.events.on_event(&OverlordEvent::ModelInvoked { lead_id, outcome: router_outcome }).await;
        }

        match outcome.decision {
            OverlordDecision::AssignChannel { channel, focus } => {
                self.events
                    .on_event(&OverlordEvent::RoutingDecided {
                        lead_id,
                        channel: Some(channel),
                        reasoning: outcome.reasoning.clone(),
                    })
                    .await;
                let conversation = self.store.get_or_create_active_conversation(lead_id, channel).await?;
                let payload = serde_json::to_value(DispatchPayload {
                    conversation_id: conversation.id,
                    step_index: 0,
                    kind: DispatchKind::Initial,
                    focus: Some(focus),
                    incoming: None,
                })
                .map_err(|err| OverlordError::Validation(err.to_string()))?;
                let key = format!("{}:{}:0", lead_id, conversation.id);
                self.enqueue(Job::new(JobType::Dispatch, lead_id, payload, key)).await;
            }
            OverlordDecision::Skip { reason } => {
                self.events
                    .on_event(&OverlordEvent::RoutingDecided { lead_id, channel: None, reasoning: reason.clone() })
                    .await;
                self.store.update_lead_status(lead_id, LeadStatus::Rejected, lead.version).await?;
                self.events.on_event(&OverlordEvent::LeadArchived { lead_id, reason }).await;
            }
            OverlordDecision::ManualReview { reason } => {
                self.events
                    .on_event(&OverlordEvent::RoutingDecided { lead_id, channel: None, reasoning: reason })
                    .await;
                // `Routing -> Sending` engine-level fallback: email if
                // present, else sms, else archive with no_channel.
                match engine_level_fallback(&lead) {
                    Some(channel) => {
                        let conversation = self.store.get_or_create_active_conversation(lead_id, channel).await?;
                        let payload = serde_json::to_value(DispatchPayload {
                            conversation_id: conversation.id,
                            step_index: 0,
                            kind: DispatchKind::Initial,
                            focus: Some("general introduction".to_string()),
                            incoming: None,
                        })
                        .map_err(|err| OverlordError::Validation(err.to_string()))?;
                        let key = format!("{}:{}:0", lead_id, conversation.id);
                        self.enqueue(Job::new(JobType::Dispatch, lead_id, payload, key)).await;
                    }
                    None => {
                        self.store.update_lead_status(lead_id, LeadStatus::Archived, lead.version).await?;
                        self.events
                            .on_event(&OverlordEvent::LeadArchived { lead_id, reason: "no_channel".to_string() })
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn process_dispatch(&self, lead_id: LeadId, payload: DispatchPayload) -> OverlordResult<()> {
        let lead = self.store.get_lead(lead_id).await?;
        let conversation = self.store.get_conversation(payload.conversation_id).await?;
        let Some(campaign_id) = lead.campaign_id else {
            return Err(OverlordError::Validation("lead has no campaign".to_string()));
        };
        let campaign = self.store.get_campaign(campaign_id).await?;

        let idempotency_key = format!("{}:{}:{}", lead_id, conversation.id, payload.step_index);
        let (communication, created) = self
            .store
            .create_communication_idempotent(lead_id, conversation.id, conversation.channel, &idempotency_key)
            .await?;
        if !created && communication.status.is_dispatched() {
            return Ok(());
        }

        let agent_definition = self.store.get_agent_definition(campaign.agent_id).await?;
        let agent = agent_for_channel(conversation.channel);
        let ctx = AgentContext {
            lead: &lead,
            campaign: &campaign,
            conversation: &conversation,
            agent_definition: &agent_definition,
        };

        let compose_result = match payload.kind {
            DispatchKind::Reply if campaign.conversation_mode == ConversationMode::TemplateOnly => {
                // template_only never switches to AI composition on a reply;
                // render the next scheduled touch's template instead of
                // calling the agent/router at all.
                let scheduled_step = self.store.get_scheduled_step(lead_id, campaign.id).await?;
                let next_index = scheduled_step.map(|s| s.current_index).unwrap_or(0);
                let touch_template = match campaign.touch_sequence.get(next_index as usize) {
                    Some(step) => Some(self.store.get_template(step.template_id).await?),
                    None => None,
                };
                agent.compose_initial(&ctx, "templated follow-up", touch_template.as_ref(), None).await
            }
            DispatchKind::Reply => {
                let history = self.store.list_messages(conversation.id).await?;
                let incoming = payload.incoming.clone().unwrap_or_default();
                agent.compose_reply(&ctx, &history, &incoming, self.router.as_ref()).await
            }
            DispatchKind::Initial | DispatchKind::ScheduledTouch => {
                let touch_template = match campaign.touch_sequence.get(payload.step_index as usize) {
                    Some(step) => Some(self.store.get_template(step.template_id).await?),
                    None => None,
                };
                let template = match campaign.conversation_mode {
                    ConversationMode::AiOnly => None,
                    _ => touch_template,
                };
                let focus = payload.focus.as_deref().unwrap_or("general introduction");
                agent.compose_initial(&ctx, focus, template.as_ref(), self.router.as_ref()).await
            }
        };

        let (composed, router_outcome) = match compose_result {
            Ok(pair) => pair,
            Err(AgentRefusal::OptOutDetected) => {
                self.store
                    .update_conversation_status(conversation.id, ConversationStatus::Closed, conversation.version)
                    .await?;
                self.store.update_lead_status(lead_id, LeadStatus::Rejected, lead.version).await?;
                self.events
                    .on_event(&OverlordEvent::LeadArchived { lead_id, reason: "opt_out".to_string() })
                    .await;
                return Ok(());
            }
            Err(AgentRefusal::ContentPolicy(reason)) => return Err(OverlordError::ModelPermanent(reason)),
        };

        if let Some(outcome) = router_outcome {
            self.events.on_event(&OverlordEvent::ModelInvoked { lead_id, outcome }).await;
        }
        self.events
            .on_event(&OverlordEvent::MessageComposed {
                lead_id,
                conversation_id: conversation.id,
                channel: conversation.channel,
            })
            .await;

        let Some(carrier) = self.carriers.get(&conversation.channel) else {
            return Err(OverlordError::CarrierPermanent {
                channel: format!("{:?}", conversation.channel),
                message: "no carrier configured for this channel".to_string(),
            });
        };
        let carrier = carrier.clone();

        let to = match conversation.channel {
            Channel::Email => lead.email.clone(),
            Channel::Sms => lead.phone.clone(),
            Channel::Chat => lead.phone.clone().or_else(|| lead.email.clone()),
        }
        .ok_or_else(|| OverlordError::Contactability { lead_id: lead_id.to_string() })?;

        let envelope = OutboundEnvelope {
            lead_id,
            conversation_id: conversation.id,
            to,
            subject: composed.subject.clone(),
            body: composed.body.clone(),
        };
        let service = format!("carrier-{:?}", conversation.channel).to_lowercase();
        let breaker_config = BreakerConfig::default();
        let send_result = self
            .breakers
            .guard(&service, &breaker_config, || {
                let carrier = carrier.clone();
                let envelope = envelope.clone();
                async move { carrier.send(envelope).await }
            })
            .await;

        match send_result {
            Ok(receipt) => {
                self.store
                    .update_communication_status(
                        communication.id,
                        CommunicationStatus::Sent,
                        Some(&receipt.external_id),
                        communication.version,
                    )
                    .await?;
                self.store
                    .append_message(
                        conversation.id,
                        Direction::Outbound,
                        &composed.body,
                        Utc::now(),
                        Some(&receipt.external_id),
                        serde_json::json!({}),
                    )
                    .await?;
                if lead.status == LeadStatus::New {
                    self.store.update_lead_status(lead_id, LeadStatus::Contacted, lead.version).await?;
                }
                if conversation.status != ConversationStatus::Closed {
                    let _ = self
                        .store
                        .update_conversation_status(conversation.id, ConversationStatus::AwaitingReply, conversation.version)
                        .await;
                }
                if matches!(payload.kind, DispatchKind::Initial) {
                    scheduler::enroll(&self.store, lead_id, &campaign).await?;
                }
                self.events
                    .on_event(&OverlordEvent::DispatchCompleted {
                        lead_id,
                        communication_id: communication.id,
                        succeeded: true,
                    })
                    .await;
                Ok(())
            }
            Err(GuardError::Open(err)) => Err(OverlordError::BreakerOpen { service: err.service }),
            Err(GuardError::Timeout) => Err(OverlordError::CarrierTransient { channel: service, message: "carrier call timed out".to_string() }),
            Err(GuardError::Call(CarrierError::Transient(message))) => Err(OverlordError::CarrierTransient { channel: service, message }),
            Err(GuardError::Call(CarrierError::Permanent(message))) => {
                let _ = self
                    .store
                    .update_communication_status(communication.id, CommunicationStatus::Failed, None, communication.version)
                    .await;
                self.events
                    .on_event(&OverlordEvent::DispatchCompleted {
                        lead_id,
                        communication_id: communication.id,
                        succeeded: false,
                    })
                    .await;
                Err(OverlordError::CarrierPermanent { channel: service, message })
            }
        }
    }

    async fn process_handle_reply(&self, lead_id: LeadId, payload: HandleReplyPayload) -> OverlordResult<()> {
        let mut lead = self.store.get_lead(lead_id).await?;
        let conversation = self.store.get_conversation(payload.conversation_id).await?;
        let Some(campaign_id) = lead.campaign_id else {
            return Err(OverlordError::Validation("lead has no campaign".to_string()));
        };
        let campaign = self.store.get_campaign(campaign_id).await?;

        self.store
            .append_message(
                conversation.id,
                Direction::Inbound,
                &payload.content,
                payload.received_at,
                payload.external_id.as_deref(),
                serde_json::json!({}),
            )
            .await?;
        if campaign.conversation_mode != ConversationMode::TemplateOnly {
            scheduler::cancel_on_reply(&self.store, lead_id, campaign.id).await?;
        }
        self.events
            .on_event(&OverlordEvent::ReplyMatched { lead_id, conversation_id: conversation.id, channel: conversation.channel })
            .await;

        // First matched inbound reply moves the lead past `Contacted`: the
        // lifecycle is `new -> contacted -> engaged -> qualified -> {...}`.
        if matches!(lead.status, LeadStatus::New | LeadStatus::Contacted) {
            lead = self.store.update_lead_status(lead_id, LeadStatus::Engaged, lead.version).await?;
        }

        if is_opt_out(&payload.content) {
            let _ = self
                .store
                .update_conversation_status(conversation.id, ConversationStatus::Closed, conversation.version)
                .await;
            let _ = self.store.update_lead_status(lead_id, LeadStatus::Rejected, lead.version).await;
            self.events
                .on_event(&OverlordEvent::LeadArchived { lead_id, reason: "opt_out".to_string() })
                .await;
            return Ok(());
        }

        if lead.status == LeadStatus::HandedOver || lead.status.is_terminal() {
            return Ok(());
        }

        let history = self.store.list_messages(conversation.id).await?;
        let agent = agent_for_channel(conversation.channel);
        let signals = evaluate_signals_with_router(agent.as_ref(), &history, self.router.as_ref()).await;

        let completed_goals: std::collections::HashSet<String> = lead
            .metadata
            .get("completed_goals")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        // `Engaged <-> Qualified` oscillates with the qualification score,
        // per spec.md §3, until a terminal status is reached.
        let qualifies = signals.qualification_score >= campaign.settings.handover_criteria.qualification_score_threshold;
        if qualifies && lead.status == LeadStatus::Engaged {
            lead = self.store.update_lead_status(lead_id, LeadStatus::Qualified, lead.version).await?;
        } else if !qualifies && lead.status == LeadStatus::Qualified {
            lead = self.store.update_lead_status(lead_id, LeadStatus::Engaged, lead.version).await?;
        }

        let tripped = handover::evaluate(&campaign.settings.handover_criteria, &history, conversation.created_at, &signals, &completed_goals);

        if !tripped.is_empty() {
            let dossier = handover::build_dossier(&lead, &history, &signals, &tripped);
            let dossier_value = serde_json::to_value(&dossier).map_err(|err| OverlordError::Validation(err.to_string()))?;
            let trigger_cycle = format!("cycle-{}", history.len());
            let follow_up_at = Some(Utc::now() + self.handover_followup);
            let reason = tripped.first().map(|t| format!("{t:?}")).unwrap_or_default();

            match self
                .store
                .create_handover_execution(lead_id, conversation.id, &trigger_cycle, &reason, dossier_value, follow_up_at)
                .await
            {
                Ok(execution) => {
                    self.store.update_lead_status(lead_id, LeadStatus::HandedOver, lead.version).await?;
                    self.events
                        .on_event(&OverlordEvent::HandoverTriggered { lead_id, handover_id: execution.id, reason: reason.clone() })
                        .await;
                    let fanout_payload = serde_json::to_value(HandoverFanoutPayload {
                        handover_id: execution.id,
                        conversation_id: conversation.id,
                    })
                    .map_err(|err| OverlordError::Validation(err.to_string()))?;
                    let key = format!("{}:{}:fanout", lead_id, execution.id);
                    self.enqueue(Job::new(JobType::HandoverFanout, lead_id, fanout_payload, key)).await;
                }
                Err(StoreError::DuplicateIdempotencyKey { .. }) => {
                    // Already handed over for this trigger cycle; nothing further to do.
                }
                Err(err) => return Err(err.into()),
            }
            return Ok(());
        }

        let step_index = history.len() as i64;
        let dispatch_payload = serde_json::to_value(DispatchPayload {
            conversation_id: conversation.id,
            step_index,
            kind: DispatchKind::Reply,
            focus: None,
            incoming: Some(payload.content.clone()),
        })
        .map_err(|err| OverlordError::Validation(err.to_string()))?;
        let key = format!("{}:{}:{}", lead_id, conversation.id, step_index);
        self.enqueue(Job::new(JobType::Dispatch, lead_id, dispatch_payload, key)).await;
        Ok(())
    }

    async fn process_scheduled_send(&self, lead_id: LeadId, payload: ScheduledSendPayload) -> OverlordResult<()> {
        let Some(step) = self.store.get_scheduled_step(lead_id, payload.campaign_id).await? else {
            return Ok(());
        };
        if step.canceled {
            return Ok(());
        }
        let lead = self.store.get_lead(lead_id).await?;
        if lead.status.is_terminal() {
            let canceled = overlord_store::models::ScheduledStep { canceled: true, next_fire_at: None, ..step };
            self.store.upsert_scheduled_step(&canceled).await?;
            return Ok(());
        }
        let campaign = self.store.get_campaign(payload.campaign_id).await?;

        let since = Utc::now() - chrono::Duration::hours(24);
        let sent_today = self.store.count_recent_sends_for_campaign(payload.campaign_id, since).await?;
        let daily_cap_reached = campaign.settings.daily_send_cap.map(|cap| sent_today >= cap as i64).unwrap_or(false);

        if daily_cap_reached {
            let next = scheduler::advance(&step, &campaign, step.current_index, true);
            self.store.upsert_scheduled_step(&next).await?;
            return Ok(());
        }

        if !scheduler::is_within_business_window(&campaign.settings, Utc::now()) {
            let fire_at = scheduler::next_allowed_time(&campaign.settings, Utc::now());
            let rescheduled = overlord_store::models::ScheduledStep { next_fire_at: Some(fire_at), ..step };
            self.store.upsert_scheduled_step(&rescheduled).await?;
            return Ok(());
        }

        if campaign.touch_sequence.get(step.current_index as usize).is_none() {
            // Final touch already sent and canceled on the prior pass; the
            // `AwaitingReply -> Completed` transition only fires once the
            // conversation has gone quiet for a full quiescence window, so a
            // reply arriving just after the last touch still gets matched.
            let last_activity = match preferred_channel(&lead, &campaign) {
                Some(channel) => match self.store.find_active_conversation(lead_id, channel).await? {
                    Some(conversation) => self.store.list_messages(conversation.id).await?.last().map(|m| m.timestamp),
                    None => None,
                },
                None => None,
            };
            let quiescent = last_activity.map(|last| Utc::now() - last >= self.completion_quiescence).unwrap_or(true);

            if quiescent {
                if !lead.status.is_terminal() {
                    self.store.update_lead_status(lead_id, LeadStatus::Completed, lead.version).await?;
                }
                let exhausted = overlord_store::models::ScheduledStep { canceled: true, next_fire_at: None, ..step };
                self.store.upsert_scheduled_step(&exhausted).await?;
            } else {
                let recheck_at = last_activity.unwrap() + self.completion_quiescence;
                let deferred = overlord_store::models::ScheduledStep { next_fire_at: Some(recheck_at), ..step };
                self.store.upsert_scheduled_step(&deferred).await?;
            }
            return Ok(());
        }

        let Some(channel) = preferred_channel(&lead, &campaign) else {
            let exhausted = overlord_store::models::ScheduledStep { canceled: true, next_fire_at: None, ..step };
            self.store.upsert_scheduled_step(&exhausted).await?;
            return Ok(());
        };
        let conversation = self.store.get_or_create_active_conversation(lead_id, channel).await?;

        let dispatch_payload = serde_json::to_value(DispatchPayload {
            conversation_id: conversation.id,
            step_index: step.current_index,
            kind: DispatchKind::ScheduledTouch,
            focus: None,
            incoming: None,
        })
        .map_err(|err| OverlordError::Validation(err.to_string()))?;
        let key = format!("{}:{}:{}", lead_id, conversation.id, step.current_index);
        self.enqueue(Job::new(JobType::Dispatch, lead_id, dispatch_payload, key)).await;

        self.events
            .on_event(&OverlordEvent::TouchFired { lead_id, campaign_id: payload.campaign_id, step_index: step.current_index })
            .await;

        let advanced = scheduler::advance(&step, &campaign, step.current_index, false);
        self.store.upsert_scheduled_step(&advanced).await?;
        Ok(())
    }

    async fn process_handover_fanout(&self, lead_id: LeadId, payload: HandoverFanoutPayload) -> OverlordResult<()> {
        let lead = self.store.get_lead(lead_id).await?;
        let Some(campaign_id) = lead.campaign_id else {
            return Err(OverlordError::Validation("lead has no campaign".to_string()));
        };
        let campaign = self.store.get_campaign(campaign_id).await?;
        let execution = self.store.get_handover_execution(payload.handover_id).await?;
        let dossier: handover::Dossier =
            serde_json::from_value(execution.dossier.clone()).map_err(|err| OverlordError::Validation(err.to_string()))?;

        self.handover
            .fan_out(
                payload.handover_id,
                lead_id,
                payload.conversation_id,
                &campaign.settings.handover_criteria.handover_recipients,
                &dossier,
            )
            .await;
        Ok(())
    }
}

/// Primary-then-fallback channel pick, restricted to channels the lead is
/// actually contactable on. Mirrors the rule `OverlordAgent`'s deterministic
/// fallback uses for the initial routing decision.
fn preferred_channel(lead: &Lead, campaign: &Campaign) -> Option<Channel> {
    let contactable = lead.contactable_channels();
    campaign
        .channel_preferences
        .primary
        .filter(|c| contactable.contains(c))
        .or_else(|| campaign.channel_preferences.fallback.filter(|c| contactable.contains(c)))
        .or_else(|| contactable.first().copied())
}

#[async_trait::async_trait]
impl JobHandler for Engine {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let result: OverlordResult<()> = match job.job_type {
            JobType::Route => self.process_route(job.lead_id).await,
            JobType::Dispatch => match serde_json::from_value::<DispatchPayload>(job.payload.clone()) {
                Ok(payload) => self.process_dispatch(job.lead_id, payload).await,
                Err(err) => Err(OverlordError::Validation(err.to_string())),
            },
            JobType::HandleReply => match serde_json::from_value::<HandleReplyPayload>(job.payload.clone()) {
                Ok(payload) => self.process_handle_reply(job.lead_id, payload).await,
                Err(err) => Err(OverlordError::Validation(err.to_string())),
            },
            JobType::ScheduledSend => match serde_json::from_value::<ScheduledSendPayload>(job.payload.clone()) {
                Ok(payload) => self.process_scheduled_send(job.lead_id, payload).await,
                Err(err) => Err(OverlordError::Validation(err.to_string())),
            },
            JobType::HandoverFanout => match serde_json::from_value::<HandoverFanoutPayload>(job.payload.clone()) {
                Ok(payload) => self.process_handover_fanout(job.lead_id, payload).await,
                Err(err) => Err(OverlordError::Validation(err.to_string())),
            },
        };

        match result {
            Ok(()) => JobOutcome::Done,
            Err(err) if err.retryable() => JobOutcome::RetryAfter(err.to_string()),
            Err(err) => JobOutcome::Permanent(err.to_string()),
        }
    }
}

/// Input to `Engine::ingest` — a normalized lead regardless of which ingress
/// surface (direct API, marketplace `postLead`, IMAP scanner) produced it.
#[derive(Debug, Clone)]
pub struct IngestInput {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source: String,
    pub source_external_id: Option<String>,
    pub campaign_id: Option<CampaignId>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
enum DispatchKind {
    Initial,
    ScheduledTouch,
    Reply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DispatchPayload {
    conversation_id: ConversationId,
    step_index: i64,
    kind: DispatchKind,
    focus: Option<String>,
    incoming: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HandleReplyPayload {
    conversation_id: ConversationId,
    external_id: Option<String>,
    content: String,
    received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScheduledSendPayload {
    campaign_id: CampaignId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HandoverFanoutPayload {
    handover_id: HandoverId,
    conversation_id: ConversationId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlord_store::models::ChannelPreferences;

    fn lead_with_channels(email: Option<&str>, phone: Option<&str>) -> Lead {
        let mut lead = Lead::new_test_stub();
        lead.email = email.map(str::to_string);
        lead.phone = phone.map(str::to_string);
        lead
    }

    #[test]
    fn preferred_channel_honors_primary_when_contactable() {
        let lead = lead_with_channels(Some("a@example.com"), Some("+15551234567"));
        let mut campaign = Campaign::new_test_stub();
        campaign.channel_preferences = ChannelPreferences { primary: Some(Channel::Sms), fallback: Some(Channel::Email) };
        assert_eq!(preferred_channel(&lead, &campaign), Some(Channel::Sms));
    }

    #[test]
    fn preferred_channel_falls_back_when_primary_unreachable() {
        let lead = lead_with_channels(Some("a@example.com"), None);
        let mut campaign = Campaign::new_test_stub();
        campaign.channel_preferences = ChannelPreferences { primary: Some(Channel::Sms), fallback: Some(Channel::Email) };
        assert_eq!(preferred_channel(&lead, &campaign), Some(Channel::Email));
    }

    #[test]
    fn preferred_channel_none_when_nothing_contactable() {
        let lead = lead_with_channels(None, None);
        let mut campaign = Campaign::new_test_stub();
        campaign.channel_preferences = ChannelPreferences { primary: Some(Channel::Sms), fallback: Some(Channel::Email) };
        assert_eq!(preferred_channel(&lead, &campaign), None);
    }
}
