//! `sqlx`-backed persistence for all entities, with idempotency-key checks
//! on the insert paths that need at-most-once semantics and compare-and-set
//! `version` updates everywhere concurrent writers can race.

use crate::decision_ledger::{self, GENESIS_HASH};
use crate::error::{StoreError, StoreResult};
use crate::id::{
    AgentId, CampaignId, CommunicationId, ConversationId, HandoverId, LeadId, MessageId, TemplateId,
};
use crate::models::*;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

/// Thin wrapper over a `SqlitePool`. Cheap to clone (pool is `Arc`-backed
/// internally), so a single `Store` is shared across worker tasks.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to `database_url` (e.g. `sqlite::memory:` for tests, or a
    /// file path for durable deployments) and run embedded migrations.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an already-open pool (used by tests that need finer control
    /// over the pool's lifetime than `connect` provides).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---------------------------------------------------------------
    // Lead
    // ---------------------------------------------------------------

    /// Create a lead, or return the existing one if `(source, source_external_id)`
    /// was already ingested — the idempotency contract of `Ingest`.
    pub async fn create_lead_idempotent(
        &self,
        name: &str,
        email: Option<&str>,
        phone: Option<&str>,
        source: &str,
        source_external_id: Option<&str>,
        campaign_id: Option<CampaignId>,
        metadata: serde_json::Value,
    ) -> StoreResult<(Lead, bool)> {
        if let Some(external_id) = source_external_id {
            if let Some(existing) = self
                .find_lead_by_source_external_id(source, external_id)
                .await?
            {
                return Ok((existing, false));
            }
        }

        let now = Utc::now();
        let lead = Lead {
            id: LeadId::new(),
            name: name.to_string(),
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            source: source.to_string(),
            campaign_id,
            status: LeadStatus::New,
            metadata,
            created_at: now,
            updated_at: now,
            version: 1,
        };

        sqlx::query(
            r#"INSERT INTO leads
               (id, name, email, phone, source, source_external_id, campaign_id, status, metadata, created_at, updated_at, version)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(lead.id.to_string())
        .bind(&lead.name)
        .bind(&lead.email)
        .bind(&lead.phone)
        .bind(&lead.source)
        .bind(source_external_id)
        .bind(lead.campaign_id.map(|c| c.to_string()))
        .bind(status_str(lead.status))
        .bind(lead.metadata.to_string())
        .bind(lead.created_at.to_rfc3339())
        .bind(lead.updated_at.to_rfc3339())
        .bind(lead.version)
        .execute(&self.pool)
        .await?;

        Ok((lead, true))
    }

    async fn find_lead_by_source_external_id(
        &self,
        source: &str,
        external_id: &str,
    ) -> StoreResult<Option<Lead>> {
        let row = sqlx::query(
            "SELECT * FROM leads WHERE source = ? AND source_external_id = ?",
        )
        .bind(source)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| lead_from_row(&r)).transpose()
    }

    pub async fn get_lead(&self, id: LeadId) -> StoreResult<Lead> {
        let row = sqlx::query("SELECT * FROM leads WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { kind: "lead", id: id.to_string() })?;
        lead_from_row(&row)
    }

    /// Compare-and-set status update. Fails with `VersionConflict` if another
    /// writer advanced the row since `expected_version` was read.
    pub async fn update_lead_status(
        &self,
        id: LeadId,
        new_status: LeadStatus,
        expected_version: i64,
    ) -> StoreResult<Lead> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE leads SET status = ?, updated_at = ?, version = version + 1 WHERE id = ? AND version = ?",
        )
        .bind(status_str(new_status))
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::VersionConflict {
                kind: "lead",
                id: id.to_string(),
                expected: expected_version,
            });
        }
        self.get_lead(id).await
    }

    pub async fn find_leads_by_email(&self, email: &str) -> StoreResult<Vec<Lead>> {
        let rows = sqlx::query("SELECT * FROM leads WHERE email = ?")
            .bind(email)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(lead_from_row).collect()
    }

    pub async fn find_leads_by_phone(&self, phone_e164: &str) -> StoreResult<Vec<Lead>> {
        let rows = sqlx::query("SELECT * FROM leads WHERE phone = ?")
            .bind(phone_e164)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(lead_from_row).collect()
    }

    // ---------------------------------------------------------------
    // Conversation
    // ---------------------------------------------------------------

    /// Return the lead's single active conversation on `channel`, creating
    /// one if none exists. Enforces "at most one active conversation per
    /// (lead, channel)" at the query layer: the lookup and insert happen
    /// inside one connection without yielding, and the unique index on
    /// `(lead_id, channel)` for active rows makes a race produce a
    /// constraint error rather than two active rows.
    pub async fn get_or_create_active_conversation(
        &self,
        lead_id: LeadId,
        channel: Channel,
    ) -> StoreResult<Conversation> {
        if let Some(existing) = self.find_active_conversation(lead_id, channel).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::new(),
            lead_id,
            channel,
            status: ConversationStatus::Active,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        sqlx::query(
            r#"INSERT INTO conversations (id, lead_id, channel, status, created_at, updated_at, version)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(conversation.id.to_string())
        .bind(lead_id.to_string())
        .bind(channel_str(channel))
        .bind(conversation_status_str(conversation.status))
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .bind(conversation.version)
        .execute(&self.pool)
        .await?;
        Ok(conversation)
    }

    /// Finds the lead's active (non-`closed`) conversation for a channel.
    /// If more than one such row exists (should not happen given the unique
    /// index, but defensive against data imported outside the happy path),
    /// the most recently updated one wins.
    pub async fn find_active_conversation(
        &self,
        lead_id: LeadId,
        channel: Channel,
    ) -> StoreResult<Option<Conversation>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE lead_id = ? AND channel = ? AND status != 'closed' ORDER BY updated_at DESC",
        )
        .bind(lead_id.to_string())
        .bind(channel_str(channel))
        .fetch_all(&self.pool)
        .await?;
        rows.first().map(conversation_from_row).transpose()
    }

    pub async fn get_conversation(&self, id: ConversationId) -> StoreResult<Conversation> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { kind: "conversation", id: id.to_string() })?;
        conversation_from_row(&row)
    }

    pub async fn update_conversation_status(
        &self,
        id: ConversationId,
        new_status: ConversationStatus,
        expected_version: i64,
    ) -> StoreResult<Conversation> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE conversations SET status = ?, updated_at = ?, version = version + 1 WHERE id = ? AND version = ?",
        )
        .bind(conversation_status_str(new_status))
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::VersionConflict {
                kind: "conversation",
                id: id.to_string(),
                expected: expected_version,
            });
        }
        self.get_conversation(id).await
    }

    // ---------------------------------------------------------------
    // Message
    // ---------------------------------------------------------------

    /// Append a message, assigning the next strictly-increasing sequence
    /// number for the conversation. Callers rely on this for the "no gaps"
    /// invariant — the sequence is computed and inserted in one statement.
    pub async fn append_message(
        &self,
        conversation_id: ConversationId,
        direction: Direction,
        content: &str,
        timestamp: DateTime<Utc>,
        external_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;
        let next_sequence: i64 = sqlx::query(
            "SELECT COALESCE(MAX(sequence), -1) + 1 AS next FROM messages WHERE conversation_id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_one(&mut *tx)
        .await?
        .try_get("next")?;

        let message = Message {
            id: MessageId::new(),
            conversation_id,
            sequence: next_sequence,
            direction,
            content: content.to_string(),
            timestamp,
            external_id: external_id.map(str::to_string),
            metadata,
        };

        sqlx::query(
            r#"INSERT INTO messages (id, conversation_id, sequence, direction, content, timestamp, external_id, metadata)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(message.id.to_string())
        .bind(conversation_id.to_string())
        .bind(next_sequence)
        .bind(direction_str(direction))
        .bind(&message.content)
        .bind(message.timestamp.to_rfc3339())
        .bind(external_id)
        .bind(message.metadata.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(message)
    }

    /// Whether an inbound message with this external id has already been
    /// recorded for the conversation's lead within the last 24h — the guard
    /// against duplicate webhook deliveries.
    pub async fn has_recent_external_message(
        &self,
        external_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM messages WHERE external_id = ? AND timestamp >= ?",
        )
        .bind(external_id)
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;
        Ok(count > 0)
    }

    pub async fn list_messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE conversation_id = ? ORDER BY sequence ASC")
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    // ---------------------------------------------------------------
    // Decision ledger
    // ---------------------------------------------------------------

    /// Append the next decision in a lead's hash chain, looking up the
    /// current tip under the same connection to avoid a lost-update race
    /// between concurrent decisions for the same lead (callers additionally
    /// hold the per-lead job lease, so this is a defensive second layer).
    pub async fn append_decision(
        &self,
        lead_id: LeadId,
        agent_kind: AgentKind,
        action: &str,
        reasoning: &str,
        data: serde_json::Value,
    ) -> StoreResult<Decision> {
        let mut tx = self.pool.begin().await?;
        let prev_hash: String = sqlx::query(
            "SELECT hash FROM decisions WHERE lead_id = ? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(lead_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| r.try_get::<String, _>("hash"))
        .transpose()?
        .unwrap_or_else(|| GENESIS_HASH.to_string());

        let decision = decision_ledger::next_decision(
            &prev_hash,
            lead_id,
            agent_kind,
            action,
            reasoning,
            data,
            Utc::now(),
        );

        sqlx::query(
            r#"INSERT INTO decisions (id, lead_id, agent_kind, action, reasoning, data, timestamp, prev_hash, hash)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(decision.id.to_string())
        .bind(lead_id.to_string())
        .bind(agent_kind_str(agent_kind))
        .bind(&decision.action)
        .bind(&decision.reasoning)
        .bind(decision.data.to_string())
        .bind(decision.timestamp.to_rfc3339())
        .bind(&decision.prev_hash)
        .bind(&decision.hash)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(decision)
    }

    pub async fn list_decisions(&self, lead_id: LeadId) -> StoreResult<Vec<Decision>> {
        let rows = sqlx::query("SELECT * FROM decisions WHERE lead_id = ? ORDER BY timestamp ASC")
            .bind(lead_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decision_from_row).collect()
    }

    // ---------------------------------------------------------------
    // Communication
    // ---------------------------------------------------------------

    /// Record a new dispatch attempt, or return the existing row if this
    /// idempotency key was already used — the mechanism behind "at most one
    /// Communication row in sent/delivered status per (lead, campaign, step)".
    pub async fn create_communication_idempotent(
        &self,
        lead_id: LeadId,
        conversation_id: ConversationId,
        channel: Channel,
        idempotency_key: &str,
    ) -> StoreResult<(Communication, bool)> {
        if let Some(existing) = self.find_communication_by_key(idempotency_key).await? {
            return Ok((existing, false));
        }
        let now = Utc::now();
        let communication = Communication {
            id: CommunicationId::new(),
            lead_id,
            conversation_id,
            channel,
            external_id: None,
            status: CommunicationStatus::Queued,
            idempotency_key: idempotency_key.to_string(),
            created_at: now,
            updated_at: now,
            version: 1,
        };
        sqlx::query(
            r#"INSERT INTO communications
               (id, lead_id, conversation_id, channel, external_id, status, idempotency_key, created_at, updated_at, version)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(communication.id.to_string())
        .bind(lead_id.to_string())
        .bind(conversation_id.to_string())
        .bind(channel_str(channel))
        .bind(&communication.external_id)
        .bind(communication_status_str(communication.status))
        .bind(idempotency_key)
        .bind(communication.created_at.to_rfc3339())
        .bind(communication.updated_at.to_rfc3339())
        .bind(communication.version)
        .execute(&self.pool)
        .await?;
        Ok((communication, true))
    }

    pub async fn find_communication_by_key(&self, key: &str) -> StoreResult<Option<Communication>> {
        let row = sqlx::query("SELECT * FROM communications WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| communication_from_row(&r)).transpose()
    }

    /// Look up a communication by the carrier's opaque external message id
    /// — used for carrier-webhook status updates and the email reply
    /// ingester's `In-Reply-To` tie-break.
    pub async fn find_communication_by_external_id(&self, external_id: &str) -> StoreResult<Option<Communication>> {
        let row = sqlx::query("SELECT * FROM communications WHERE external_id = ? ORDER BY created_at DESC LIMIT 1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| communication_from_row(&r)).transpose()
    }

    pub async fn get_communication(&self, id: CommunicationId) -> StoreResult<Communication> {
        let row = sqlx::query("SELECT * FROM communications WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { kind: "communication", id: id.to_string() })?;
        communication_from_row(&row)
    }

    pub async fn update_communication_status(
        &self,
        id: CommunicationId,
        new_status: CommunicationStatus,
        external_id: Option<&str>,
        expected_version: i64,
    ) -> StoreResult<Communication> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE communications SET status = ?, external_id = COALESCE(?, external_id), updated_at = ?, version = version + 1 WHERE id = ? AND version = ?",
        )
        .bind(communication_status_str(new_status))
        .bind(external_id)
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::VersionConflict {
                kind: "communication",
                id: id.to_string(),
                expected: expected_version,
            });
        }
        let row = sqlx::query("SELECT * FROM communications WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        communication_from_row(&row)
    }

    // ---------------------------------------------------------------
    // HandoverExecution
    // ---------------------------------------------------------------

    /// Record a handover, failing with `DuplicateIdempotencyKey` if one was
    /// already recorded for this conversation's current trigger-cycle — the
    /// "exactly one HandoverExecution per (conversation, trigger-cycle)"
    /// guard.
    pub async fn create_handover_execution(
        &self,
        lead_id: LeadId,
        conversation_id: ConversationId,
        trigger_cycle: &str,
        reason: &str,
        dossier: serde_json::Value,
        follow_up_at: Option<DateTime<Utc>>,
    ) -> StoreResult<HandoverExecution> {
        let exists: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM handover_executions WHERE conversation_id = ? AND trigger_cycle = ?",
        )
        .bind(conversation_id.to_string())
        .bind(trigger_cycle)
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;
        if exists > 0 {
            return Err(StoreError::DuplicateIdempotencyKey {
                kind: "handover_execution",
                key: trigger_cycle.to_string(),
            });
        }

        let execution = HandoverExecution {
            id: HandoverId::new(),
            lead_id,
            conversation_id,
            reason: reason.to_string(),
            dossier,
            attempts: Vec::new(),
            created_at: Utc::now(),
            confirmed_at: None,
            follow_up_at,
            follow_up_sent: false,
        };
        sqlx::query(
            r#"INSERT INTO handover_executions
               (id, lead_id, conversation_id, trigger_cycle, reason, dossier, attempts, created_at, follow_up_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(lead_id.to_string())
        .bind(conversation_id.to_string())
        .bind(trigger_cycle)
        .bind(&execution.reason)
        .bind(execution.dossier.to_string())
        .bind(serde_json::to_string(&execution.attempts)?)
        .bind(execution.created_at.to_rfc3339())
        .bind(execution.follow_up_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(execution)
    }

    pub async fn get_handover_execution(&self, id: HandoverId) -> StoreResult<HandoverExecution> {
        let row = sqlx::query("SELECT * FROM handover_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { kind: "handover_execution", id: id.to_string() })?;
        handover_execution_from_row(&row)
    }

    /// Record the human-system callback acknowledging dossier receipt —
    /// stops any pending follow-up re-check for this handover.
    pub async fn mark_handover_confirmed(&self, id: HandoverId) -> StoreResult<()> {
        sqlx::query("UPDATE handover_executions SET confirmed_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Handovers whose follow-up window has passed, unconfirmed, and not
    /// yet chased. Callers additionally filter out leads no longer in
    /// `HandedOver` status: once a lead moves past handover there's nothing
    /// left to follow up on.
    pub async fn list_handovers_needing_followup(&self, now: DateTime<Utc>) -> StoreResult<Vec<HandoverExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM handover_executions WHERE confirmed_at IS NULL AND follow_up_sent = 0 AND follow_up_at IS NOT NULL AND follow_up_at <= ?",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(handover_execution_from_row).collect()
    }

    pub async fn mark_handover_followup_sent(&self, id: HandoverId) -> StoreResult<()> {
        sqlx::query("UPDATE handover_executions SET follow_up_sent = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_handover_attempt(
        &self,
        id: HandoverId,
        attempt: Attempt,
    ) -> StoreResult<()> {
        let row = sqlx::query("SELECT attempts FROM handover_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { kind: "handover_execution", id: id.to_string() })?;
        let raw: String = row.try_get("attempts")?;
        let mut attempts: Vec<Attempt> = serde_json::from_str(&raw)?;
        attempts.push(attempt);
        sqlx::query("UPDATE handover_executions SET attempts = ? WHERE id = ?")
            .bind(serde_json::to_string(&attempts)?)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // ScheduledStep
    // ---------------------------------------------------------------

    /// Insert a brand-new row (`step.version == 0`) or compare-and-set an
    /// existing one (`step.version` is the version the caller last read).
    /// Returns `false` without erroring if another writer advanced the row
    /// first — callers racing to claim a due step treat that as "someone
    /// else picked it up" rather than a failure.
    pub async fn upsert_scheduled_step(&self, step: &ScheduledStep) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO scheduled_steps (lead_id, campaign_id, current_index, next_fire_at, canceled, version)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(lead_id, campaign_id) DO UPDATE SET
                 current_index = excluded.current_index,
                 next_fire_at = excluded.next_fire_at,
                 canceled = excluded.canceled,
                 version = excluded.version
               WHERE scheduled_steps.version = ?"#,
        )
        .bind(step.lead_id.to_string())
        .bind(step.campaign_id.to_string())
        .bind(step.current_index)
        .bind(step.next_fire_at.map(|t| t.to_rfc3339()))
        .bind(step.canceled)
        .bind(step.version + 1)
        .bind(step.version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_scheduled_step(
        &self,
        lead_id: LeadId,
        campaign_id: CampaignId,
    ) -> StoreResult<Option<ScheduledStep>> {
        let row = sqlx::query("SELECT * FROM scheduled_steps WHERE lead_id = ? AND campaign_id = ?")
            .bind(lead_id.to_string())
            .bind(campaign_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| scheduled_step_from_row(&r)).transpose()
    }

    /// Steps whose `next_fire_at` has passed and which are not canceled —
    /// the set the scheduler's tick pulls and advances.
    pub async fn list_due_steps(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledStep>> {
        let rows = sqlx::query(
            "SELECT * FROM scheduled_steps WHERE canceled = 0 AND next_fire_at IS NOT NULL AND next_fire_at <= ?",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scheduled_step_from_row).collect()
    }

    // ---------------------------------------------------------------
    // OrphanReply
    // ---------------------------------------------------------------

    pub async fn create_orphan_reply(
        &self,
        channel: Channel,
        raw_payload: serde_json::Value,
    ) -> StoreResult<OrphanReply> {
        let orphan = OrphanReply {
            id: MessageId::new(),
            channel,
            raw_payload,
            received_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO orphan_replies (id, channel, raw_payload, received_at) VALUES (?, ?, ?, ?)",
        )
        .bind(orphan.id.to_string())
        .bind(channel_str(channel))
        .bind(orphan.raw_payload.to_string())
        .bind(orphan.received_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(orphan)
    }

    // ---------------------------------------------------------------
    // CircuitBreakerState
    // ---------------------------------------------------------------

    pub async fn load_circuit_breaker(&self, service: &str) -> StoreResult<Option<CircuitBreakerState>> {
        let row = sqlx::query("SELECT * FROM circuit_breaker_states WHERE service = ?")
            .bind(service)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| circuit_breaker_from_row(&r)).transpose()
    }

    pub async fn save_circuit_breaker(&self, state: &CircuitBreakerState) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO circuit_breaker_states
               (service, consecutive_failures, opened_at, half_open_successes, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(service) DO UPDATE SET
                 consecutive_failures = excluded.consecutive_failures,
                 opened_at = excluded.opened_at,
                 half_open_successes = excluded.half_open_successes,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&state.service)
        .bind(state.consecutive_failures)
        .bind(state.opened_at.map(|t| t.to_rfc3339()))
        .bind(state.half_open_successes)
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // DeadLetter
    // ---------------------------------------------------------------

    pub async fn create_dead_letter(
        &self,
        job_type: &str,
        lead_id: Option<LeadId>,
        payload: serde_json::Value,
        attempts_made: i64,
        last_error: &str,
    ) -> StoreResult<DeadLetter> {
        let dead_letter = DeadLetter {
            id: crate::id::DeadLetterId::new(),
            job_type: job_type.to_string(),
            lead_id,
            payload,
            attempts_made,
            last_error: last_error.to_string(),
            failed_at: Utc::now(),
        };
        sqlx::query(
            r#"INSERT INTO dead_letters (id, job_type, lead_id, payload, attempts_made, last_error, failed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(dead_letter.id.to_string())
        .bind(&dead_letter.job_type)
        .bind(lead_id.map(|l| l.to_string()))
        .bind(dead_letter.payload.to_string())
        .bind(attempts_made)
        .bind(&dead_letter.last_error)
        .bind(dead_letter.failed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(dead_letter)
    }

    pub async fn list_dead_letters(&self) -> StoreResult<Vec<DeadLetter>> {
        let rows = sqlx::query("SELECT * FROM dead_letters ORDER BY failed_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    // ---------------------------------------------------------------
    // Campaign / Template / Agent (lookup only; CRUD is out of scope)
    // ---------------------------------------------------------------

    pub async fn get_campaign(&self, id: CampaignId) -> StoreResult<Campaign> {
        let row = sqlx::query("SELECT * FROM campaigns WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { kind: "campaign", id: id.to_string() })?;
        campaign_from_row(&row)
    }

    pub async fn get_template(&self, id: TemplateId) -> StoreResult<Template> {
        let row = sqlx::query("SELECT * FROM templates WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { kind: "template", id: id.to_string() })?;
        template_from_row(&row)
    }

    pub async fn get_agent_definition(&self, id: AgentId) -> StoreResult<AgentDefinition> {
        let row = sqlx::query("SELECT * FROM agent_definitions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { kind: "agent_definition", id: id.to_string() })?;
        agent_definition_from_row(&row)
    }

    // ---------------------------------------------------------------
    // Scheduler support: daily send caps
    // ---------------------------------------------------------------

    /// Count of communications that reached `sent`/`delivered` for leads in
    /// `campaign_id` since `since` — the rolling-24h counter the scheduler
    /// checks against `CampaignSettings.daily_send_cap` before dispatching
    /// a touch.
    pub async fn count_recent_sends_for_campaign(
        &self,
        campaign_id: CampaignId,
        since: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let count: i64 = sqlx::query(
            r#"SELECT COUNT(*) AS n FROM communications c
               JOIN leads l ON l.id = c.lead_id
               WHERE l.campaign_id = ? AND c.status IN ('sent', 'delivered') AND c.updated_at >= ?"#,
        )
        .bind(campaign_id.to_string())
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------
// Row <-> model conversions. Columns are read as plain strings/ints and
// parsed by hand rather than leaning on derive-based enum codecs, so the
// mapping stays obvious to read next to the migration's schema.
// ---------------------------------------------------------------------

fn status_str(s: LeadStatus) -> &'static str {
    match s {
        LeadStatus::New => "new",
        LeadStatus::Contacted => "contacted",
        LeadStatus::Engaged => "engaged",
        LeadStatus::Qualified => "qualified",
        LeadStatus::HandedOver => "handed_over",
        LeadStatus::Completed => "completed",
        LeadStatus::Rejected => "rejected",
        LeadStatus::Archived => "archived",
    }
}

fn parse_status(s: &str) -> StoreResult<LeadStatus> {
    Ok(match s {
        "new" => LeadStatus::New,
        "contacted" => LeadStatus::Contacted,
        "engaged" => LeadStatus::Engaged,
        "qualified" => LeadStatus::Qualified,
        "handed_over" => LeadStatus::HandedOver,
        "completed" => LeadStatus::Completed,
        "rejected" => LeadStatus::Rejected,
        "archived" => LeadStatus::Archived,
        other => {
            return Err(StoreError::Database(sqlx::Error::Decode(
                format!("unknown lead status {other}").into(),
            )))
        }
    })
}

pub(crate) fn channel_str(c: Channel) -> &'static str {
    match c {
        Channel::Email => "email",
        Channel::Sms => "sms",
        Channel::Chat => "chat",
    }
}

fn parse_channel(s: &str) -> StoreResult<Channel> {
    Ok(match s {
        "email" => Channel::Email,
        "sms" => Channel::Sms,
        "chat" => Channel::Chat,
        other => {
            return Err(StoreError::Database(sqlx::Error::Decode(
                format!("unknown channel {other}").into(),
            )))
        }
    })
}

fn conversation_status_str(s: ConversationStatus) -> &'static str {
    match s {
        ConversationStatus::Active => "active",
        ConversationStatus::AwaitingReply => "awaiting_reply",
        ConversationStatus::Replied => "replied",
        ConversationStatus::Closed => "closed",
    }
}

fn parse_conversation_status(s: &str) -> StoreResult<ConversationStatus> {
    Ok(match s {
        "active" => ConversationStatus::Active,
        "awaiting_reply" => ConversationStatus::AwaitingReply,
        "replied" => ConversationStatus::Replied,
        "closed" => ConversationStatus::Closed,
        other => {
            return Err(StoreError::Database(sqlx::Error::Decode(
                format!("unknown conversation status {other}").into(),
            )))
        }
    })
}

fn direction_str(d: Direction) -> &'static str {
    match d {
        Direction::Inbound => "inbound",
        Direction::Outbound => "outbound",
    }
}

fn parse_direction(s: &str) -> StoreResult<Direction> {
    Ok(match s {
        "inbound" => Direction::Inbound,
        "outbound" => Direction::Outbound,
        other => {
            return Err(StoreError::Database(sqlx::Error::Decode(
                format!("unknown direction {other}").into(),
            )))
        }
    })
}

fn agent_kind_str(k: AgentKind) -> &'static str {
    match k {
        AgentKind::Overlord => "overlord",
        AgentKind::Email => "email",
        AgentKind::Sms => "sms",
        AgentKind::Chat => "chat",
    }
}

fn parse_agent_kind(s: &str) -> StoreResult<AgentKind> {
    Ok(match s {
        "overlord" => AgentKind::Overlord,
        "email" => AgentKind::Email,
        "sms" => AgentKind::Sms,
        "chat" => AgentKind::Chat,
        other => {
            return Err(StoreError::Database(sqlx::Error::Decode(
                format!("unknown agent kind {other}").into(),
            )))
        }
    })
}

fn communication_status_str(s: CommunicationStatus) -> &'static str {
    match s {
        CommunicationStatus::Queued => "queued",
        CommunicationStatus::Sent => "sent",
        CommunicationStatus::Delivered => "delivered",
        CommunicationStatus::Bounced => "bounced",
        CommunicationStatus::Failed => "failed",
    }
}

fn parse_communication_status(s: &str) -> StoreResult<CommunicationStatus> {
    Ok(match s {
        "queued" => CommunicationStatus::Queued,
        "sent" => CommunicationStatus::Sent,
        "delivered" => CommunicationStatus::Delivered,
        "bounced" => CommunicationStatus::Bounced,
        "failed" => CommunicationStatus::Failed,
        other => {
            return Err(StoreError::Database(sqlx::Error::Decode(
                format!("unknown communication status {other}").into(),
            )))
        }
    })
}

fn parse_dt(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))
}

fn lead_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Lead> {
    Ok(Lead {
        id: LeadId::from_str(row.try_get::<String, _>("id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        source: row.try_get("source")?,
        campaign_id: row
            .try_get::<Option<String>, _>("campaign_id")?
            .map(|s| CampaignId::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        metadata: serde_json::from_str(&row.try_get::<String, _>("metadata")?)?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at")?)?,
        version: row.try_get("version")?,
    })
}

fn conversation_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Conversation> {
    Ok(Conversation {
        id: ConversationId::from_str(row.try_get::<String, _>("id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        lead_id: LeadId::from_str(row.try_get::<String, _>("lead_id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        channel: parse_channel(&row.try_get::<String, _>("channel")?)?,
        status: parse_conversation_status(&row.try_get::<String, _>("status")?)?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at")?)?,
        version: row.try_get("version")?,
    })
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Message> {
    Ok(Message {
        id: MessageId::from_str(row.try_get::<String, _>("id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        conversation_id: ConversationId::from_str(row.try_get::<String, _>("conversation_id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        sequence: row.try_get("sequence")?,
        direction: parse_direction(&row.try_get::<String, _>("direction")?)?,
        content: row.try_get("content")?,
        timestamp: parse_dt(&row.try_get::<String, _>("timestamp")?)?,
        external_id: row.try_get("external_id")?,
        metadata: serde_json::from_str(&row.try_get::<String, _>("metadata")?)?,
    })
}

fn decision_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Decision> {
    Ok(Decision {
        id: crate::id::DecisionId::from_str(row.try_get::<String, _>("id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        lead_id: LeadId::from_str(row.try_get::<String, _>("lead_id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        agent_kind: parse_agent_kind(&row.try_get::<String, _>("agent_kind")?)?,
        action: row.try_get("action")?,
        reasoning: row.try_get("reasoning")?,
        data: serde_json::from_str(&row.try_get::<String, _>("data")?)?,
        timestamp: parse_dt(&row.try_get::<String, _>("timestamp")?)?,
        prev_hash: row.try_get("prev_hash")?,
        hash: row.try_get("hash")?,
    })
}

fn communication_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Communication> {
    Ok(Communication {
        id: CommunicationId::from_str(row.try_get::<String, _>("id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        lead_id: LeadId::from_str(row.try_get::<String, _>("lead_id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        conversation_id: ConversationId::from_str(row.try_get::<String, _>("conversation_id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        channel: parse_channel(&row.try_get::<String, _>("channel")?)?,
        external_id: row.try_get("external_id")?,
        status: parse_communication_status(&row.try_get::<String, _>("status")?)?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at")?)?,
        version: row.try_get("version")?,
    })
}

fn handover_execution_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<HandoverExecution> {
    Ok(HandoverExecution {
        id: HandoverId::from_str(row.try_get::<String, _>("id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        lead_id: LeadId::from_str(row.try_get::<String, _>("lead_id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        conversation_id: ConversationId::from_str(row.try_get::<String, _>("conversation_id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        reason: row.try_get("reason")?,
        dossier: serde_json::from_str(&row.try_get::<String, _>("dossier")?)?,
        attempts: serde_json::from_str(&row.try_get::<String, _>("attempts")?)?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
        confirmed_at: row.try_get::<Option<String>, _>("confirmed_at")?.map(|s| parse_dt(&s)).transpose()?,
        follow_up_at: row.try_get::<Option<String>, _>("follow_up_at")?.map(|s| parse_dt(&s)).transpose()?,
        follow_up_sent: row.try_get("follow_up_sent")?,
    })
}

fn scheduled_step_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<ScheduledStep> {
    Ok(ScheduledStep {
        lead_id: LeadId::from_str(row.try_get::<String, _>("lead_id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        campaign_id: CampaignId::from_str(row.try_get::<String, _>("campaign_id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        current_index: row.try_get("current_index")?,
        next_fire_at: row
            .try_get::<Option<String>, _>("next_fire_at")?
            .map(|s| parse_dt(&s))
            .transpose()?,
        canceled: row.try_get("canceled")?,
        version: row.try_get("version")?,
    })
}

fn circuit_breaker_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<CircuitBreakerState> {
    Ok(CircuitBreakerState {
        service: row.try_get("service")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        opened_at: row
            .try_get::<Option<String>, _>("opened_at")?
            .map(|s| parse_dt(&s))
            .transpose()?,
        half_open_successes: row.try_get("half_open_successes")?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn dead_letter_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<DeadLetter> {
    Ok(DeadLetter {
        id: crate::id::DeadLetterId::from_str(row.try_get::<String, _>("id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        job_type: row.try_get("job_type")?,
        lead_id: row
            .try_get::<Option<String>, _>("lead_id")?
            .map(|s| LeadId::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        payload: serde_json::from_str(&row.try_get::<String, _>("payload")?)?,
        attempts_made: row.try_get("attempts_made")?,
        last_error: row.try_get("last_error")?,
        failed_at: parse_dt(&row.try_get::<String, _>("failed_at")?)?,
    })
}

fn campaign_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Campaign> {
    Ok(Campaign {
        id: CampaignId::from_str(row.try_get::<String, _>("id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        name: row.try_get("name")?,
        agent_id: AgentId::from_str(row.try_get::<String, _>("agent_id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        conversation_mode: serde_json::from_str(&row.try_get::<String, _>("conversation_mode")?)?,
        touch_sequence: serde_json::from_str(&row.try_get::<String, _>("touch_sequence")?)?,
        channel_preferences: serde_json::from_str(&row.try_get::<String, _>("channel_preferences")?)?,
        settings: serde_json::from_str(&row.try_get::<String, _>("settings")?)?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn template_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Template> {
    Ok(Template {
        id: TemplateId::from_str(row.try_get::<String, _>("id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        name: row.try_get("name")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        variables: serde_json::from_str(&row.try_get::<String, _>("variables")?)?,
        category: row.try_get("category")?,
    })
}

fn agent_definition_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<AgentDefinition> {
    Ok(AgentDefinition {
        id: AgentId::from_str(row.try_get::<String, _>("id")?.as_str())
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
        kind: parse_agent_kind(&row.try_get::<String, _>("kind")?)?,
        end_goal: row.try_get("end_goal")?,
        personality: row.try_get("personality")?,
        instructions: serde_json::from_str(&row.try_get::<String, _>("instructions")?)?,
        domain_expertise: row.try_get("domain_expertise")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        Store::from_pool(pool)
    }

    #[tokio::test]
    async fn ingest_is_idempotent_on_source_external_id() {
        let store = test_store().await;
        let (lead1, created1) = store
            .create_lead_idempotent(
                "John Doe",
                Some("john@test.com"),
                None,
                "partner_x",
                Some("ext-1"),
                None,
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert!(created1);

        let (lead2, created2) = store
            .create_lead_idempotent(
                "John Doe",
                Some("john@test.com"),
                None,
                "partner_x",
                Some("ext-1"),
                None,
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert!(!created2);
        assert_eq!(lead1.id, lead2.id);
    }

    #[tokio::test]
    async fn lead_status_update_rejects_stale_version() {
        let store = test_store().await;
        let (lead, _) = store
            .create_lead_idempotent("Jane", Some("jane@test.com"), None, "web", None, None, serde_json::json!({}))
            .await
            .unwrap();

        let updated = store
            .update_lead_status(lead.id, LeadStatus::Contacted, lead.version)
            .await
            .unwrap();
        assert_eq!(updated.status, LeadStatus::Contacted);
        assert_eq!(updated.version, lead.version + 1);

        let stale = store.update_lead_status(lead.id, LeadStatus::Engaged, lead.version).await;
        assert!(matches!(stale, Err(StoreError::VersionConflict { .. })));
    }

    #[tokio::test]
    async fn only_one_active_conversation_per_channel() {
        let store = test_store().await;
        let (lead, _) = store
            .create_lead_idempotent("Jane", Some("jane@test.com"), None, "web", None, None, serde_json::json!({}))
            .await
            .unwrap();

        let c1 = store.get_or_create_active_conversation(lead.id, Channel::Email).await.unwrap();
        let c2 = store.get_or_create_active_conversation(lead.id, Channel::Email).await.unwrap();
        assert_eq!(c1.id, c2.id);
    }

    #[tokio::test]
    async fn messages_get_gapless_increasing_sequence() {
        let store = test_store().await;
        let (lead, _) = store
            .create_lead_idempotent("Jane", Some("jane@test.com"), None, "web", None, None, serde_json::json!({}))
            .await
            .unwrap();
        let conversation = store.get_or_create_active_conversation(lead.id, Channel::Email).await.unwrap();

        let m0 = store
            .append_message(conversation.id, Direction::Outbound, "hi", Utc::now(), None, serde_json::json!({}))
            .await
            .unwrap();
        let m1 = store
            .append_message(conversation.id, Direction::Inbound, "hello", Utc::now(), None, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(m0.sequence, 0);
        assert_eq!(m1.sequence, 1);
    }

    #[tokio::test]
    async fn decisions_chain_across_appends() {
        let store = test_store().await;
        let (lead, _) = store
            .create_lead_idempotent("Jane", Some("jane@test.com"), None, "web", None, None, serde_json::json!({}))
            .await
            .unwrap();

        let d0 = store
            .append_decision(lead.id, AgentKind::Overlord, "assign_channel", "only email", serde_json::json!({}))
            .await
            .unwrap();
        let d1 = store
            .append_decision(lead.id, AgentKind::Email, "compose_initial", "welcome", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(d1.prev_hash, d0.hash);

        let chain = store.list_decisions(lead.id).await.unwrap();
        assert_eq!(chain.len(), 2);
        decision_ledger::verify_chain(&chain).unwrap();
    }

    #[tokio::test]
    async fn communication_dispatch_is_idempotent() {
        let store = test_store().await;
        let (lead, _) = store
            .create_lead_idempotent("Jane", Some("jane@test.com"), None, "web", None, None, serde_json::json!({}))
            .await
            .unwrap();
        let conversation = store.get_or_create_active_conversation(lead.id, Channel::Email).await.unwrap();
        let key = format!("{}:{}:0", lead.id, conversation.id);

        let (c1, created1) = store
            .create_communication_idempotent(lead.id, conversation.id, Channel::Email, &key)
            .await
            .unwrap();
        assert!(created1);
        let (c2, created2) = store
            .create_communication_idempotent(lead.id, conversation.id, Channel::Email, &key)
            .await
            .unwrap();
        assert!(!created2);
        assert_eq!(c1.id, c2.id);
    }

    #[tokio::test]
    async fn handover_execution_guards_duplicate_trigger_cycle() {
        let store = test_store().await;
        let (lead, _) = store
            .create_lead_idempotent("Jane", Some("jane@test.com"), None, "web", None, None, serde_json::json!({}))
            .await
            .unwrap();
        let conversation = store.get_or_create_active_conversation(lead.id, Channel::Email).await.unwrap();

        store
            .create_handover_execution(lead.id, conversation.id, "cycle-1", "qualified", serde_json::json!({}), None)
            .await
            .unwrap();
        let second = store
            .create_handover_execution(lead.id, conversation.id, "cycle-1", "qualified", serde_json::json!({}), None)
            .await;
        assert!(matches!(second, Err(StoreError::DuplicateIdempotencyKey { .. })));
    }
}
