//! Hash-chained `Decision` audit log.
//!
//! Each lead has its own chain: every [`Decision`] row embeds the SHA-256
//! hash of the row before it, so the sequence of routing/agent decisions for
//! a lead can be verified tamper-evident end to end. The chain is keyed by
//! `lead_id` rather than by session, since a lead's decisions span multiple
//! agent kinds and conversations over its whole lifetime.

use crate::id::{DecisionId, LeadId};
use crate::models::{AgentKind, Decision};
use chrono::Utc;
use sha2::{Digest, Sha256};

/// Hash used as `prev_hash` for the first decision in a lead's chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Compute the hash for a decision given the preceding hash and this row's
/// content. Hashing the previous hash alongside the content is what makes
/// the chain tamper-evident: changing any historical row changes every hash
/// after it.
pub fn compute_hash(
    prev_hash: &str,
    lead_id: LeadId,
    agent_kind: AgentKind,
    action: &str,
    reasoning: &str,
    data: &serde_json::Value,
    timestamp: chrono::DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(lead_id.to_string().as_bytes());
    hasher.update(format!("{agent_kind:?}").as_bytes());
    hasher.update(action.as_bytes());
    hasher.update(reasoning.as_bytes());
    hasher.update(data.to_string().as_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Build the next [`Decision`] in a lead's chain given the hash of the
/// previous entry (or [`GENESIS_HASH`] for the first).
pub fn next_decision(
    prev_hash: &str,
    lead_id: LeadId,
    agent_kind: AgentKind,
    action: impl Into<String>,
    reasoning: impl Into<String>,
    data: serde_json::Value,
    now: chrono::DateTime<Utc>,
) -> Decision {
    let action = action.into();
    let reasoning = reasoning.into();
    let hash = compute_hash(prev_hash, lead_id, agent_kind, &action, &reasoning, &data, now);
    Decision {
        id: DecisionId::new(),
        lead_id,
        agent_kind,
        action,
        reasoning,
        data,
        timestamp: now,
        prev_hash: prev_hash.to_string(),
        hash,
    }
}

/// Verify that a sequence of decisions (already ordered by timestamp) forms
/// an unbroken chain starting from [`GENESIS_HASH`].
pub fn verify_chain(decisions: &[Decision]) -> Result<(), crate::error::StoreError> {
    let mut expected_prev = GENESIS_HASH.to_string();
    for decision in decisions {
        if decision.prev_hash != expected_prev {
            return Err(crate::error::StoreError::ChainMismatch {
                lead_id: decision.lead_id.to_string(),
                expected: expected_prev,
                found: decision.prev_hash.clone(),
            });
        }
        let recomputed = compute_hash(
            &decision.prev_hash,
            decision.lead_id,
            decision.agent_kind,
            &decision.action,
            &decision.reasoning,
            &decision.data,
            decision.timestamp,
        );
        if recomputed != decision.hash {
            return Err(crate::error::StoreError::ChainMismatch {
                lead_id: decision.lead_id.to_string(),
                expected: recomputed,
                found: decision.hash.clone(),
            });
        }
        expected_prev = decision.hash.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_of_three_verifies() {
        let lead_id = LeadId::new();
        let t0 = Utc::now();
        let d0 = next_decision(
            GENESIS_HASH,
            lead_id,
            AgentKind::Overlord,
            "assign_channel",
            "lead has email only",
            serde_json::json!({"channel": "email"}),
            t0,
        );
        let d1 = next_decision(
            &d0.hash,
            lead_id,
            AgentKind::Email,
            "compose_initial",
            "welcome touch",
            serde_json::json!({}),
            t0 + chrono::Duration::seconds(1),
        );
        let d2 = next_decision(
            &d1.hash,
            lead_id,
            AgentKind::Email,
            "evaluate_signals",
            "scored reply",
            serde_json::json!({"score": 7.5}),
            t0 + chrono::Duration::seconds(2),
        );
        assert!(verify_chain(&[d0, d1, d2]).is_ok());
    }

    #[test]
    fn tampered_row_breaks_chain() {
        let lead_id = LeadId::new();
        let t0 = Utc::now();
        let d0 = next_decision(
            GENESIS_HASH,
            lead_id,
            AgentKind::Overlord,
            "assign_channel",
            "lead has email only",
            serde_json::json!({"channel": "email"}),
            t0,
        );
        let mut d1 = next_decision(
            &d0.hash,
            lead_id,
            AgentKind::Email,
            "compose_initial",
            "welcome touch",
            serde_json::json!({}),
            t0 + chrono::Duration::seconds(1),
        );
        d1.reasoning = "tampered".to_string();
        assert!(verify_chain(&[d0, d1]).is_err());
    }
}
