//! End-to-end exercises of the Engagement Engine state machine against a
//! real (in-memory) store and the real job queue — no model router
//! (deterministic fallback throughout), `LoggingCarrier`s standing in for
//! SMTP/Twilio.

mod common;

use std::time::Duration;

use overlord::engine::IngestInput;
use overlord_store::models::{
    AgentKind, Channel, ChannelPreferences, ConversationMode, ConversationStatus, DelayUnit,
    LeadStatus, TouchStep,
};

use common::{
    default_handover_criteria, harness, seed_agent, seed_campaign, seed_template, wait_until,
    CampaignSpec,
};

/// Happy path, auto mode (substituting a millisecond delay for the
/// multi-day second touch):
/// ingest -> routed to email -> templated welcome dispatched -> inbound
/// reply containing a handover keyword -> conversation flips to
/// handed-over with a dossier recorded.
#[tokio::test]
async fn happy_path_auto_mode_dispatches_then_hands_over_on_keyword_reply() {
    let h = harness().await;

    let agent_id = seed_agent(&h.store, AgentKind::Email).await;
    let template_id = seed_template(
        &h.store,
        "Welcome to the demo",
        "Hi {{lead.first_name}}, excited to show you {{campaign.name}}.",
    )
    .await;
    let campaign_id = seed_campaign(
        &h.store,
        agent_id,
        CampaignSpec {
            conversation_mode: ConversationMode::Auto,
            channel_preferences: ChannelPreferences { primary: Some(Channel::Email), fallback: None },
            touch_sequence: vec![TouchStep { template_id, delay_amount: 0, delay_unit: DelayUnit::Minutes, conditions: vec![] }],
            handover_criteria: default_handover_criteria(&["pricing"]),
        },
    )
    .await;

    let (lead, created) = h
        .engine
        .ingest(IngestInput {
            name: "Sarah Johnson".to_string(),
            email: Some("sarah.j@techstartup.com".to_string()),
            phone: None,
            source: "web".to_string(),
            source_external_id: Some("lead-1".to_string()),
            campaign_id: Some(campaign_id),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();
    assert!(created);

    // Routing + initial dispatch happen off the job queue; poll until the
    // lead flips out of `New` and the carrier recorded the templated send.
    wait_until(Duration::from_secs(5), || {
        let store = h.store.clone();
        async move {
            let lead = store.get_lead(lead.id).await.unwrap();
            (lead.status != LeadStatus::New).then_some(lead)
        }
    })
    .await;

    let sent = h.email_carrier.sent().await;
    assert_eq!(sent.len(), 1, "exactly one templated welcome should have been dispatched");
    assert_eq!(sent[0].to, "sarah.j@techstartup.com");
    assert!(sent[0].body.contains("Sarah"), "template should substitute {{{{lead.first_name}}}}: {}", sent[0].body);
    assert!(sent[0].body.contains("saas-demo"), "template should substitute {{{{campaign.name}}}}: {}", sent[0].body);

    let lead_after_send = h.store.get_lead(lead.id).await.unwrap();
    assert_eq!(lead_after_send.status, LeadStatus::Contacted);

    let conversation = h
        .store
        .find_active_conversation(lead.id, Channel::Email)
        .await
        .unwrap()
        .expect("conversation should exist after initial dispatch");
    assert_eq!(conversation.status, ConversationStatus::AwaitingReply);

    // Inbound reply mentioning the configured handover keyword.
    h.engine
        .enqueue_handle_reply(
            lead.id,
            conversation.id,
            "Can you tell me about pricing?".to_string(),
            Some("carrier-msg-1".to_string()),
            chrono::Utc::now(),
        )
        .await
        .unwrap();

    let handed_over = wait_until(Duration::from_secs(5), || {
        let store = h.store.clone();
        async move {
            let lead = store.get_lead(lead.id).await.unwrap();
            (lead.status == LeadStatus::HandedOver).then_some(lead)
        }
    })
    .await;
    assert_eq!(handed_over.status, LeadStatus::HandedOver);

    let row_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM handover_executions WHERE lead_id = ?")
        .bind(lead.id.to_string())
        .fetch_one(h.store.pool())
        .await
        .unwrap();
    assert_eq!(row_count, 1, "exactly one HandoverExecution row should exist per (conversation, trigger-cycle)");

    // Re-ingesting the same partner-external-id is idempotent: same lead,
    // no new row, no duplicate route/dispatch.
    let (lead2, created2) = h
        .engine
        .ingest(IngestInput {
            name: "Sarah Johnson".to_string(),
            email: Some("sarah.j@techstartup.com".to_string()),
            phone: None,
            source: "web".to_string(),
            source_external_id: Some("lead-1".to_string()),
            campaign_id: Some(campaign_id),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();
    assert!(!created2);
    assert_eq!(lead2.id, lead.id);
    assert_eq!(h.email_carrier.sent().await.len(), 1, "duplicate ingest must not trigger a second dispatch");
}

/// Opt-out keyword closes the conversation within one transition and
/// leaves the lead in a terminal state without ever reaching handover.
#[tokio::test]
async fn opt_out_keyword_closes_conversation_without_handover() {
    let h = harness().await;

    let agent_id = seed_agent(&h.store, AgentKind::Sms).await;
    let template_id = seed_template(&h.store, "", "Hi {{lead.first_name}}, quick question about your rollout.").await;
    let campaign_id = seed_campaign(
        &h.store,
        agent_id,
        CampaignSpec {
            conversation_mode: ConversationMode::Auto,
            channel_preferences: ChannelPreferences { primary: Some(Channel::Sms), fallback: None },
            touch_sequence: vec![TouchStep { template_id, delay_amount: 0, delay_unit: DelayUnit::Minutes, conditions: vec![] }],
            handover_criteria: default_handover_criteria(&["pricing"]),
        },
    )
    .await;

    let (lead, _created) = h
        .engine
        .ingest(IngestInput {
            name: "Jamie Rivera".to_string(),
            email: None,
            phone: Some("+15551234567".to_string()),
            source: "web".to_string(),
            source_external_id: None,
            campaign_id: Some(campaign_id),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || {
        let store = h.store.clone();
        async move {
            let lead = store.get_lead(lead.id).await.unwrap();
            (lead.status != LeadStatus::New).then_some(())
        }
    })
    .await;

    let conversation = h.store.find_active_conversation(lead.id, Channel::Sms).await.unwrap().expect("sms conversation should exist");

    h.engine
        .enqueue_handle_reply(lead.id, conversation.id, "STOP".to_string(), Some("carrier-msg-2".to_string()), chrono::Utc::now())
        .await
        .unwrap();

    let rejected = wait_until(Duration::from_secs(5), || {
        let store = h.store.clone();
        async move {
            let lead = store.get_lead(lead.id).await.unwrap();
            (lead.status == LeadStatus::Rejected).then_some(lead)
        }
    })
    .await;
    assert_eq!(rejected.status, LeadStatus::Rejected);

    let closed_conversation = h.store.get_conversation(conversation.id).await.unwrap();
    assert_eq!(closed_conversation.status, ConversationStatus::Closed);

    let row_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM handover_executions WHERE lead_id = ?")
        .bind(lead.id.to_string())
        .fetch_one(h.store.pool())
        .await
        .unwrap();
    assert_eq!(row_count, 0, "an opt-out must never trigger a handover");

    let step = h.store.get_scheduled_step(lead.id, campaign_id).await.unwrap();
    if let Some(step) = step {
        assert!(step.canceled || step.next_fire_at.is_none(), "remaining touches must be canceled after opt-out");
    }
}

/// `template_only` mode: a non-opt-out reply must not cancel the
/// remaining touch sequence, and the reply itself must be answered with
/// the next touch's template rather than an AI-composed message.
#[tokio::test]
async fn template_only_reply_renders_next_template_and_keeps_sequence_alive() {
    let h = harness().await;

    let agent_id = seed_agent(&h.store, AgentKind::Email).await;
    let first_template = seed_template(&h.store, "Welcome", "Hi {{lead.first_name}}, welcome aboard.").await;
    let second_template = seed_template(&h.store, "Second touch", "Just circling back, {{lead.first_name}}.").await;
    let campaign_id = seed_campaign(
        &h.store,
        agent_id,
        CampaignSpec {
            conversation_mode: ConversationMode::TemplateOnly,
            channel_preferences: ChannelPreferences { primary: Some(Channel::Email), fallback: None },
            touch_sequence: vec![
                TouchStep { template_id: first_template, delay_amount: 0, delay_unit: DelayUnit::Minutes, conditions: vec![] },
                TouchStep { template_id: second_template, delay_amount: 0, delay_unit: DelayUnit::Minutes, conditions: vec![] },
            ],
            handover_criteria: default_handover_criteria(&["pricing"]),
        },
    )
    .await;

    let (lead, _created) = h
        .engine
        .ingest(IngestInput {
            name: "Alex Chen".to_string(),
            email: Some("alex.chen@example.com".to_string()),
            phone: None,
            source: "web".to_string(),
            source_external_id: None,
            campaign_id: Some(campaign_id),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || {
        let store = h.store.clone();
        async move {
            let lead = store.get_lead(lead.id).await.unwrap();
            (lead.status != LeadStatus::New).then_some(())
        }
    })
    .await;

    let conversation = h.store.find_active_conversation(lead.id, Channel::Email).await.unwrap().expect("conversation should exist");

    let step_before_reply = h
        .store
        .get_scheduled_step(lead.id, campaign_id)
        .await
        .unwrap()
        .expect("enroll should have scheduled step 1 after the initial dispatch");
    assert!(!step_before_reply.canceled);
    assert!(step_before_reply.next_fire_at.is_some());

    // A reply with no handover keyword or opt-out phrase.
    h.engine
        .enqueue_handle_reply(lead.id, conversation.id, "Thanks for reaching out!".to_string(), Some("carrier-msg-3".to_string()), chrono::Utc::now())
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || {
        let carrier = h.email_carrier.clone();
        async move { (carrier.sent().await.len() >= 2).then_some(()) }
    })
    .await;

    let sent = h.email_carrier.sent().await;
    assert_eq!(sent.len(), 2, "the reply should be answered once, with no extra AI-composed message");
    assert!(
        sent[1].body.contains("circling back"),
        "template_only reply must render the next touch_sequence template, not an AI composition: {}",
        sent[1].body
    );

    let lead_after_reply = h.store.get_lead(lead.id).await.unwrap();
    assert_ne!(lead_after_reply.status, LeadStatus::HandedOver, "a plain reply must not trigger handover");

    let step_after_reply = h
        .store
        .get_scheduled_step(lead.id, campaign_id)
        .await
        .unwrap()
        .expect("scheduled step must still exist");
    assert!(!step_after_reply.canceled, "template_only replies must never cancel the remaining touch sequence");
}

/// A lead with only an email identifier is never routed to SMS, even when
/// the campaign's primary preference asks for it.
#[tokio::test]
async fn email_only_lead_is_never_routed_to_sms() {
    let h = harness().await;

    let agent_id = seed_agent(&h.store, AgentKind::Email).await;
    let template_id = seed_template(&h.store, "Hi", "Hi {{lead.first_name}}.").await;
    let campaign_id = seed_campaign(
        &h.store,
        agent_id,
        CampaignSpec {
            conversation_mode: ConversationMode::Auto,
            channel_preferences: ChannelPreferences { primary: Some(Channel::Sms), fallback: Some(Channel::Email) },
            touch_sequence: vec![TouchStep { template_id, delay_amount: 0, delay_unit: DelayUnit::Minutes, conditions: vec![] }],
            handover_criteria: default_handover_criteria(&["pricing"]),
        },
    )
    .await;

    let (lead, _created) = h
        .engine
        .ingest(IngestInput {
            name: "Priya Patel".to_string(),
            email: Some("priya@example.com".to_string()),
            phone: None,
            source: "web".to_string(),
            source_external_id: None,
            campaign_id: Some(campaign_id),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || {
        let store = h.store.clone();
        async move {
            let lead = store.get_lead(lead.id).await.unwrap();
            (lead.status != LeadStatus::New).then_some(())
        }
    })
    .await;

    assert!(h.store.find_active_conversation(lead.id, Channel::Email).await.unwrap().is_some());
    assert!(h.store.find_active_conversation(lead.id, Channel::Sms).await.unwrap().is_none());
    assert_eq!(h.sms_carrier.sent().await.len(), 0);
}
