//! Inbound Email Scanner (the / component table): polls a
//! configured IMAP mailbox, applies pattern-match rules, creates leads when
//! none exists yet, and hands the mail off to the Engagement Engine as the
//! first inbound message of a new email conversation.
//!
//! `imap` is a blocking crate, so a poll runs inside
//! `tokio::task::spawn_blocking`; everything downstream of the fetch
//! (lead creation, conversation lookup, job enqueue) goes back through the
//! normal async `Engine` API.

#![cfg(feature = "email-carrier")]

use std::io::Read;

use chrono::Utc;
use overlord_store::id::CampaignId;
use overlord_store::models::Channel;

use crate::config::ImapConfig;
use crate::engine::{Engine, IngestInput};
use crate::error::{OverlordError, OverlordResult};
use crate::event::{EventHandler, OverlordEvent};

/// A single inbound message as parsed off the wire, independent of the
/// `imap`/`mail-parser` types that produced it.
#[derive(Debug, Clone)]
pub struct RawEmail {
    pub from: String,
    pub subject: String,
    pub body: String,
    pub message_id: Option<String>,
}

/// One mailbox rule: a pattern match against subject/from/body, and the
/// actions the enumerates (`createLead, assignCampaign,
/// setPriority, addTags`). All configured patterns must match (a rule with
/// no patterns matches everything).
#[derive(Debug, Clone)]
pub struct MailboxRule {
    pub name: String,
    pub subject_pattern: Option<regex::Regex>,
    pub from_pattern: Option<regex::Regex>,
    pub body_pattern: Option<regex::Regex>,
    pub assign_campaign: Option<CampaignId>,
    pub set_priority: Option<String>,
    pub add_tags: Vec<String>,
}

impl MailboxRule {
    fn matches(&self, email: &RawEmail) -> bool {
        self.subject_pattern.as_ref().map(|re| re.is_match(&email.subject)).unwrap_or(true)
            && self.from_pattern.as_ref().map(|re| re.is_match(&email.from)).unwrap_or(true)
            && self.body_pattern.as_ref().map(|re| re.is_match(&email.body)).unwrap_or(true)
    }

    fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "matched_rule": self.name,
            "priority": self.set_priority,
            "tags": self.add_tags,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImapScanError {
    #[error("imap connection failed: {0}")]
    Connect(String),
    #[error("imap command failed: {0}")]
    Command(String),
}

/// Run one poll cycle: fetch unseen messages, apply rules, hand matched
/// mail to the engine. Returns the number of messages turned into leads or
/// replies.
pub async fn poll_once(
    config: &ImapConfig,
    rules: &[MailboxRule],
    engine: &Engine,
    events: &dyn EventHandler,
) -> OverlordResult<usize> {
    let config = config.clone();
    let emails = tokio::task::spawn_blocking(move || fetch_unseen(&config))
        .await
        .map_err(|err| OverlordError::Validation(err.to_string()))?
        .map_err(|err| OverlordError::CarrierTransient { channel: "imap".to_string(), message: err.to_string() })?;

    let mut processed = 0;
    for email in emails {
        if let Err(err) = process_one(rules, engine, events, email).await {
            tracing::warn!(error = %err, "failed to process scanned inbound email");
            continue;
        }
        processed += 1;
    }
    Ok(processed)
}

async fn process_one(rules: &[MailboxRule], engine: &Engine, events: &dyn EventHandler, email: RawEmail) -> OverlordResult<()> {
    let existing = engine.store().find_leads_by_email(&email.from).await?;
    let lead_id = if let Some(lead) = existing.into_iter().next() {
        lead.id
    } else {
        let Some(rule) = rules.iter().find(|rule| rule.matches(&email)) else {
            tracing::debug!(from = %email.from, "inbound mail matched no mailbox rule, ignoring");
            return Ok(());
        };
        let (lead, created) = engine
            .ingest(IngestInput {
                name: derive_name(&email.from),
                email: Some(email.from.clone()),
                phone: None,
                source: "inbound_email".to_string(),
                source_external_id: email.message_id.clone(),
                campaign_id: rule.assign_campaign,
                metadata: rule.metadata(),
            })
            .await?;
        if created {
            events
                .on_event(&OverlordEvent::LeadIngested { lead_id: lead.id, source: "inbound_email".to_string(), duplicate: false })
                .await;
        }
        lead.id
    };

    let conversation = engine.store().get_or_create_active_conversation(lead_id, Channel::Email).await?;
    engine
        .enqueue_handle_reply(lead_id, conversation.id, email.body.clone(), email.message_id.clone(), Utc::now())
        .await
}

fn derive_name(address: &str) -> String {
    address.split('@').next().unwrap_or(address).replace(['.', '_'], " ")
}

/// Blocking IMAP fetch: connect, select INBOX, search UNSEEN, fetch and
/// parse each, mark seen. Runs inside `spawn_blocking`.
fn fetch_unseen(config: &ImapConfig) -> Result<Vec<RawEmail>, ImapScanError> {
    let tls = native_tls::TlsConnector::builder()
        .build()
        .map_err(|err| ImapScanError::Connect(err.to_string()))?;
    let client = imap::connect((config.host.as_str(), config.port), config.host.as_str(), &tls)
        .map_err(|err| ImapScanError::Connect(err.to_string()))?;
    let mut session = client
        .login(&config.user, &config.password)
        .map_err(|(err, _client)| ImapScanError::Connect(err.to_string()))?;
    session.select("INBOX").map_err(|err| ImapScanError::Command(err.to_string()))?;

    let ids = session.search("UNSEEN").map_err(|err| ImapScanError::Command(err.to_string()))?;
    let mut emails = Vec::with_capacity(ids.len());
    for id in ids {
        let fetched = session
            .fetch(id.to_string(), "RFC822")
            .map_err(|err| ImapScanError::Command(err.to_string()))?;
        for message in fetched.iter() {
            let Some(body) = message.body() else { continue };
            if let Some(email) = parse_email(body) {
                emails.push(email);
            }
        }
    }
    let _ = session.logout();
    Ok(emails)
}

fn parse_email(raw: &[u8]) -> Option<RawEmail> {
    let mut buf = Vec::new();
    let mut cursor = raw;
    cursor.read_to_end(&mut buf).ok()?;
    let parsed = mail_parser::MessageParser::default().parse(&buf)?;

    let from = parsed.from()?.first()?.address()?.to_string();
    let subject = parsed.subject().unwrap_or_default().to_string();
    let body = parsed.body_text(0).map(|cow| cow.into_owned()).unwrap_or_default();
    let message_id = parsed.message_id().map(|id| id.to_string());

    Some(RawEmail { from, subject, body, message_id })
}
