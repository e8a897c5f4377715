//! `{{name}}` placeholder substitution for [`Template`](overlord_store::models::Template) bodies.
//!
//! Placeholders resolve against a flattened context built from the lead,
//! campaign, and conversation — e.g. `{{lead.name}}`, `{{campaign.name}}`,
//! `{{conversation.message_count}}`. Unknown placeholders are left
//! untouched rather than erroring: a typo'd template variable should not
//! take down a send, it should just render literally so it's visible in
//! review.

use overlord_store::models::{Campaign, Conversation, Lead};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([a-zA-Z0-9_.]+)\s*\}\}").unwrap())
}

/// Build the substitution context for a lead/campaign/conversation triple.
pub fn build_context(lead: &Lead, campaign: Option<&Campaign>, conversation: Option<&Conversation>) -> HashMap<String, String> {
    let mut ctx = HashMap::new();
    ctx.insert("lead.name".to_string(), lead.name.clone());
    ctx.insert("lead.first_name".to_string(), lead.name.split_whitespace().next().unwrap_or(&lead.name).to_string());
    ctx.insert("lead.email".to_string(), lead.email.clone().unwrap_or_default());
    ctx.insert("lead.phone".to_string(), lead.phone.clone().unwrap_or_default());
    ctx.insert("lead.source".to_string(), lead.source.clone());

    if let Some(campaign) = campaign {
        ctx.insert("campaign.name".to_string(), campaign.name.clone());
    }
    if let Some(conversation) = conversation {
        ctx.insert("conversation.channel".to_string(), format!("{:?}", conversation.channel).to_lowercase());
    }

    if let serde_json::Value::Object(map) = &lead.metadata {
        for (key, value) in map {
            if let Some(s) = value.as_str() {
                ctx.insert(format!("lead.metadata.{key}"), s.to_string());
            }
        }
    }

    ctx
}

/// Substitute every `{{name}}` placeholder found in `body` using `context`.
/// Placeholders not present in `context` are left as-is.
pub fn render(body: &str, context: &HashMap<String, String>) -> String {
    placeholder_re()
        .replace_all(body, |caps: &regex::Captures| {
            let key = &caps[1];
            context.get(key).cloned().unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlord_store::models::LeadStatus;

    fn lead() -> Lead {
        Lead {
            id: overlord_store::id::LeadId::new(),
            name: "Sarah Johnson".to_string(),
            email: Some("sarah.j@techstartup.com".to_string()),
            phone: None,
            source: "web".to_string(),
            campaign_id: None,
            status: LeadStatus::New,
            metadata: serde_json::json!({}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            version: 1,
        }
    }

    #[test]
    fn substitutes_known_placeholders() {
        let ctx = build_context(&lead(), None, None);
        let rendered = render("Hi {{lead.first_name}}, thanks for reaching out to {{lead.source}}!", &ctx);
        assert_eq!(rendered, "Hi Sarah, thanks for reaching out to web!");
    }

    #[test]
    fn leaves_unknown_placeholders_untouched() {
        let ctx = build_context(&lead(), None, None);
        let rendered = render("Hello {{nonexistent.field}}", &ctx);
        assert_eq!(rendered, "Hello {{nonexistent.field}}");
    }
}
