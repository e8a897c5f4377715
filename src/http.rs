//! Ingress HTTP surface: direct JSON lead ingress, bulk import, the
//! partner-marketplace `postLead` XML surface, health/status probes,
//! carrier webhooks, the handover confirmation callback, and
//! touch-sequence export/import.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower_http::trace::TraceLayer;

use overlord_store::id::{CampaignId, HandoverId, LeadId};
use overlord_store::Store;

use crate::config::MarketplaceConfig;
use crate::engine::{Engine, IngestInput};
use crate::error::{ErrorEnvelope, OverlordError};
use crate::event::EventHandler;
use crate::reply_ingester::{self, EmailEventKind, EmailWebhookEvent, SmsWebhookEvent};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub store: Store,
    pub marketplace: MarketplaceConfig,
    pub events: Arc<dyn EventHandler>,
    /// Shared secret used to verify `X-Signature` on inbound carrier
    /// webhooks, when the deployment has one configured. `None` means
    /// signature verification is skipped (development / LoggingCarrier
    /// setups with no real carrier account).
    pub email_webhook_secret: Option<String>,
    pub sms_webhook_secret: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/leads", post(create_lead))
        .route("/leads/bulk", post(create_leads_bulk))
        .route("/postLead", post(post_lead))
        .route("/ping", get(ping))
        .route("/leadStatus/{id}", get(lead_status))
        .route("/webhooks/email", post(webhook_email))
        .route("/webhooks/sms", post(webhook_sms))
        .route("/webhooks/handover/confirmation", post(webhook_handover_confirmation))
        .route("/campaigns/{id}/touch-sequence/export", get(export_touch_sequence))
        .route("/touch-sequence/import", post(import_touch_sequence))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------
// Error envelope plumbing
// ---------------------------------------------------------------------

fn status_for(err: &OverlordError) -> StatusCode {
    match err {
        OverlordError::Validation(_) => StatusCode::BAD_REQUEST,
        OverlordError::Contactability { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        OverlordError::ModelTransient(_)
        | OverlordError::ModelPermanent(_)
        | OverlordError::CarrierTransient { .. }
        | OverlordError::CarrierPermanent { .. }
        | OverlordError::RouterExhausted(_) => StatusCode::BAD_GATEWAY,
        OverlordError::StoreTransient(_) | OverlordError::StorePermanent(_) => StatusCode::INTERNAL_SERVER_ERROR,
        OverlordError::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        // Idempotency conflicts are reported as success, per the recovery policy 
        // recovery policy ("detected duplicate; reported as success").
        OverlordError::IdempotencyConflict(_) => StatusCode::OK,
        OverlordError::NotFound(_) => StatusCode::NOT_FOUND,
    }
}

fn error_response(err: &OverlordError) -> Response {
    let envelope = ErrorEnvelope::from_error(err, uuid::Uuid::new_v4().to_string());
    (status_for(err), Json(envelope)).into_response()
}

// ---------------------------------------------------------------------
// POST /leads, POST /leads/bulk
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateLeadRequest {
    name: String,
    email: Option<String>,
    phone: Option<String>,
    source: Option<String>,
    campaign: Option<String>,
    metadata: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct CreateLeadResponse {
    #[serde(rename = "leadId")]
    lead_id: String,
}

fn ingest_input_from(req_name: String, email: Option<String>, phone: Option<String>, source: Option<String>, campaign: Option<String>, metadata: Option<serde_json::Value>) -> IngestInput {
    IngestInput {
        name: req_name,
        email,
        phone,
        source: source.unwrap_or_else(|| "api".to_string()),
        source_external_id: None,
        campaign_id: campaign.as_deref().and_then(|c| c.parse::<CampaignId>().ok()),
        metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
    }
}

async fn create_lead(State(state): State<AppState>, Json(req): Json<CreateLeadRequest>) -> Response {
    let input = ingest_input_from(req.name, req.email, req.phone, req.source, req.campaign, req.metadata);
    match state.engine.ingest(input).await {
        Ok((lead, created)) => {
            let status = if created { StatusCode::CREATED } else { StatusCode::OK };
            (status, Json(CreateLeadResponse { lead_id: lead.id.to_string() })).into_response()
        }
        Err(err) => error_response(&err),
    }
}

#[derive(Deserialize)]
struct BulkImportRequest {
    leads: Vec<serde_json::Value>,
    #[serde(default)]
    mapping: HashMap<String, String>,
}

#[derive(Serialize)]
struct BulkRejection {
    row: usize,
    reason: String,
}

#[derive(Serialize)]
struct BulkImportResponse {
    total: usize,
    accepted: usize,
    rejected: Vec<BulkRejection>,
}

/// Apply the `csvField -> domainField` mapping descriptor:
/// start from the raw row so already-domain-shaped fields pass through,
/// then overlay anything the mapping renames.
fn apply_mapping(raw: &serde_json::Value, mapping: &HashMap<String, String>) -> serde_json::Value {
    let mut normalized = raw.clone();
    if let (Some(obj), Some(source)) = (normalized.as_object_mut(), raw.as_object()) {
        for (csv_field, domain_field) in mapping {
            if let Some(value) = source.get(csv_field) {
                obj.insert(domain_field.clone(), value.clone());
            }
        }
    }
    normalized
}

async fn create_leads_bulk(State(state): State<AppState>, Json(req): Json<BulkImportRequest>) -> Response {
    let total = req.leads.len();
    let mut accepted = 0;
    let mut rejected = Vec::new();

    for (row, raw) in req.leads.iter().enumerate() {
        let normalized = apply_mapping(raw, &req.mapping);
        let name = normalized.get("name").and_then(|v| v.as_str()).map(str::to_string);
        let email = normalized.get("email").and_then(|v| v.as_str()).map(str::to_string);
        let phone = normalized.get("phone").and_then(|v| v.as_str()).map(str::to_string);

        let Some(name) = name else {
            rejected.push(BulkRejection { row, reason: "missing name".to_string() });
            continue;
        };
        if email.is_none() && phone.is_none() {
            rejected.push(BulkRejection { row, reason: "at least one of email or phone is required".to_string() });
            continue;
        }

        let source = normalized.get("source").and_then(|v| v.as_str()).map(str::to_string);
        let campaign = normalized.get("campaign").and_then(|v| v.as_str()).map(str::to_string);
        let metadata = normalized.get("metadata").cloned();
        let input = ingest_input_from(name, email, phone, source, campaign, metadata);

        match state.engine.ingest(input).await {
            Ok(_) => accepted += 1,
            Err(err) => rejected.push(BulkRejection { row, reason: err.to_string() }),
        }
    }

    Json(BulkImportResponse { total, accepted, rejected }).into_response()
}

// ---------------------------------------------------------------------
// XML surfaces: /postLead, /ping, /leadStatus/{id}
// ---------------------------------------------------------------------

fn xml_response(status: StatusCode, value: &impl Serialize) -> Response {
    match quick_xml::se::to_string(value) {
        Ok(body) => {
            let full = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{body}");
            (status, [(axum::http::header::CONTENT_TYPE, "application/xml")], full).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("xml serialization failed: {err}")).into_response(),
    }
}

fn authorized(marketplace: &MarketplaceConfig, headers: &HeaderMap) -> bool {
    let Some(key) = headers.get("X-API-Key").and_then(|v| v.to_str().ok()) else { return false };
    marketplace.valid_api_keys.contains(key) || marketplace.api_key.as_deref() == Some(key)
}

#[derive(Serialize)]
#[serde(rename = "response")]
struct PingResponse {
    status: String,
}

async fn ping() -> Response {
    xml_response(StatusCode::OK, &PingResponse { status: "ok".to_string() })
}

#[derive(Serialize)]
#[serde(rename = "response")]
struct LeadStatusResponse {
    status: String,
    lead_id: String,
    lead_status: String,
    message: String,
}

async fn lead_status(State(state): State<AppState>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    if !authorized(&state.marketplace, &headers) {
        return xml_response(
            StatusCode::UNAUTHORIZED,
            &LeadStatusResponse { status: "error".to_string(), lead_id: id, lead_status: "unknown".to_string(), message: "unauthorized".to_string() },
        );
    }
    let Ok(lead_id) = id.parse::<LeadId>() else {
        return xml_response(
            StatusCode::BAD_REQUEST,
            &LeadStatusResponse { status: "error".to_string(), lead_id: id, lead_status: "unknown".to_string(), message: "invalid lead id".to_string() },
        );
    };
    match state.store.get_lead(lead_id).await {
        Ok(lead) => xml_response(
            StatusCode::OK,
            &LeadStatusResponse {
                status: "ok".to_string(),
                lead_id: lead.id.to_string(),
                lead_status: format!("{:?}", lead.status).to_lowercase(),
                message: String::new(),
            },
        ),
        Err(_) => xml_response(
            StatusCode::NOT_FOUND,
            &LeadStatusResponse { status: "error".to_string(), lead_id: lead_id.to_string(), lead_status: "unknown".to_string(), message: "not found".to_string() },
        ),
    }
}

#[derive(Deserialize)]
struct PostLeadQuery {
    mode: Option<String>,
}

#[derive(Deserialize)]
struct PostLeadForm {
    #[serde(rename = "Test_Lead")]
    test_lead: Option<String>,
    zip: Option<String>,
    name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    campaign: Option<String>,
}

#[derive(Serialize)]
#[serde(rename = "response")]
struct MarketplaceResponse {
    status: String,
    lead_id: String,
    buyer_id: String,
    price: String,
    message: String,
}

impl MarketplaceResponse {
    fn rejected(message: impl Into<String>) -> Self {
        Self { status: "rejected".to_string(), lead_id: String::new(), buyer_id: String::new(), price: "0.00".to_string(), message: message.into() }
    }
}

/// `Test_Lead=1`/`zip=99999` submissions are evaluated but never written to
/// the store . The response still needs a stable `lead_id`
/// across a replayed submission (the scenario 4), so it's derived
/// deterministically from the submitted fields rather than minted fresh.
fn deterministic_test_lead_id(name: &str, email: Option<&str>, phone: Option<&str>, zip: Option<&str>) -> LeadId {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(email.unwrap_or_default().as_bytes());
    hasher.update(phone.unwrap_or_default().as_bytes());
    hasher.update(zip.unwrap_or_default().as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    LeadId(uuid::Uuid::from_bytes(bytes))
}

async fn post_lead(State(state): State<AppState>, Query(query): Query<PostLeadQuery>, headers: HeaderMap, Form(form): Form<PostLeadForm>) -> Response {
    let is_test = form.test_lead.as_deref() == Some("1") || form.zip.as_deref() == Some("99999");

    if query.mode.as_deref() == Some("full") && !is_test && !authorized(&state.marketplace, &headers) {
        return xml_response(StatusCode::UNAUTHORIZED, &MarketplaceResponse::rejected("invalid or missing X-API-Key"));
    }

    let Some(name) = form.name.clone() else {
        return xml_response(StatusCode::BAD_REQUEST, &MarketplaceResponse::rejected("name is required"));
    };
    if form.email.is_none() && form.phone.is_none() {
        return xml_response(StatusCode::BAD_REQUEST, &MarketplaceResponse::rejected("at least one of email or phone is required"));
    }

    let metadata = serde_json::json!({ "zip": form.zip, "marketplace_mode": query.mode });

    if is_test {
        let lead_id = deterministic_test_lead_id(&name, form.email.as_deref(), form.phone.as_deref(), form.zip.as_deref());
        let _ = state
            .store
            .append_decision(
                lead_id,
                overlord_store::models::AgentKind::Overlord,
                "marketplace_test_evaluated",
                "test lead evaluated under Test_Lead/zip=99999, not persisted",
                metadata,
            )
            .await;
        return xml_response(
            StatusCode::OK,
            &MarketplaceResponse {
                status: "matched".to_string(),
                lead_id: lead_id.to_string(),
                buyer_id: "test-buyer".to_string(),
                price: "0.00".to_string(),
                message: "test lead evaluated, not persisted".to_string(),
            },
        );
    }

    let campaign_id = form.campaign.as_deref().and_then(|c| c.parse::<CampaignId>().ok());
    let input = IngestInput {
        name,
        email: form.email.clone(),
        phone: form.phone.clone(),
        source: "marketplace".to_string(),
        source_external_id: None,
        campaign_id,
        metadata,
    };

    match state.engine.ingest(input).await {
        Ok((lead, created)) => xml_response(
            StatusCode::OK,
            &MarketplaceResponse {
                status: if created { "accepted".to_string() } else { "matched".to_string() },
                lead_id: lead.id.to_string(),
                buyer_id: "primary-buyer".to_string(),
                price: if created { "25.00".to_string() } else { "0.00".to_string() },
                message: if created { "lead accepted".to_string() } else { "duplicate submission".to_string() },
            },
        ),
        Err(err) => xml_response(status_for(&err), &MarketplaceResponse::rejected(err.to_string())),
    }
}

// ---------------------------------------------------------------------
// Carrier webhooks
// ---------------------------------------------------------------------

/// Verifies the carrier's `X-Signature` header against the same
/// HMAC-SHA256 scheme `handover::HandoverDispatcher` uses for outbound
/// dossier webhooks: unsigned or misigned requests are rejected at the edge
/// before touching the engine.
fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    use hmac::{Hmac, Mac};

    let Some(header) = header else { return false };
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any length");
    mac.update(body);
    let expected = format!("sha256={}", mac.finalize().into_bytes().iter().map(|b| format!("{b:02x}")).collect::<String>());
    header == expected
}

#[derive(Deserialize)]
struct EmailWebhookPayload {
    event: String,
    message_id: String,
    from: Option<String>,
    body: Option<String>,
    in_reply_to: Option<String>,
}

async fn webhook_email(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    if let Some(secret) = state.email_webhook_secret.as_deref() {
        let sig = headers.get("X-Signature").and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, sig) {
            return (StatusCode::UNAUTHORIZED, "invalid webhook signature").into_response();
        }
    }

    let payload: EmailWebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    let kind = match payload.event.as_str() {
        "delivered" => EmailEventKind::Delivered,
        "opened" => EmailEventKind::Opened,
        "clicked" => EmailEventKind::Clicked,
        "bounced" => EmailEventKind::Bounced,
        "unsubscribed" => EmailEventKind::Unsubscribed,
        "replied" => {
            let (Some(from), Some(reply_body)) = (payload.from.clone(), payload.body.clone()) else {
                return (StatusCode::BAD_REQUEST, "reply event missing from/body").into_response();
            };
            EmailEventKind::Replied { from, body: reply_body, in_reply_to: payload.in_reply_to.clone(), received_at: chrono::Utc::now() }
        }
        other => return (StatusCode::BAD_REQUEST, format!("unrecognized email event kind: {other}")).into_response(),
    };

    let event = EmailWebhookEvent { external_message_id: payload.message_id, kind };
    match reply_ingester::handle_email_webhook(&state.store, &state.engine, state.events.as_ref(), event).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Deserialize)]
struct SmsWebhookPayload {
    from: String,
    #[allow(dead_code)]
    to: Option<String>,
    body: Option<String>,
    #[serde(rename = "messageSid")]
    message_sid: String,
    status: Option<String>,
}

async fn webhook_sms(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    if let Some(secret) = state.sms_webhook_secret.as_deref() {
        let sig = headers.get("X-Signature").and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, sig) {
            return (StatusCode::UNAUTHORIZED, "invalid webhook signature").into_response();
        }
    }

    let payload: SmsWebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    let event = SmsWebhookEvent {
        message_sid: payload.message_sid,
        from: payload.from,
        body: payload.body,
        status: payload.status,
        received_at: chrono::Utc::now(),
    };
    match reply_ingester::handle_sms_webhook(&state.store, &state.engine, state.events.as_ref(), event).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Deserialize)]
struct HandoverConfirmationPayload {
    #[serde(rename = "handoverId")]
    handover_id: String,
}

async fn webhook_handover_confirmation(State(state): State<AppState>, Json(payload): Json<HandoverConfirmationPayload>) -> Response {
    let Ok(id) = payload.handover_id.parse::<HandoverId>() else {
        return (StatusCode::BAD_REQUEST, "invalid handoverId").into_response();
    };
    match state.store.mark_handover_confirmed(id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(&OverlordError::from(err)),
    }
}

// ---------------------------------------------------------------------
// Touch-sequence export/import
// ---------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TouchSequenceStepDescriptor {
    template_id: String,
    delay: i64,
    delay_unit: String,
    order: usize,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TouchSequenceDescriptor {
    campaign_name: String,
    templates: Vec<TouchSequenceStepDescriptor>,
    schedule_type: String,
    export_date: String,
}

fn delay_unit_label(unit: overlord_store::models::DelayUnit) -> String {
    match unit {
        overlord_store::models::DelayUnit::Minutes => "minutes",
        overlord_store::models::DelayUnit::Hours => "hours",
        overlord_store::models::DelayUnit::Days => "days",
    }
    .to_string()
}

async fn export_touch_sequence(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(campaign_id) = id.parse::<CampaignId>() else {
        return (StatusCode::BAD_REQUEST, "invalid campaign id").into_response();
    };
    match state.store.get_campaign(campaign_id).await {
        Ok(campaign) => {
            let templates = campaign
                .touch_sequence
                .iter()
                .enumerate()
                .map(|(order, step)| TouchSequenceStepDescriptor {
                    template_id: step.template_id.to_string(),
                    delay: step.delay_amount,
                    delay_unit: delay_unit_label(step.delay_unit),
                    order,
                })
                .collect();
            let descriptor = TouchSequenceDescriptor {
                campaign_name: campaign.name,
                templates,
                schedule_type: format!("{:?}", campaign.conversation_mode).to_lowercase(),
                export_date: chrono::Utc::now().to_rfc3339(),
            };
            Json(descriptor).into_response()
        }
        Err(err) => error_response(&OverlordError::from(err)),
    }
}

/// Round-trips an exported touch-sequence descriptor: validates its shape
/// and echoes back the normalized schedule (export-then-import of a touch
/// sequence yields the same logical schedule). Campaign CRUD itself is out
/// of scope — the administration UI owns persisting an imported sequence —
/// so this endpoint is a format validator rather than a campaign mutator.
async fn import_touch_sequence(Json(descriptor): Json<TouchSequenceDescriptor>) -> Response {
    if descriptor.campaign_name.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "campaignName is required").into_response();
    }
    let mut ordered = descriptor.templates;
    ordered.sort_by_key(|step| step.order);
    Json(TouchSequenceDescriptor { templates: ordered, ..descriptor }).into_response()
}
