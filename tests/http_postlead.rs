//! Exercises the partner-marketplace `/postLead` XML surface end to end
//! against a real (in-memory) store, including the duplicate-submission
//! scenario: the same partner form posted twice must return the same
//! `lead_id` and must not create a second lead row, while still logging a
//! decision for each submission.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use http_body_util::BodyExt;
use tower::ServiceExt;

use overlord::carriers::{Carrier, LoggingCarrier};
use overlord::engine::Engine;
use overlord::event::TracingEventHandler;
use overlord::http::{self, AppState};
use overlord::resilience::{CircuitBreakerRegistry, JobQueue, JobTypeConcurrency};
use overlord_store::models::Channel;

use common::test_store;

fn app_state(store: overlord_store::Store) -> AppState {
    let breakers = CircuitBreakerRegistry::new();
    let events = Arc::new(TracingEventHandler);
    let mut carriers: HashMap<Channel, Arc<dyn Carrier>> = HashMap::new();
    carriers.insert(Channel::Email, Arc::new(LoggingCarrier::new(Channel::Email)));
    carriers.insert(Channel::Sms, Arc::new(LoggingCarrier::new(Channel::Sms)));
    carriers.insert(Channel::Chat, Arc::new(LoggingCarrier::new(Channel::Chat)));

    let engine = Engine::new(store.clone(), None, breakers, carriers, events.clone(), 3, 86_400);
    let queue = JobQueue::start(JobTypeConcurrency::uniform(4), 64, engine.clone(), store.clone());
    engine.set_queue(queue);

    AppState {
        engine,
        store,
        marketplace: overlord::config::MarketplaceConfig::default(),
        events,
        email_webhook_secret: None,
        sms_webhook_secret: None,
    }
}

fn form_request(body: &str) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri("/postLead")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

async fn xml_body(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn extract_tag<'a>(xml: &'a str, tag: &str) -> &'a str {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open).unwrap_or_else(|| panic!("missing <{tag}> in {xml}")) + open.len();
    let end = xml[start..].find(&close).unwrap() + start;
    &xml[start..end]
}

/// `Test_Lead=1 zip=12345` posted twice returns XML `matched` with the
/// *same* `lead_id` both times, no DB row written either time, and one
/// Decision logged per submission.
#[tokio::test]
async fn duplicate_test_lead_submission_matches_without_persisting() {
    let store = test_store().await;
    let state = app_state(store.clone());
    let router = http::router(state);

    let body = "Test_Lead=1&zip=12345&name=John+Doe&email=john%40test.com";

    let first = router.clone().oneshot(form_request(body)).await.unwrap();
    assert_eq!(first.status(), axum::http::StatusCode::OK);
    let first_xml = xml_body(first).await;
    assert_eq!(extract_tag(&first_xml, "status"), "matched");
    let first_lead_id = extract_tag(&first_xml, "lead_id").to_string();
    assert!(!first_lead_id.is_empty());

    let second = router.clone().oneshot(form_request(body)).await.unwrap();
    assert_eq!(second.status(), axum::http::StatusCode::OK);
    let second_xml = xml_body(second).await;
    assert_eq!(extract_tag(&second_xml, "status"), "matched");
    let second_lead_id = extract_tag(&second_xml, "lead_id");
    assert_eq!(second_lead_id, first_lead_id, "replaying the same test-lead form must resolve to the same deterministic lead_id");

    let lead_id: overlord_store::id::LeadId = first_lead_id.parse().unwrap();
    let row_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM leads WHERE id = ?").bind(lead_id.to_string()).fetch_one(store.pool()).await.unwrap();
    assert_eq!(row_count, 0, "a Test_Lead submission must never be written to the leads table, on either submission");

    let decisions = store.list_decisions(lead_id).await.unwrap();
    assert_eq!(decisions.len(), 2, "one decision should be logged per submission, even though neither persists a lead");
    assert!(decisions.iter().all(|d| d.action == "marketplace_test_evaluated"));
}

/// A non-test submission is genuinely persisted and routed through the
/// engine like any other ingress path (no deterministic-id shortcut).
#[tokio::test]
async fn real_marketplace_submission_is_persisted_and_routed() {
    let store = test_store().await;
    let state = app_state(store.clone());
    let router = http::router(state);

    let body = "name=Morgan+Lee&email=morgan.lee%40example.com&zip=12345";
    let response = router.clone().oneshot(form_request(body)).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let xml = xml_body(response).await;
    assert_eq!(extract_tag(&xml, "status"), "accepted");
    let lead_id: overlord_store::id::LeadId = extract_tag(&xml, "lead_id").parse().unwrap();

    let lead = store.get_lead(lead_id).await.unwrap();
    assert_eq!(lead.name, "Morgan Lee");
    assert_eq!(lead.source, "marketplace");
}

/// A malformed submission (no contact method at all) is rejected before it
/// ever reaches the engine, with no lead and no decision recorded.
#[tokio::test]
async fn submission_missing_contact_method_is_rejected() {
    let store = test_store().await;
    let state = app_state(store.clone());
    let router = http::router(state);

    let body = "name=No+Contact&zip=12345";
    let response = router.clone().oneshot(form_request(body)).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    let xml = xml_body(response).await;
    assert_eq!(extract_tag(&xml, "status"), "rejected");

    let row_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leads").fetch_one(store.pool()).await.unwrap();
    assert_eq!(row_count, 0);
}
