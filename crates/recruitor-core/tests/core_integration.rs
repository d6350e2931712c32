#![allow(clippy::unwrap_used, clippy::expect_used)]

use recruitor_core::*;
use serde_json::json;

// ---------------------------------------------------------------------------
// 1. Message envelope serialization keeps the correlation link
// ---------------------------------------------------------------------------

#[test]
fn request_response_envelopes_roundtrip() {
    let request = RequestMessage::new("workflow-engine", "scraper-1", "scrape", json!({"url": "https://jobs.example/123"}))
        .with_timeout(5_000);
    let response = ResponseMessage::success(&request, json!({"title": "Rust Engineer"}));

    let wire = serde_json::to_string(&Message::Response(response.clone())).unwrap();
    let parsed: Message = serde_json::from_str(&wire).unwrap();

    match parsed {
        Message::Response(r) => {
            assert_eq!(r.correlation_id, request.id);
            assert_eq!(r.from, "scraper-1");
            assert_eq!(r.to, "workflow-engine");
            assert!(r.success);
            assert_eq!(r.data, Some(json!({"title": "Rust Engineer"})));
            assert!(r.error.is_none());
        }
        other => panic!("expected response, got {}", other.kind()),
    }
}

#[test]
fn broadcast_event_has_no_recipient() {
    let event = EventMessage::new("registry", "config-reloaded", json!({"version": 3}));
    let msg = Message::Event(event);
    assert_eq!(msg.recipient(), None);
    assert_eq!(msg.sender(), "registry");
}

// ---------------------------------------------------------------------------
// 2. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let err = RecruitorError::InvalidInput("search: missing required field 'query'".to_string());
    assert_eq!(
        err.to_string(),
        "Invalid input: search: missing required field 'query'"
    );

    let err = RecruitorError::NoEligibleWorker("scrape".to_string());
    assert_eq!(err.to_string(), "No eligible worker: scrape");

    let err = RecruitorError::StepNotFound("step-9".to_string());
    assert_eq!(err.to_string(), "Step not found: step-9");

    let err = RecruitorError::DeliveryFailed("no subscriber 'ghost'".to_string());
    assert_eq!(err.to_string(), "Delivery failed: no subscriber 'ghost'");

    let bad_json = serde_json::from_str::<serde_json::Value>("not json");
    let err: RecruitorError = bad_json.unwrap_err().into();
    assert!(err.to_string().starts_with("Serialization error:"));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
    let err: RecruitorError = io_err.into();
    assert!(err.to_string().starts_with("IO error:"));
}

// ---------------------------------------------------------------------------
// 3. Actions validate both sides of the handler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn action_set_dispatch_and_validation() {
    let actions: ActionSet = vec![
        Action::from_fn(
            "analyze",
            Contract::object().required("profile", ValueKind::Object),
            Contract::object().required("score", ValueKind::Number),
            |payload| async move {
                let skills = payload["profile"]["skills"]
                    .as_array()
                    .map(Vec::len)
                    .unwrap_or(0);
                Ok(json!({"score": skills * 10}))
            },
        )
        .with_description("Score a candidate profile"),
    ]
    .into_iter()
    .collect();

    let analyze = actions.require("analyze").unwrap();
    assert_eq!(analyze.descriptor().description, "Score a candidate profile");

    let out = analyze
        .invoke(json!({"profile": {"skills": ["rust", "tokio"]}}))
        .await
        .unwrap();
    assert_eq!(out, json!({"score": 20}));

    let err = analyze.invoke(json!({"profile": "nope"})).await.unwrap_err();
    assert!(matches!(err, RecruitorError::InvalidInput(_)));

    assert!(matches!(
        actions.require("book_meeting"),
        Err(RecruitorError::UnknownAction(_))
    ));
}

#[tokio::test]
async fn handler_errors_pass_through_unchanged() {
    let action = Action::from_fn("sync_crm", Contract::any(), Contract::any(), |_| async move {
        Err::<serde_json::Value, _>(RecruitorError::ActionFailed("CRM unavailable".into()))
    });
    let err = action.invoke(json!({})).await.unwrap_err();
    assert_eq!(err.to_string(), "Action failed: CRM unavailable");
}

// ---------------------------------------------------------------------------
// 4. Contract descriptors serialize for dashboards
// ---------------------------------------------------------------------------

#[test]
fn contract_serialization() {
    let contract = Contract::object()
        .required("email", ValueKind::String)
        .optional("cc", ValueKind::Array);
    let json = serde_json::to_value(&contract).unwrap();
    assert_eq!(json["kind"], "object");
    assert_eq!(json["fields"][0]["name"], "email");
    assert_eq!(json["fields"][1]["required"], false);

    let parsed: Contract = serde_json::from_value(json).unwrap();
    assert!(parsed.validate(&json!({"email": "a@b.c"})).is_ok());
    assert!(parsed.validate(&json!({"cc": []})).is_err());
}

// ---------------------------------------------------------------------------
// 5. Agent status wire names
// ---------------------------------------------------------------------------

#[test]
fn agent_status_serialization() {
    for (status, wire) in [
        (AgentStatus::Idle, "\"idle\""),
        (AgentStatus::Busy, "\"busy\""),
        (AgentStatus::Error, "\"error\""),
        (AgentStatus::Offline, "\"offline\""),
    ] {
        assert_eq!(serde_json::to_string(&status).unwrap(), wire);
    }

    let bad: Result<AgentStatus, _> = serde_json::from_str("\"sleeping\"");
    assert!(bad.is_err());
}
