//! End-to-end session tests against a scripted inspector endpoint.

mod common;

use std::time::Duration;

use plist::Dictionary;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use common::{listen, MockDevice, RECV_TIMEOUT, SAFARI_ID};
use rdbg_core::{Error, SessionEvent};
use rdbg_rpc::protocol::keys;
use rdbg_rpc::RemoteDebugger;

async fn connect() -> (RemoteDebugger, MockDevice) {
    let (listener, settings) = listen().await;
    let (debugger, device) = tokio::join!(
        RemoteDebugger::connect_native(&settings),
        MockDevice::accept_with_safari(&listener),
    );
    (debugger.unwrap(), device)
}

/// Connect, select Safari, and attach to its only page.
async fn attach() -> (RemoteDebugger, MockDevice) {
    let (debugger, mut device) = connect().await;

    let (selected, _) = tokio::join!(debugger.select_app(None), async {
        device.expect_selector("_rpc_forwardGetListing:").await;
        device
            .send_listing(SAFARI_ID, &[(1, "Home", "http://example.com/")])
            .await;
    });
    assert_eq!(selected.unwrap().0, SAFARI_ID);

    let (attached, _) = tokio::join!(debugger.select_page("1"), async {
        device.expect_selector("_rpc_forwardSocketSetup:").await;
        let enable = device.recv_command().await;
        assert_eq!(enable["method"], "Page.enable");
        device.reply(&enable, json!({})).await;
    });
    attached.unwrap();

    (debugger, device)
}

async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a session event")
        .unwrap()
}

// ─────────────────────────────────────────────────────────
// Handshake and application discovery
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_reports_applications_and_target() {
    let (debugger, _device) = connect().await;

    let snapshot = debugger.snapshot().await.unwrap();
    assert!(snapshot.connected);
    assert_eq!(snapshot.apps.len(), 1);
    assert_eq!(snapshot.apps[0].name, "Safari");
    assert_eq!(snapshot.target_app.as_deref(), Some(SAFARI_ID));
    assert_eq!(
        snapshot
            .simulator
            .and_then(|s| s.product_version)
            .as_deref(),
        Some("9.3")
    );
}

#[tokio::test]
async fn test_handshake_times_out_without_application_list() {
    let (listener, mut settings) = listen().await;
    settings.connect_timeout_ms = 100;

    let (result, _device) = tokio::join!(RemoteDebugger::connect_native(&settings), async {
        let mut device = MockDevice::accept(&listener).await;
        device.expect_selector("_rpc_reportIdentifier:").await;
        device
    });
    assert!(matches!(result.unwrap_err(), Error::Timeout { .. }));
}

#[tokio::test]
async fn test_select_app_emits_page_changed_once_for_repeated_listing() {
    let (debugger, mut device) = connect().await;
    let mut events = debugger.subscribe();

    let (selected, _) = tokio::join!(debugger.select_app(None), async {
        device.expect_selector("_rpc_forwardGetListing:").await;
        device
            .send_listing(SAFARI_ID, &[(1, "Home", "http://example.com/")])
            .await;
    });
    let (app_id, pages) = selected.unwrap();
    assert_eq!(app_id, SAFARI_ID);
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].id, "1");
    assert!(!pages[0].is_key);

    match next_event(&mut events).await {
        SessionEvent::PageChanged { app_id, pages } => {
            assert_eq!(app_id, "42");
            assert_eq!(pages[0].url, "http://example.com/");
        }
        other => panic!("unexpected event {other:?}"),
    }

    // the same listing again is a no-op
    device
        .send_listing(SAFARI_ID, &[(1, "Home", "http://example.com/")])
        .await;
    device
        .send_listing(SAFARI_ID, &[(1, "Next", "http://example.com/next")])
        .await;
    match next_event(&mut events).await {
        SessionEvent::PageChanged { pages, .. } => assert_eq!(pages[0].title, "Next"),
        other => panic!("unexpected event {other:?}"),
    }

    let stored = debugger.pages(SAFARI_ID).await.unwrap().unwrap();
    assert_eq!(stored[0].title, "Next");
}

// ─────────────────────────────────────────────────────────
// Requests and responses
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_evaluate_returns_unwrapped_value() {
    let (debugger, mut device) = attach().await;

    let (value, _) = tokio::join!(debugger.evaluate("6 * 7"), async {
        let command = device.recv_command().await;
        assert_eq!(command["method"], "Runtime.evaluate");
        assert_eq!(command["params"]["expression"], "6 * 7");
        device
            .reply(
                &command,
                json!({ "result": { "type": "number", "value": 42 }, "wasThrown": false }),
            )
            .await;
    });
    assert_eq!(value.unwrap(), json!(42));
}

/// Evaluate `script`, answering with a remote object carrying `value`.
async fn evaluate_returning(script: &str, remote: Value) -> rdbg_core::Result<Value> {
    let (debugger, mut device) = attach().await;
    let (value, _) = tokio::join!(debugger.evaluate(script), async {
        let command = device.recv_command().await;
        device
            .reply(&command, json!({ "result": remote, "wasThrown": false }))
            .await;
    });
    value
}

#[tokio::test]
async fn test_evaluate_object_with_result_key() {
    let value = evaluate_returning(
        "({ result: 'ok', n: 2 })",
        json!({ "type": "object", "value": { "result": "ok", "n": 2 } }),
    )
    .await;
    assert_eq!(value.unwrap(), json!({ "result": "ok", "n": 2 }));
}

#[tokio::test]
async fn test_evaluate_object_with_was_thrown_key() {
    let value = evaluate_returning(
        "({ wasThrown: true, value: 'x' })",
        json!({ "type": "object", "value": { "wasThrown": true, "value": "x" } }),
    )
    .await;
    assert_eq!(value.unwrap(), json!({ "wasThrown": true, "value": "x" }));
}

#[tokio::test]
async fn test_evaluate_null() {
    let value = evaluate_returning(
        "null",
        json!({ "type": "object", "subtype": "null", "value": null }),
    )
    .await;
    assert_eq!(value.unwrap(), Value::Null);
}

#[tokio::test]
async fn test_evaluate_thrown_is_remote_script_error() {
    let (debugger, mut device) = attach().await;

    let (value, _) = tokio::join!(debugger.evaluate("boom()"), async {
        let command = device.recv_command().await;
        device
            .reply(
                &command,
                json!({
                    "result": { "type": "object", "description": "ReferenceError: boom" },
                    "wasThrown": true
                }),
            )
            .await;
    });
    match value.unwrap_err() {
        Error::RemoteScript { message } => assert_eq!(message, "ReferenceError: boom"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_error_field_is_remote_command_error() {
    let (debugger, mut device) = attach().await;

    let (value, _) = tokio::join!(debugger.evaluate("1"), async {
        let command = device.recv_command().await;
        device
            .send_data(json!({
                "id": command["id"],
                "error": { "code": -32601, "message": "'Runtime.evaluate' was not found" }
            }))
            .await;
    });
    match value.unwrap_err() {
        Error::RemoteCommand { message } => {
            assert_eq!(message, "'Runtime.evaluate' was not found")
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_responses_are_matched_by_id_not_order() {
    let (debugger, mut device) = attach().await;

    let (first, second, _) = tokio::join!(debugger.evaluate("'a'"), debugger.evaluate("'b'"), async {
        let a = device.recv_command().await;
        let b = device.recv_command().await;
        // answer in reverse order
        for command in [&b, &a] {
            let value = command["params"]["expression"]
                .as_str()
                .unwrap()
                .trim_matches('\'')
                .to_string();
            device
                .reply(command, json!({ "result": { "type": "string", "value": value } }))
                .await;
        }
    });
    assert_eq!(first.unwrap(), json!("a"));
    assert_eq!(second.unwrap(), json!("b"));
}

// ─────────────────────────────────────────────────────────
// Navigation
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_navigate_waits_for_ready_and_ignores_own_frame_navigation() {
    let (debugger, mut device) = attach().await;
    let mut unload = debugger.on_page_unload().unwrap();
    debugger.snapshot().await.unwrap();

    let (navigated, _) = tokio::join!(debugger.navigate_to("http://example.com/next"), async {
        let navigate = device.recv_command().await;
        assert_eq!(navigate["method"], "Page.navigate");
        assert_eq!(navigate["params"]["url"], "http://example.com/next");
        device.reply(&navigate, json!({})).await;

        device
            .send_data(json!({ "method": "Page.frameNavigated", "params": {} }))
            .await;
        device
            .send_data(json!({ "method": "Page.loadEventFired", "params": {} }))
            .await;

        let ready = device.recv_command().await;
        assert_eq!(ready["params"]["expression"], "document.readyState");
        device
            .reply(
                &ready,
                json!({ "result": { "type": "string", "value": "complete" }, "wasThrown": false }),
            )
            .await;
    });
    navigated.unwrap();
    assert!(unload.try_recv().is_err());

    // an unexpected navigation now counts as an unload
    device
        .send_data(json!({ "method": "Page.frameNavigated", "params": {} }))
        .await;
    tokio::time::timeout(RECV_TIMEOUT, &mut unload)
        .await
        .expect("unload handler never fired")
        .unwrap();
}

#[tokio::test]
async fn test_allowed_navigation_does_not_fire_unload() {
    let (debugger, mut device) = attach().await;
    let mut unload = debugger.on_page_unload().unwrap();
    debugger.allow_navigation_without_reload(true).unwrap();
    debugger.snapshot().await.unwrap();

    device
        .send_data(json!({ "method": "Page.frameNavigated", "params": {} }))
        .await;
    debugger.snapshot().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(unload.try_recv().is_err());

    // the allowance is consumed by one navigation
    device
        .send_data(json!({ "method": "Page.frameNavigated", "params": {} }))
        .await;
    tokio::time::timeout(RECV_TIMEOUT, &mut unload)
        .await
        .expect("unload handler never fired")
        .unwrap();
}

// ─────────────────────────────────────────────────────────
// Timeline
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_timeline_records_are_forwarded() {
    let (debugger, mut device) = attach().await;

    let (records, _) = tokio::join!(debugger.start_timeline(), async {
        let start = device.recv_command().await;
        assert_eq!(start["method"], "Timeline.start");
        device.reply(&start, json!({})).await;
    });
    let mut records = records.unwrap();

    device
        .send_data(json!({
            "method": "Timeline.eventRecorded",
            "params": { "record": { "type": "Layout" } }
        }))
        .await;
    let record = tokio::time::timeout(RECV_TIMEOUT, records.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.record["type"], "Layout");
}

// ─────────────────────────────────────────────────────────
// Disconnection
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_last_app_disconnect_emits_disconnected() {
    let (debugger, mut device) = connect().await;
    let mut events = debugger.subscribe();

    let mut arg = Dictionary::new();
    arg.insert(keys::APPLICATION_ID.to_string(), SAFARI_ID.into());
    device.send("_rpc_applicationDisconnected:", arg).await;

    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    let snapshot = debugger.snapshot().await.unwrap();
    assert!(!snapshot.connected);
    assert!(snapshot.apps.is_empty());
    assert_eq!(snapshot.target_app, None);
}

#[tokio::test]
async fn test_transport_close_fails_pending_request() {
    let (debugger, mut device) = attach().await;
    let mut events = debugger.subscribe();

    let (value, _) = tokio::join!(debugger.evaluate("never answered"), async move {
        device.recv_command().await;
        drop(device);
    });
    assert!(matches!(value.unwrap_err(), Error::Disconnected));
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
}

#[tokio::test]
async fn test_requests_after_disconnect_fail() {
    let (debugger, _device) = attach().await;
    debugger.disconnect();

    let err = debugger.evaluate("1").await.unwrap_err();
    assert!(matches!(err, Error::Disconnected));
    assert!(!debugger.is_connected().await);
}
