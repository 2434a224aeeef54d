//! Mock inspector endpoint for integration testing
//!
//! Speaks the length-prefixed binary plist protocol over a real loopback TCP
//! socket, so tests drive the full connect → route → respond path without a
//! device. The mock is scripted from the test body: it only sends what the
//! test tells it to, and every receive has a short timeout so a missing frame
//! fails fast instead of hanging.

#![allow(dead_code)]

use std::time::Duration;

use plist::{Dictionary, Value as PlistValue};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};

use rdbg_core::DebuggerSettings;
use rdbg_rpc::codec::{read_frame, write_frame};
use rdbg_rpc::protocol::{keys, ARGUMENT_KEY, SELECTOR_KEY};
use rdbg_rpc::{BinaryPlistCodec, PlistCodec};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub const SAFARI_ID: &str = "PID:42";
pub const SAFARI_BUNDLE: &str = "com.apple.mobilesafari";

/// Bind a loopback listener and settings pointing at it.
pub async fn listen() -> (TcpListener, DebuggerSettings) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let settings = DebuggerSettings {
        host: "127.0.0.1".to_string(),
        port,
        bundle_id: Some(SAFARI_BUNDLE.to_string()),
        platform_version: Some("9.3".to_string()),
        connect_timeout_ms: 2_000,
        page_load_timeout_ms: 2_000,
        page_ready_poll_ms: 20,
        ..Default::default()
    };
    (listener, settings)
}

pub struct MockDevice {
    stream: TcpStream,
}

impl MockDevice {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(RECV_TIMEOUT, listener.accept())
            .await
            .expect("debugger never connected")
            .unwrap();
        Self { stream }
    }

    /// Accept and complete the identifier handshake with one Safari app.
    pub async fn accept_with_safari(listener: &TcpListener) -> Self {
        let mut device = Self::accept(listener).await;
        device.expect_selector("_rpc_reportIdentifier:").await;
        device.send("_rpc_reportSetup:", setup_dict()).await;

        let mut apps = Dictionary::new();
        apps.insert(
            SAFARI_ID.to_string(),
            PlistValue::Dictionary(app_dict(SAFARI_ID, "Safari", SAFARI_BUNDLE)),
        );
        let mut arg = Dictionary::new();
        arg.insert(
            keys::APPLICATION_DICTIONARY.to_string(),
            PlistValue::Dictionary(apps),
        );
        device
            .send("_rpc_reportConnectedApplicationList:", arg)
            .await;
        device
    }

    /// Receive the next frame from the debugger.
    pub async fn recv(&mut self) -> PlistValue {
        let body = tokio::time::timeout(RECV_TIMEOUT, read_frame(&mut self.stream))
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("debugger closed the socket");
        BinaryPlistCodec.decode(&body).unwrap()
    }

    /// Receive the next frame, assert its selector, and return its argument.
    pub async fn expect_selector(&mut self, selector: &str) -> Dictionary {
        let message = self.recv().await;
        let dict = message.as_dictionary().unwrap();
        assert_eq!(
            dict.get(SELECTOR_KEY).and_then(PlistValue::as_string),
            Some(selector)
        );
        dict.get(ARGUMENT_KEY)
            .and_then(PlistValue::as_dictionary)
            .cloned()
            .unwrap()
    }

    /// Receive the next inspector command tunnelled in `_rpc_forwardSocketData:`.
    pub async fn recv_command(&mut self) -> Value {
        let arg = self.expect_selector("_rpc_forwardSocketData:").await;
        let data = arg
            .get(keys::SOCKET_DATA)
            .and_then(PlistValue::as_data)
            .unwrap();
        serde_json::from_slice(data).unwrap()
    }

    /// Answer `command` with `result`.
    pub async fn reply(&mut self, command: &Value, result: Value) {
        self.send_data(serde_json::json!({ "id": command["id"], "result": result }))
            .await;
    }

    pub async fn send(&mut self, selector: &str, argument: Dictionary) {
        let mut message = Dictionary::new();
        message.insert(SELECTOR_KEY.to_string(), selector.into());
        message.insert(ARGUMENT_KEY.to_string(), PlistValue::Dictionary(argument));
        let bytes = BinaryPlistCodec
            .encode(&PlistValue::Dictionary(message))
            .unwrap();
        write_frame(&mut self.stream, &bytes).await.unwrap();
    }

    /// Send a JSON data document via `_rpc_applicationSentData:`.
    pub async fn send_data(&mut self, json: Value) {
        let mut arg = Dictionary::new();
        arg.insert(keys::APPLICATION_ID.to_string(), SAFARI_ID.into());
        arg.insert(
            keys::MESSAGE_DATA.to_string(),
            PlistValue::Data(json.to_string().into_bytes()),
        );
        self.send("_rpc_applicationSentData:", arg).await;
    }

    pub async fn send_listing(&mut self, app_id: &str, pages: &[(u64, &str, &str)]) {
        let mut arg = Dictionary::new();
        arg.insert(keys::APPLICATION_ID.to_string(), app_id.into());
        arg.insert(keys::LISTING.to_string(), PlistValue::Dictionary(listing(pages)));
        self.send("_rpc_applicationSentListing:", arg).await;
    }
}

pub fn setup_dict() -> Dictionary {
    let mut d = Dictionary::new();
    d.insert(keys::SIMULATOR_NAME.to_string(), "iPhone 6".into());
    d.insert(keys::SIMULATOR_BUILD.to_string(), "13E233".into());
    d.insert(keys::SIMULATOR_PRODUCT_VERSION.to_string(), "9.3".into());
    d
}

pub fn app_dict(id: &str, name: &str, bundle: &str) -> Dictionary {
    let mut d = Dictionary::new();
    d.insert(keys::APPLICATION_ID.to_string(), id.into());
    d.insert(keys::APPLICATION_NAME.to_string(), name.into());
    d.insert(keys::APPLICATION_BUNDLE_ID.to_string(), bundle.into());
    d.insert(keys::IS_PROXY.to_string(), PlistValue::Boolean(false));
    d
}

pub fn listing(pages: &[(u64, &str, &str)]) -> Dictionary {
    let mut listing = Dictionary::new();
    for (id, title, url) in pages {
        let mut page = Dictionary::new();
        page.insert(keys::PAGE_ID.to_string(), PlistValue::Integer((*id).into()));
        page.insert(keys::TITLE.to_string(), (*title).into());
        page.insert(keys::URL.to_string(), (*url).into());
        page.insert(keys::TYPE.to_string(), keys::TYPE_WEB.into());
        listing.insert(id.to_string(), PlistValue::Dictionary(page));
    }
    listing
}
