//! JSON output on stdout
//!
//! Every result is printed as one NDJSON line with an `event` tag, so the
//! output can be piped into scripts without parsing human-readable text.
//!
//! ```json
//! {"event":"app","id":"PID:42","name":"Safari","bundle_id":"com.apple.mobilesafari","is_proxy":false,"host_id":null,"is_active":true,"timestamp":1704700001000}
//! {"event":"page_changed","app_id":"42","pages":[...],"timestamp":1704700002000}
//! ```

use std::io::{self, Write};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use rdbg_core::{Application, Error, Page, SessionEvent};
use rdbg_device::SimDevice;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutputEvent {
    App {
        id: String,
        name: String,
        bundle_id: String,
        is_proxy: bool,
        host_id: Option<String>,
        is_active: bool,
        timestamp: i64,
    },

    Page {
        app_id: Option<String>,
        id: String,
        title: String,
        url: String,
        is_key: bool,
        timestamp: i64,
    },

    /// Result of a script evaluation
    Evaluated { value: Value, timestamp: i64 },

    PageChanged {
        app_id: String,
        pages: Vec<Page>,
        timestamp: i64,
    },

    Disconnected { timestamp: i64 },

    Simulator {
        name: String,
        udid: String,
        state: String,
        sdk: String,
        timestamp: i64,
    },

    Error {
        message: String,
        fatal: bool,
        timestamp: i64,
    },
}

impl OutputEvent {
    /// Write this event to stdout as one JSON line.
    pub fn emit(&self) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize output event: {}", e);
                return;
            }
        };

        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", json) {
            error!("Failed to write output event to stdout: {}", e);
            return;
        }

        if let Err(e) = stdout.flush() {
            error!("Failed to flush stdout: {}", e);
        }
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ─────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────

    pub fn app(app: &Application) -> Self {
        Self::App {
            id: app.id.clone(),
            name: app.name.clone(),
            bundle_id: app.bundle_id.clone(),
            is_proxy: app.is_proxy,
            host_id: app.host_id.clone(),
            is_active: app.is_active,
            timestamp: Self::now(),
        }
    }

    pub fn page(app_id: Option<&str>, page: &Page) -> Self {
        Self::Page {
            app_id: app_id.map(str::to_string),
            id: page.id.clone(),
            title: page.title.clone(),
            url: page.url.clone(),
            is_key: page.is_key,
            timestamp: Self::now(),
        }
    }

    pub fn evaluated(value: Value) -> Self {
        Self::Evaluated {
            value,
            timestamp: Self::now(),
        }
    }

    pub fn session(event: SessionEvent) -> Self {
        match event {
            SessionEvent::PageChanged { app_id, pages } => Self::PageChanged {
                app_id,
                pages,
                timestamp: Self::now(),
            },
            SessionEvent::Disconnected => Self::Disconnected {
                timestamp: Self::now(),
            },
        }
    }

    pub fn simulator(device: &SimDevice) -> Self {
        Self::Simulator {
            name: device.name.clone(),
            udid: device.udid.clone(),
            state: device.state.clone(),
            sdk: device.sdk.clone(),
            timestamp: Self::now(),
        }
    }

    pub fn error(err: &Error) -> Self {
        Self::Error {
            message: err.to_string(),
            fatal: err.is_fatal(),
            timestamp: Self::now(),
        }
    }
}
