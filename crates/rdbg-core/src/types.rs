//! Domain types for remote debugging sessions

use serde::{Deserialize, Serialize};

/// Which flavour of remote endpoint a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DebuggerKind {
    /// Binary-plist Web Inspector protocol over a device socket.
    #[default]
    Native,
    /// HTTP page listing plus per-page JSON WebSocket.
    WebKit,
}

impl std::fmt::Display for DebuggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DebuggerKind::Native => write!(f, "native"),
            DebuggerKind::WebKit => write!(f, "webkit"),
        }
    }
}

/// One inspectable page or tab inside an application.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: String,
    pub title: String,
    pub url: String,
    /// Whether this is the page currently holding an inspector connection.
    pub is_key: bool,
}

impl Page {
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            url: url.into(),
            is_key: false,
        }
    }

    pub fn with_key(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self
    }
}

/// The page listing of an application.
///
/// An application is known before its pages are: `Pending` marks an
/// application whose first listing has not arrived yet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PageArray {
    #[default]
    Pending,
    Listed(Vec<Page>),
}

impl PageArray {
    pub fn is_pending(&self) -> bool {
        matches!(self, PageArray::Pending)
    }

    /// Pages in endpoint-reported order, or `None` while pending.
    pub fn pages(&self) -> Option<&[Page]> {
        match self {
            PageArray::Pending => None,
            PageArray::Listed(pages) => Some(pages),
        }
    }
}

/// One remote application known to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    /// Application identifier key, e.g. `PID:1234`.
    pub id: String,
    pub name: String,
    pub bundle_id: String,
    /// Proxies (e.g. web content processes) are hosted by another application.
    pub is_proxy: bool,
    pub host_id: Option<String>,
    pub is_active: bool,
    pub page_array: PageArray,
}

impl Application {
    pub fn new(id: impl Into<String>, name: impl Into<String>, bundle_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            bundle_id: bundle_id.into(),
            is_proxy: false,
            host_id: None,
            is_active: false,
            page_array: PageArray::Pending,
        }
    }

    pub fn with_proxy_host(mut self, host_id: impl Into<String>) -> Self {
        self.is_proxy = true;
        self.host_id = Some(host_id.into());
        self
    }
}

/// Simulator identity reported by `_rpc_reportSetup:`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatorInfo {
    pub name: Option<String>,
    pub build: Option<String>,
    pub product_version: Option<String>,
}

/// Strip the connection-scoped `PID:` prefix from an application id.
pub fn strip_app_id_prefix(app_id: &str) -> &str {
    app_id.strip_prefix("PID:").unwrap_or(app_id)
}

/// Leading `major.minor` of a platform version string as a float.
///
/// `"9.3.1"` parses as `9.3`; unparseable input yields `None`.
pub fn parse_platform_version(version: &str) -> Option<f64> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?;
    let candidate = match parts.next() {
        Some(minor) => format!("{major}.{minor}"),
        None => major.to_string(),
    };
    candidate.parse().ok()
}
