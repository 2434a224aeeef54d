//! Session state aggregation.
//!
//! [`SessionState`] owns the application map, the current target and the
//! navigation state. It is mutated only by the special handlers installed
//! with [`register_session_handlers`], which the router calls with an
//! explicit `&mut SessionState`. Lifecycle changes are published to
//! subscribers as [`SessionEvent`]s over a broadcast channel.

use std::collections::{HashMap, HashSet};

use plist::{Dictionary, Value as PlistValue};
use tokio::sync::{broadcast, oneshot};

use rdbg_core::prelude::*;
use rdbg_core::{
    parse_platform_version, strip_app_id_prefix, Application, DebuggerSettings, Page, PageArray,
    SessionEvent, SimulatorInfo, TargetFallback,
};

use crate::protocol::{
    app_info_from_dict, keys, page_array_from_dict, Dispatch, SpecialEvent, SpecialPayload,
};
use crate::router::{MessageRouter, RouterContext};

/// Platform version from which web content runs in proxy applications.
const PROXY_PLATFORM_VERSION: f64 = 8.0;

/// Point-in-time copy of the session for callers outside the receive path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub connected: bool,
    /// Known applications ordered by identifier.
    pub apps: Vec<Application>,
    pub target_app: Option<String>,
    pub target_page: Option<String>,
    pub simulator: Option<SimulatorInfo>,
    pub drivers: Vec<String>,
}

/// Derived state of one debugging session.
pub struct SessionState {
    apps: HashMap<String, Application>,
    target_app: Option<String>,
    target_page: Option<String>,
    connected: bool,
    /// Unified "navigation in progress": set by an explicit navigation and
    /// cleared once the page reports ready.
    navigating: bool,
    disconnect_emitted: bool,
    skipped_apps: HashSet<String>,
    bundle_id: Option<String>,
    platform_version: Option<f64>,
    fallback: TargetFallback,
    simulator: Option<SimulatorInfo>,
    drivers: Dictionary,
    events: broadcast::Sender<SessionEvent>,
    listing_waiters: Vec<(String, oneshot::Sender<Vec<Page>>)>,
    app_list_waiters: Vec<oneshot::Sender<Vec<Application>>>,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("apps", &self.apps.len())
            .field("target_app", &self.target_app)
            .field("target_page", &self.target_page)
            .field("connected", &self.connected)
            .field("navigating", &self.navigating)
            .finish()
    }
}

impl RouterContext for SessionState {
    fn navigation_in_progress(&self) -> bool {
        self.navigating
    }
}

impl SessionState {
    pub fn new(settings: &DebuggerSettings, events: broadcast::Sender<SessionEvent>) -> Self {
        let platform_version = settings
            .platform_version
            .as_deref()
            .and_then(parse_platform_version);
        Self {
            apps: HashMap::new(),
            target_app: None,
            target_page: None,
            connected: false,
            navigating: false,
            disconnect_emitted: false,
            skipped_apps: settings.skipped_apps.iter().cloned().collect(),
            bundle_id: settings.bundle_id.clone(),
            platform_version,
            fallback: settings.target_fallback,
            simulator: None,
            drivers: Dictionary::new(),
            events,
            listing_waiters: Vec::new(),
            app_list_waiters: Vec::new(),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        if connected {
            self.disconnect_emitted = false;
        }
    }

    pub fn is_navigating(&self) -> bool {
        self.navigating
    }

    pub fn set_navigating(&mut self, navigating: bool) {
        self.navigating = navigating;
    }

    pub fn app(&self, app_id: &str) -> Option<&Application> {
        self.apps.get(app_id)
    }

    /// Applications ordered by identifier.
    pub fn apps(&self) -> Vec<Application> {
        let mut apps: Vec<Application> = self.apps.values().cloned().collect();
        apps.sort_by(|a, b| a.id.cmp(&b.id));
        apps
    }

    /// Listed pages of `app_id`, or `None` when unknown or still pending.
    pub fn pages(&self, app_id: &str) -> Option<Vec<Page>> {
        self.apps
            .get(app_id)
            .and_then(|app| app.page_array.pages())
            .map(<[Page]>::to_vec)
    }

    pub fn target_app(&self) -> Option<&str> {
        self.target_app.as_deref()
    }

    pub fn set_target_app(&mut self, app_id: Option<String>) {
        if self.target_app != app_id {
            self.target_page = None;
        }
        self.target_app = app_id;
    }

    pub fn target_page(&self) -> Option<&str> {
        self.target_page.as_deref()
    }

    pub fn set_target_page(&mut self, page_id: Option<String>) {
        self.target_page = page_id;
    }

    pub fn simulator(&self) -> Option<&SimulatorInfo> {
        self.simulator.as_ref()
    }

    /// Identifiers of the drivers reported by the endpoint.
    pub fn drivers(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connected: self.connected,
            apps: self.apps(),
            target_app: self.target_app.clone(),
            target_page: self.target_page.clone(),
            simulator: self.simulator.clone(),
            drivers: self.drivers(),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Waiters
    // ─────────────────────────────────────────────────────────

    /// Resolve `tx` with the next listing reported for `app_id`.
    pub fn wait_for_listing(&mut self, app_id: impl Into<String>, tx: oneshot::Sender<Vec<Page>>) {
        self.listing_waiters.push((app_id.into(), tx));
    }

    /// Resolve `tx` with the application map after the next bulk
    /// application list.
    pub fn wait_for_app_list(&mut self, tx: oneshot::Sender<Vec<Application>>) {
        self.app_list_waiters.push(tx);
    }

    // ─────────────────────────────────────────────────────────
    // Notification handlers
    // ─────────────────────────────────────────────────────────

    pub fn on_report_setup(&mut self, info: SimulatorInfo) {
        debug!(
            "Endpoint setup: name={:?} build={:?} version={:?}",
            info.name, info.build, info.product_version
        );
        self.simulator = Some(info);
    }

    /// Merge a newly connected application without overwriting a known one.
    pub fn on_app_connect(&mut self, dict: &Dictionary) {
        let Some(app) = app_info_from_dict(dict) else {
            warn!("Application connected without an identifier");
            return;
        };
        debug!("Notified that new application '{}' has connected", app.id);
        self.merge_app(app);
        self.ensure_target();
    }

    pub fn on_app_disconnect(&mut self, dict: &Dictionary) {
        let Some(app_id) = dict.get(keys::APPLICATION_ID).and_then(PlistValue::as_string) else {
            warn!("Application disconnected without an identifier");
            return;
        };
        debug!("Application '{}' disconnected, removing it", app_id);
        self.apps.remove(app_id);
        self.listing_waiters.retain(|(waiting_for, _)| waiting_for != app_id);

        if self.target_app.as_deref() == Some(app_id) {
            debug!("Lost the target application, looking for a new one");
            let replacement = self.select_target();
            self.set_target_app(replacement);
        }

        if self.apps.is_empty() {
            debug!("No applications left, disconnecting session");
            self.mark_disconnected();
        }
    }

    /// Refresh metadata of an application, keeping its page listing.
    pub fn on_app_update(&mut self, dict: &Dictionary) {
        let Some(update) = app_info_from_dict(dict) else {
            warn!("Application update without an identifier");
            return;
        };
        if self.skipped_apps.contains(&update.name) {
            return;
        }
        match self.apps.get_mut(&update.id) {
            Some(app) => {
                let page_array = std::mem::take(&mut app.page_array);
                *app = Application {
                    page_array,
                    ..update
                };
            }
            None => {
                self.apps.insert(update.id.clone(), update);
            }
        }
        self.ensure_target();
    }

    /// Bulk snapshot of connected applications; same merge policy as
    /// [`SessionState::on_app_connect`].
    pub fn on_connected_application_list(&mut self, apps: &Dictionary) {
        let ids: Vec<&String> = apps.keys().collect();
        debug!("Received connected applications list: {:?}", ids);

        for dict in apps.values().filter_map(PlistValue::as_dictionary) {
            match app_info_from_dict(dict) {
                Some(app) => self.merge_app(app),
                None => warn!("Skipping application entry without an identifier"),
            }
        }
        self.ensure_target();

        if !self.app_list_waiters.is_empty() {
            let snapshot = self.apps();
            for tx in self.app_list_waiters.drain(..) {
                let _ = tx.send(snapshot.clone());
            }
        }
    }

    pub fn on_connected_driver_list(&mut self, drivers: Dictionary) {
        debug!(
            "Received connected driver list: {:?}",
            drivers.keys().collect::<Vec<_>>()
        );
        self.drivers = drivers;
    }

    /// A page listing for `app_id`.
    ///
    /// Identical listings are no-ops. Listings arriving mid-navigation are
    /// stored but not reported. Only the target application's changes are
    /// emitted.
    pub fn on_page_change(&mut self, app_id: &str, listing: &Dictionary) {
        if listing.is_empty() {
            return;
        }
        let pages = page_array_from_dict(listing);

        let mut remaining = Vec::with_capacity(self.listing_waiters.len());
        for (waiting_for, tx) in self.listing_waiters.drain(..) {
            if waiting_for == app_id {
                let _ = tx.send(pages.clone());
            } else {
                remaining.push((waiting_for, tx));
            }
        }
        self.listing_waiters = remaining;

        if let Some(app) = self.apps.get_mut(app_id) {
            if let PageArray::Listed(existing) = &app.page_array {
                if *existing == pages {
                    debug!(
                        "Page listing for app '{}' has not changed, ignoring",
                        app_id
                    );
                    return;
                }
            }
            app.page_array = PageArray::Listed(pages.clone());
        }

        if self.navigating {
            debug!("Navigation in progress, not reporting page change");
            return;
        }

        if self.target_app.as_deref() != Some(app_id) {
            debug!(
                "Page change for app '{}' but listening for {:?}, ignoring",
                app_id, self.target_app
            );
            return;
        }

        debug!("Page changed for app '{}': {} page(s)", app_id, pages.len());
        let _ = self.events.send(SessionEvent::PageChanged {
            app_id: strip_app_id_prefix(app_id).to_string(),
            pages,
        });
    }

    /// Mark the session disconnected, emitting [`SessionEvent::Disconnected`]
    /// the first time only. Outstanding waiters are dropped.
    pub fn mark_disconnected(&mut self) {
        self.connected = false;
        self.navigating = false;
        self.listing_waiters.clear();
        self.app_list_waiters.clear();
        if !self.disconnect_emitted {
            self.disconnect_emitted = true;
            let _ = self.events.send(SessionEvent::Disconnected);
        }
    }

    /// Tear down everything: applications, target and waiters.
    pub fn reset(&mut self) {
        self.apps.clear();
        self.target_app = None;
        self.target_page = None;
        self.drivers = Dictionary::new();
        self.mark_disconnected();
    }

    // ─────────────────────────────────────────────────────────
    // Target selection
    // ─────────────────────────────────────────────────────────

    fn merge_app(&mut self, app: Application) {
        if self.skipped_apps.contains(&app.name) {
            debug!("Skipping ignored application '{}'", app.name);
            return;
        }
        self.apps.entry(app.id.clone()).or_insert(app);
    }

    fn ensure_target(&mut self) {
        if self.target_app.is_none() {
            if let Some(target) = self.select_target() {
                debug!("Selected target application '{}'", target);
                self.target_app = Some(target);
            }
        }
    }

    /// Pick a target application.
    ///
    /// Applications whose bundle id matches come first; from platform 8 on a
    /// proxy hosted by the match is preferred, below 8 the key equal to the
    /// bundle id. Without a match the configured fallback applies.
    pub fn select_target(&self) -> Option<String> {
        if let Some(bundle_id) = self.bundle_id.as_deref() {
            let modern = self
                .platform_version
                .map(|v| v >= PROXY_PLATFORM_VERSION)
                .unwrap_or(true);

            if modern {
                let mut matches: Vec<&Application> = self
                    .apps
                    .values()
                    .filter(|app| app.bundle_id == bundle_id)
                    .collect();
                matches.sort_by(|a, b| a.id.cmp(&b.id));

                for app in &matches {
                    let proxy = self
                        .apps
                        .values()
                        .filter(|p| p.is_proxy && p.host_id.as_deref() == Some(app.id.as_str()))
                        .map(|p| p.id.clone())
                        .min();
                    if proxy.is_some() {
                        return proxy;
                    }
                }
                if let Some(app) = matches.first() {
                    return Some(app.id.clone());
                }
            } else if self.apps.contains_key(bundle_id) {
                return Some(bundle_id.to_string());
            }
        }

        match self.fallback {
            TargetFallback::FirstAvailable => self.apps.keys().min().cloned(),
            TargetFallback::None => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Router wiring
// ─────────────────────────────────────────────────────────────────

/// Install the lifecycle handlers that keep [`SessionState`] current.
///
/// Listing, connect, disconnect, update and driver-list handlers persist;
/// setup and the bulk application list are armed one-shot per request with
/// [`arm_report_setup`] and [`arm_application_list`].
pub fn register_session_handlers(router: &mut MessageRouter<SessionState>) {
    router.register_special_handler(
        SpecialEvent::ApplicationListing,
        Dispatch::Persistent,
        None,
        Box::new(|session: &mut SessionState, payload: SpecialPayload| {
            if let SpecialPayload::ApplicationListing { app_id, listing } = payload {
                session.on_page_change(&app_id, &listing);
            }
        }),
    );
    router.register_special_handler(
        SpecialEvent::ApplicationConnected,
        Dispatch::Persistent,
        None,
        Box::new(|session: &mut SessionState, payload: SpecialPayload| {
            if let SpecialPayload::ApplicationConnected(dict) = payload {
                session.on_app_connect(&dict);
            }
        }),
    );
    router.register_special_handler(
        SpecialEvent::ApplicationDisconnected,
        Dispatch::Persistent,
        None,
        Box::new(|session: &mut SessionState, payload: SpecialPayload| {
            if let SpecialPayload::ApplicationDisconnected(dict) = payload {
                session.on_app_disconnect(&dict);
            }
        }),
    );
    router.register_special_handler(
        SpecialEvent::ApplicationUpdated,
        Dispatch::Persistent,
        None,
        Box::new(|session: &mut SessionState, payload: SpecialPayload| {
            if let SpecialPayload::ApplicationUpdated(dict) = payload {
                session.on_app_update(&dict);
            }
        }),
    );
    router.register_special_handler(
        SpecialEvent::ConnectedDriverList,
        Dispatch::Persistent,
        None,
        Box::new(|session: &mut SessionState, payload: SpecialPayload| {
            if let SpecialPayload::ConnectedDriverList(drivers) = payload {
                session.on_connected_driver_list(drivers);
            }
        }),
    );
}

pub fn arm_report_setup(router: &mut MessageRouter<SessionState>) {
    router.register_special_handler(
        SpecialEvent::ReportIdentifier,
        Dispatch::OneShot,
        None,
        Box::new(|session: &mut SessionState, payload: SpecialPayload| {
            if let SpecialPayload::ReportIdentifier(info) = payload {
                session.on_report_setup(info);
            }
        }),
    );
}

pub fn arm_application_list(router: &mut MessageRouter<SessionState>) {
    router.register_special_handler(
        SpecialEvent::ConnectedApplicationList,
        Dispatch::OneShot,
        None,
        Box::new(|session: &mut SessionState, payload: SpecialPayload| {
            if let SpecialPayload::ConnectedApplicationList(apps) = payload {
                session.on_connected_application_list(&apps);
            }
        }),
    );
}
