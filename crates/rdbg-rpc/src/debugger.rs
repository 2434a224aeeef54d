//! Caller-facing remote debugger.
//!
//! [`RemoteDebugger`] is a clonable handle. All protocol state (the
//! [`MessageRouter`] tables and the [`SessionState`]) lives in a single
//! driver task that owns the transport's inbound receiver; the handle only
//! sends it commands and awaits oneshot replies.
//!
//! ```text
//! RemoteDebugger ──cmd──▶ driver task ──▶ RpcClient ──▶ endpoint
//!       ▲                   │  route_message()
//!       └──oneshot/broadcast┘◀─ inbound frames
//! ```
//!
//! Work that must wait on further frames (page readiness after a load event)
//! runs in its own spawned task so the receive loop never stalls on it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use url::Url;

use rdbg_core::prelude::*;
use rdbg_core::{Application, DebuggerKind, DebuggerSettings, Page, SessionEvent, TimelineRecord};

use crate::normalizer::{normalizer_for, ResultNormalizer};
use crate::protocol::{
    ConnectionIds, Dispatch, InspectorCommand, RpcMessage, SpecialEvent, SpecialPayload,
};
use crate::router::{DataHandler, ErrorHandler, MessageRouter, RouteOutcome};
use crate::session::{
    arm_application_list, arm_report_setup, register_session_handlers, SessionSnapshot,
    SessionState,
};
use crate::transport::{ConnectTarget, InboundFrame, RpcClient};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const TIMELINE_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Driver commands
// ---------------------------------------------------------------------------

enum DriverCommand {
    /// Send an inspector command to the target page and deliver the response.
    Request {
        command: InspectorCommand,
        /// Answer with the whole `result` document instead of its value.
        raw: bool,
        response_tx: oneshot::Sender<Result<Value>>,
    },
    /// Send a selector-level message; nothing is correlated.
    Notify(RpcMessage),
    WaitForListing {
        app_id: String,
        tx: oneshot::Sender<Vec<Page>>,
    },
    WaitForAppList(oneshot::Sender<Vec<Application>>),
    WaitForPageLoad(oneshot::Sender<Result<()>>),
    ArmReportSetup,
    ArmPageUnload(oneshot::Sender<()>),
    SetConnected(bool),
    SetNavigating(bool),
    AllowNavigationWithoutReload(bool),
    SetTarget {
        app_id: Option<String>,
        page_id: Option<String>,
    },
    SetTimeline(Option<mpsc::Sender<TimelineRecord>>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    /// The page finished loading (sent by the readiness check).
    PageReady,
    Disconnect,
}

// ---------------------------------------------------------------------------
// RemoteDebugger
// ---------------------------------------------------------------------------

/// Handle to one remote debugging session.
#[derive(Clone)]
pub struct RemoteDebugger {
    cmd_tx: mpsc::UnboundedSender<DriverCommand>,
    events: broadcast::Sender<SessionEvent>,
    kind: DebuggerKind,
    normalizer: Arc<dyn ResultNormalizer>,
    settings: DebuggerSettings,
}

impl std::fmt::Debug for RemoteDebugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDebugger")
            .field("kind", &self.kind)
            .field("closed", &self.cmd_tx.is_closed())
            .finish()
    }
}

impl RemoteDebugger {
    /// Connect to a native endpoint and perform the identifier handshake.
    ///
    /// Resolves once the endpoint has reported its connected applications.
    pub async fn connect_native(settings: &DebuggerSettings) -> Result<Self> {
        let target = match &settings.socket_path {
            Some(path) => ConnectTarget::Unix(path.clone()),
            None => ConnectTarget::Tcp {
                host: settings.host.clone(),
                port: settings.port,
            },
        };
        let (client, inbound) = RpcClient::connect(&target, settings.connect_timeout()).await?;
        let debugger = Self::spawn(client, inbound, DebuggerKind::Native, settings);
        debugger.handshake().await?;
        Ok(debugger)
    }

    /// Attach to one WebKit page over its WebSocket.
    pub async fn connect_webkit(settings: &DebuggerSettings, page_id: &str) -> Result<Self> {
        let url = page_socket_url(&settings.host, settings.port, page_id)?;
        let (client, inbound) = RpcClient::connect(
            &ConnectTarget::WebSocket(url.to_string()),
            settings.connect_timeout(),
        )
        .await?;
        let debugger = Self::spawn(client, inbound, DebuggerKind::WebKit, settings);
        debugger.send(DriverCommand::SetTarget {
            app_id: None,
            page_id: Some(page_id.to_string()),
        })?;
        debugger.send(DriverCommand::SetConnected(true))?;
        Ok(debugger)
    }

    /// Drive an already-open connection. Performs no handshake.
    pub fn spawn(
        client: RpcClient,
        inbound: mpsc::Receiver<InboundFrame>,
        kind: DebuggerKind,
        settings: &DebuggerSettings,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut router = MessageRouter::new();
        register_session_handlers(&mut router);

        let driver = Driver {
            client,
            ids: ConnectionIds::generate(),
            router,
            session: SessionState::new(settings, events.clone()),
            next_id: 1,
            kind,
            self_tx: cmd_tx.downgrade(),
            page_load_waiters: Vec::new(),
            page_ready_poll: settings.page_ready_poll(),
            page_load_timeout: settings.page_load_timeout(),
        };
        tokio::spawn(driver.run(inbound, cmd_rx));

        Self {
            cmd_tx,
            events,
            kind,
            normalizer: normalizer_for(kind),
            settings: settings.clone(),
        }
    }

    fn send(&self, cmd: DriverCommand) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| Error::Disconnected)
    }

    async fn handshake(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(DriverCommand::ArmReportSetup)?;
        self.send(DriverCommand::WaitForAppList(tx))?;
        self.send(DriverCommand::Notify(RpcMessage::ReportIdentifier))?;

        let apps = await_with_timeout(rx, self.settings.connect_timeout(), "application list")
            .await?;
        info!("Connected, {} application(s) reported", apps.len());
        self.send(DriverCommand::SetConnected(true))
    }

    pub fn kind(&self) -> DebuggerKind {
        self.kind
    }

    /// Subscribe to page-changed and disconnected events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(DriverCommand::Snapshot(tx))?;
        rx.await.map_err(|_| Error::Disconnected)
    }

    pub async fn is_connected(&self) -> bool {
        self.snapshot().await.map(|s| s.connected).unwrap_or(false)
    }

    pub async fn target_app(&self) -> Result<Option<String>> {
        Ok(self.snapshot().await?.target_app)
    }

    /// Refresh and return the connected applications.
    pub async fn apps(&self) -> Result<Vec<Application>> {
        if self.kind == DebuggerKind::WebKit {
            return Ok(self.snapshot().await?.apps);
        }
        let (tx, rx) = oneshot::channel();
        self.send(DriverCommand::WaitForAppList(tx))?;
        self.send(DriverCommand::Notify(RpcMessage::GetConnectedApplications))?;
        await_with_timeout(rx, self.settings.connect_timeout(), "application list").await
    }

    /// Pages last reported for `app_id`, or `None` before its first listing.
    pub async fn pages(&self, app_id: &str) -> Result<Option<Vec<Page>>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot
            .apps
            .into_iter()
            .find(|app| app.id == app_id)
            .and_then(|app| app.page_array.pages().map(<[Page]>::to_vec)))
    }

    /// Target `app_id` (or the session's current target) and fetch its pages.
    pub async fn select_app(&self, app_id: Option<&str>) -> Result<(String, Vec<Page>)> {
        if self.kind == DebuggerKind::WebKit {
            return Err(Error::protocol("WebKit sessions are bound to a single page"));
        }
        let app_id = match app_id {
            Some(id) => id.to_string(),
            None => self
                .target_app()
                .await?
                .ok_or_else(|| Error::protocol("no application to select"))?,
        };

        self.send(DriverCommand::SetTarget {
            app_id: Some(app_id.clone()),
            page_id: None,
        })?;
        let (tx, rx) = oneshot::channel();
        self.send(DriverCommand::WaitForListing {
            app_id: app_id.clone(),
            tx,
        })?;
        self.send(DriverCommand::Notify(RpcMessage::ForwardGetListing {
            app_id: app_id.clone(),
        }))?;

        let pages = await_with_timeout(rx, self.settings.page_load_timeout(), "page listing").await?;
        debug!("Application '{}' has {} page(s)", app_id, pages.len());
        Ok((app_id, pages))
    }

    /// Attach to `page_id` of the target application and enable page events.
    pub async fn select_page(&self, page_id: &str) -> Result<()> {
        if self.kind == DebuggerKind::Native {
            let app_id = self
                .target_app()
                .await?
                .ok_or_else(|| Error::protocol("select an application before a page"))?;
            self.send(DriverCommand::SetTarget {
                app_id: Some(app_id.clone()),
                page_id: Some(page_id.to_string()),
            })?;
            self.send(DriverCommand::Notify(RpcMessage::ForwardSocketSetup {
                app_id,
                page_id: page_id.to_string(),
            }))?;
        }
        self.request(InspectorCommand::page_enable()).await?;
        info!("Selected page {}", page_id);
        Ok(())
    }

    /// Send an inspector command to the target page and await its response.
    ///
    /// No timeout is applied; wrap the call when one is needed.
    pub async fn request(&self, command: InspectorCommand) -> Result<Value> {
        self.send_command(command, false).await
    }

    /// Evaluate `script` in the target page, returning its value.
    ///
    /// The endpoint's result document is unwrapped once, by the normalizer
    /// for this endpoint flavour.
    pub async fn evaluate(&self, script: &str) -> Result<Value> {
        let document = self
            .send_command(InspectorCommand::evaluate(script), true)
            .await?;
        self.normalizer.convert(document)
    }

    async fn send_command(&self, command: InspectorCommand, raw: bool) -> Result<Value> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(DriverCommand::Request {
            command,
            raw,
            response_tx,
        })?;
        response_rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Navigate the target page and wait for it to finish loading.
    pub async fn navigate_to(&self, url: &str) -> Result<()> {
        info!("Navigating to {}", url);
        let (tx, rx) = oneshot::channel();
        self.send(DriverCommand::WaitForPageLoad(tx))?;
        self.send(DriverCommand::SetNavigating(true))?;

        if let Err(e) = self.request(InspectorCommand::page_navigate(url)).await {
            let _ = self.send(DriverCommand::SetNavigating(false));
            return Err(e);
        }

        let loaded = match tokio::time::timeout(self.settings.page_load_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => Err(Error::timeout(format!("loading {url}"))),
        };
        let _ = self.send(DriverCommand::SetNavigating(false));
        loaded
    }

    /// Wait for the next page load to complete.
    pub async fn wait_for_page_load(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(DriverCommand::WaitForPageLoad(tx))?;
        await_with_timeout(rx, self.settings.page_load_timeout(), "page load").await?
    }

    /// Resolves when the page navigates away unexpectedly.
    pub fn on_page_unload(&self) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.send(DriverCommand::ArmPageUnload(tx))?;
        Ok(rx)
    }

    /// Treat the next frame navigation as expected rather than an unload.
    pub fn allow_navigation_without_reload(&self, allow: bool) -> Result<()> {
        self.send(DriverCommand::AllowNavigationWithoutReload(allow))
    }

    /// Start recording the timeline; records arrive on the returned receiver.
    pub async fn start_timeline(&self) -> Result<mpsc::Receiver<TimelineRecord>> {
        let (tx, rx) = mpsc::channel(TIMELINE_CHANNEL_CAPACITY);
        self.send(DriverCommand::SetTimeline(Some(tx)))?;
        self.request(InspectorCommand::timeline_start()).await?;
        Ok(rx)
    }

    pub async fn stop_timeline(&self) -> Result<()> {
        let result = self.request(InspectorCommand::timeline_stop()).await;
        self.send(DriverCommand::SetTimeline(None))?;
        result.map(|_| ())
    }

    /// Highlight (or stop highlighting) the target web view on the device.
    pub async fn indicate_web_view(&self, enabled: bool) -> Result<()> {
        if self.kind == DebuggerKind::WebKit {
            return Ok(());
        }
        let snapshot = self.snapshot().await?;
        let (Some(app_id), Some(page_id)) = (snapshot.target_app, snapshot.target_page) else {
            return Err(Error::protocol("no target page selected"));
        };
        self.send(DriverCommand::Notify(RpcMessage::ForwardIndicateWebView {
            app_id,
            page_id,
            enabled,
        }))
    }

    /// Close the connection. Pending callers get [`Error::Disconnected`].
    pub fn disconnect(&self) {
        // the driver may already have exited
        let _ = self.send(DriverCommand::Disconnect);
    }
}

/// `ws://<host>:<port>/devtools/page/<id>`
pub fn page_socket_url(host: &str, port: u16, page_id: &str) -> Result<Url> {
    let base = Url::parse(&format!("ws://{host}:{port}/devtools/page/"))
        .map_err(|e| Error::connection(format!("invalid endpoint {host}:{port}: {e}")))?;
    base.join(page_id)
        .map_err(|e| Error::connection(format!("invalid page id '{page_id}': {e}")))
}

async fn await_with_timeout<T>(
    rx: oneshot::Receiver<T>,
    timeout: Duration,
    what: &str,
) -> Result<T> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(Error::Disconnected),
        Err(_) => Err(Error::timeout(format!("waiting for {what}"))),
    }
}

/// Split one reply channel into the success/error continuations of a data
/// registration; whichever runs first answers.
fn responder(tx: oneshot::Sender<Result<Value>>) -> (DataHandler, ErrorHandler) {
    let slot = Arc::new(Mutex::new(Some(tx)));
    let error_slot = Arc::clone(&slot);

    let on_success: DataHandler = Box::new(move |value: Value| {
        if let Some(tx) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(Ok(value));
        }
    });
    let on_error: ErrorHandler = Box::new(move |error: Error| {
        if let Some(tx) = error_slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(Err(error));
        }
    });
    (on_success, on_error)
}

// ---------------------------------------------------------------------------
// Driver task
// ---------------------------------------------------------------------------

struct Driver {
    client: RpcClient,
    ids: ConnectionIds,
    router: MessageRouter<SessionState>,
    session: SessionState,
    next_id: u64,
    kind: DebuggerKind,
    /// Weak so that dropping every handle still stops the driver.
    self_tx: mpsc::WeakUnboundedSender<DriverCommand>,
    page_load_waiters: Vec<oneshot::Sender<Result<()>>>,
    page_ready_poll: Duration,
    page_load_timeout: Duration,
}

impl Driver {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<InboundFrame>,
        mut cmd_rx: mpsc::UnboundedReceiver<DriverCommand>,
    ) {
        self.install_page_load_handler();

        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    let Some(frame) = frame else {
                        info!("Inspector connection closed");
                        break;
                    };
                    self.route(frame);
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(DriverCommand::Disconnect) | None => {
                            debug!("Disconnect requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
            }
        }

        self.teardown();
        debug!("Remote debugger driver exiting");
    }

    fn route(&mut self, frame: InboundFrame) {
        let outcome = match frame {
            InboundFrame::Plist(message) => self.router.route_message(&mut self.session, &message),
            InboundFrame::Text(text) => self
                .router
                .route_data_message(&mut self.session, text.as_bytes()),
        };
        if let RouteOutcome::Anomaly(e) = outcome {
            trace!("Frame dropped: {}", e);
        }

        for work in self.router.take_deferred() {
            tokio::spawn(work);
        }
    }

    fn handle_command(&mut self, cmd: DriverCommand) {
        match cmd {
            DriverCommand::Request {
                command,
                raw,
                response_tx,
            } => self.send_request(command, raw, response_tx),
            DriverCommand::Notify(message) => {
                if let Err(e) = self.client.send_plist(message.to_plist(&self.ids)) {
                    warn!("Failed to send {}: {}", message.selector(), e);
                }
            }
            DriverCommand::WaitForListing { app_id, tx } => {
                self.session.wait_for_listing(app_id, tx);
            }
            DriverCommand::WaitForAppList(tx) => {
                arm_application_list(&mut self.router);
                self.session.wait_for_app_list(tx);
            }
            DriverCommand::WaitForPageLoad(tx) => self.page_load_waiters.push(tx),
            DriverCommand::ArmReportSetup => arm_report_setup(&mut self.router),
            DriverCommand::ArmPageUnload(tx) => {
                let mut tx = Some(tx);
                self.router.register_special_handler(
                    SpecialEvent::PageUnload,
                    Dispatch::OneShot,
                    None,
                    Box::new(move |_session: &mut SessionState, _payload: SpecialPayload| {
                        if let Some(tx) = tx.take() {
                            let _ = tx.send(());
                        }
                    }),
                );
            }
            DriverCommand::SetConnected(connected) => self.session.set_connected(connected),
            DriverCommand::SetNavigating(navigating) => self.session.set_navigating(navigating),
            DriverCommand::AllowNavigationWithoutReload(allow) => {
                self.router.allow_navigation_without_reload(allow)
            }
            DriverCommand::SetTarget { app_id, page_id } => {
                if app_id.is_some() {
                    self.session.set_target_app(app_id);
                }
                self.session.set_target_page(page_id);
            }
            DriverCommand::SetTimeline(Some(tx)) => {
                self.router.set_timeline_handler(Some(Box::new(move |record: Value| {
                    if tx.try_send(TimelineRecord::new(record)).is_err() {
                        warn!("Timeline listener is full or gone, dropping record");
                    }
                })));
            }
            DriverCommand::SetTimeline(None) => self.router.set_timeline_handler(None),
            DriverCommand::Snapshot(tx) => {
                let _ = tx.send(self.session.snapshot());
            }
            DriverCommand::PageReady => {
                debug!("Page is ready");
                self.session.set_navigating(false);
                for tx in self.page_load_waiters.drain(..) {
                    let _ = tx.send(Ok(()));
                }
            }
            DriverCommand::Disconnect => {}
        }
    }

    fn send_request(
        &mut self,
        command: InspectorCommand,
        raw: bool,
        response_tx: oneshot::Sender<Result<Value>>,
    ) {
        let id = self.next_id;
        self.next_id += 1;
        let json = command.to_json(id);

        let sent = match self.kind {
            DebuggerKind::WebKit => self.client.send_text(json),
            DebuggerKind::Native => {
                match (self.session.target_app(), self.session.target_page()) {
                    (Some(app_id), Some(page_id)) => {
                        let message = RpcMessage::ForwardSocketData {
                            app_id: app_id.to_string(),
                            page_id: page_id.to_string(),
                            data: json.into_bytes(),
                        };
                        self.client.send_plist(message.to_plist(&self.ids))
                    }
                    _ => Err(Error::protocol("no target page selected")),
                }
            }
        };

        if let Err(e) = sent {
            let _ = response_tx.send(Err(e));
            return;
        }

        debug!("Sent {} as request {}", command.method, id);
        let (on_success, on_error) = responder(response_tx);
        let registered = if raw {
            self.router
                .register_raw_data_handler(id.to_string(), Some(on_error), on_success)
        } else {
            self.router
                .register_data_handler(id.to_string(), Some(on_error), on_success)
        };
        if let Err(e) = registered {
            warn!("Could not register request {}: {}", id, e);
        }
    }

    /// On `Page.loadEventFired`, poll `document.readyState` off the receive
    /// path and report [`DriverCommand::PageReady`] once complete.
    fn install_page_load_handler(&mut self) {
        let self_tx = self.self_tx.clone();
        let poll = self.page_ready_poll;
        let limit = self.page_load_timeout;

        self.router.set_page_load_handler(Some(Box::new(
            move |_session: &mut SessionState| -> Option<BoxFuture<'static, ()>> {
                let self_tx = self_tx.clone();
                Some(Box::pin(async move {
                    let Some(tx) = self_tx.upgrade() else {
                        return;
                    };
                    let check = wait_until_ready(tx.clone(), poll);
                    if tokio::time::timeout(limit, check).await.is_err() {
                        warn!("Page did not report ready within {:?}", limit);
                    }
                    let _ = tx.send(DriverCommand::PageReady);
                }))
            },
        )));
    }

    fn teardown(&mut self) {
        self.client.disconnect();
        self.router.clear();
        self.session.reset();
        for tx in self.page_load_waiters.drain(..) {
            let _ = tx.send(Err(Error::Disconnected));
        }
    }
}

async fn wait_until_ready(tx: mpsc::UnboundedSender<DriverCommand>, poll: Duration) {
    loop {
        let (response_tx, response_rx) = oneshot::channel();
        let command = InspectorCommand::evaluate("document.readyState");
        if tx
            .send(DriverCommand::Request {
                command,
                raw: false,
                response_tx,
            })
            .is_err()
        {
            return;
        }
        match response_rx.await {
            Ok(Ok(Value::String(state))) if state == "complete" => return,
            Ok(Ok(state)) => trace!("Page readyState is {}", state),
            Ok(Err(Error::Disconnected)) | Err(_) => return,
            Ok(Err(e)) => debug!("readyState check failed: {}", e),
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_responder_answers_once() {
        let (tx, rx) = oneshot::channel();
        let (on_success, on_error) = responder(tx);
        on_error(Error::remote_script("boom"));
        on_success(Value::from(1));
        assert!(matches!(rx.await.unwrap(), Err(Error::RemoteScript { .. })));
    }

    #[test]
    fn test_page_socket_url() {
        let url = page_socket_url("localhost", 27753, "3").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:27753/devtools/page/3");
    }

    #[tokio::test]
    async fn test_await_with_timeout_reports_timeout() {
        let (_tx, rx) = oneshot::channel::<()>();
        let err = await_with_timeout(rx, Duration::from_millis(10), "nothing")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_await_with_timeout_dropped_sender_is_disconnected() {
        let (tx, rx) = oneshot::channel::<()>();
        drop(tx);
        let err = await_with_timeout(rx, Duration::from_secs(1), "nothing")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected));
    }
}
