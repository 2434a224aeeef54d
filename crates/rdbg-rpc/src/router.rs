//! Message router for inbound inspector traffic.
//!
//! Every inbound plist is dispatched on its `__selector`:
//!
//! - lifecycle selectors go to **special** handlers bound to a
//!   [`SpecialEvent`], each registered as [`Dispatch::OneShot`] or
//!   [`Dispatch::Persistent`];
//! - `_rpc_applicationSentData:` carries a JSON document that is matched to a
//!   **data** handler by correlation id, or recognised as one of a few
//!   uncorrelated protocol notifications.
//!
//! Handlers receive an explicit `&mut C` context instead of capturing shared
//! state. The router never owns session data.
//!
//! Nothing here is fatal to the connection: malformed frames, unknown
//! selectors and late responses are logged and reported as
//! [`RouteOutcome::Anomaly`] or [`RouteOutcome::Ignored`].

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use plist::{Dictionary, Value as PlistValue};
use serde_json::Value;

use rdbg_core::prelude::*;

use crate::protocol::{
    keys, methods, simulator_info_from_dict, DataEnvelope, Dispatch, Selector, SpecialEvent,
    SpecialPayload, ARGUMENT_KEY, SELECTOR_KEY,
};

/// State handlers may consult and mutate while a frame is routed.
pub trait RouterContext {
    /// Whether a page navigation or page load is currently in flight.
    fn navigation_in_progress(&self) -> bool;
}

pub type SpecialHandler<C> = Box<dyn FnMut(&mut C, SpecialPayload) + Send>;
pub type DataHandler = Box<dyn FnOnce(Value) + Send>;
pub type ErrorHandler = Box<dyn FnOnce(Error) + Send>;
pub type TimelineHandler = Box<dyn FnMut(Value) + Send>;
/// Runs when `Page.loadEventFired` arrives; may return follow-up work that
/// must not hold up the receive loop.
pub type PageLoadHandler<C> = Box<dyn FnMut(&mut C) -> Option<BoxFuture<'static, ()>> + Send>;

/// What happened to one inbound message.
#[derive(Debug)]
pub enum RouteOutcome {
    /// A handler ran.
    Delivered,
    /// Noise: no selector, unknown selector, keep-alive, or no handler armed.
    Ignored,
    /// Unexpected content; logged and dropped.
    Anomaly(Error),
}

impl RouteOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, RouteOutcome::Delivered)
    }
}

enum DataSlot {
    Armed {
        on_success: DataHandler,
        on_error: Option<ErrorHandler>,
        /// Hand over `result` as received, without the nested-value unwrap.
        raw: bool,
    },
    /// Fired already. Distinct from absent so repeats are reported.
    Inert,
}

enum SpecialSlot<C> {
    Armed {
        handler: SpecialHandler<C>,
        dispatch: Dispatch,
        on_error: Option<ErrorHandler>,
    },
    Inert,
}

/// Dispatches inbound messages to registered handlers.
pub struct MessageRouter<C> {
    special: HashMap<SpecialEvent, SpecialSlot<C>>,
    data: HashMap<String, DataSlot>,
    timeline: Option<TimelineHandler>,
    page_load: Option<PageLoadHandler<C>>,
    deferred: Vec<BoxFuture<'static, ()>>,
    navigate_without_reload: bool,
}

impl<C> Default for MessageRouter<C> {
    fn default() -> Self {
        Self {
            special: HashMap::new(),
            data: HashMap::new(),
            timeline: None,
            page_load: None,
            deferred: Vec::new(),
            navigate_without_reload: false,
        }
    }
}

impl<C> std::fmt::Debug for MessageRouter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("data", &self.data.len())
            .field("special", &self.special.len())
            .field("navigate_without_reload", &self.navigate_without_reload)
            .finish()
    }
}

impl<C: RouterContext> MessageRouter<C> {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────

    /// Record a one-shot correlation for `id`.
    ///
    /// Fails with [`Error::DuplicateCorrelation`] while an earlier
    /// registration for the same id is still unresolved. An id whose handler
    /// already fired may be registered again.
    pub fn register_data_handler(
        &mut self,
        id: impl Into<String>,
        on_error: Option<ErrorHandler>,
        on_success: DataHandler,
    ) -> Result<()> {
        self.arm_data_slot(id.into(), on_error, on_success, false)
    }

    /// Like [`register_data_handler`](Self::register_data_handler), but the
    /// handler receives the response's whole `result` document so the caller
    /// can apply its own unwrapping.
    pub fn register_raw_data_handler(
        &mut self,
        id: impl Into<String>,
        on_error: Option<ErrorHandler>,
        on_success: DataHandler,
    ) -> Result<()> {
        self.arm_data_slot(id.into(), on_error, on_success, true)
    }

    fn arm_data_slot(
        &mut self,
        id: String,
        on_error: Option<ErrorHandler>,
        on_success: DataHandler,
        raw: bool,
    ) -> Result<()> {
        if matches!(self.data.get(&id), Some(DataSlot::Armed { .. })) {
            return Err(Error::duplicate_correlation(id));
        }
        self.data.insert(
            id,
            DataSlot::Armed {
                on_success,
                on_error,
                raw,
            },
        );
        Ok(())
    }

    /// Bind `handler` to `event`, replacing any previous binding.
    pub fn register_special_handler(
        &mut self,
        event: SpecialEvent,
        dispatch: Dispatch,
        on_error: Option<ErrorHandler>,
        handler: SpecialHandler<C>,
    ) {
        if matches!(self.special.get(&event), Some(SpecialSlot::Armed { .. })) {
            debug!("Replacing armed special handler for {:?}", event);
        }
        self.special.insert(
            event,
            SpecialSlot::Armed {
                handler,
                dispatch,
                on_error,
            },
        );
    }

    pub fn set_timeline_handler(&mut self, handler: Option<TimelineHandler>) {
        self.timeline = handler;
    }

    pub fn set_page_load_handler(&mut self, handler: Option<PageLoadHandler<C>>) {
        self.page_load = handler;
    }

    /// Expect the next frame navigation; it will not count as a page unload.
    pub fn allow_navigation_without_reload(&mut self, allow: bool) {
        self.navigate_without_reload = allow;
    }

    pub fn navigation_without_reload_allowed(&self) -> bool {
        self.navigate_without_reload
    }

    pub fn has_special_handler(&self, event: SpecialEvent) -> bool {
        matches!(self.special.get(&event), Some(SpecialSlot::Armed { .. }))
    }

    /// Number of data registrations still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.data
            .values()
            .filter(|slot| matches!(slot, DataSlot::Armed { .. }))
            .count()
    }

    /// Work deferred by page-load handling, to be driven outside the
    /// receive loop.
    pub fn take_deferred(&mut self) -> Vec<BoxFuture<'static, ()>> {
        std::mem::take(&mut self.deferred)
    }

    /// Drop every registration, persistent ones included.
    ///
    /// Each unresolved data registration and each special registration with
    /// an error continuation is told [`Error::Disconnected`].
    pub fn clear(&mut self) {
        let mut notified = 0usize;
        for (_, slot) in self.data.drain() {
            if let DataSlot::Armed {
                on_error: Some(on_error),
                ..
            } = slot
            {
                on_error(Error::Disconnected);
                notified += 1;
            }
        }
        for (_, slot) in self.special.drain() {
            if let SpecialSlot::Armed {
                on_error: Some(on_error),
                ..
            } = slot
            {
                on_error(Error::Disconnected);
                notified += 1;
            }
        }
        self.timeline = None;
        self.page_load = None;
        self.deferred.clear();
        self.navigate_without_reload = false;
        debug!("Router cleared, {} continuation(s) notified", notified);
    }

    // ─────────────────────────────────────────────────────────
    // Selector-level routing
    // ─────────────────────────────────────────────────────────

    /// Route one inbound plist by its selector.
    pub fn route_message(&mut self, ctx: &mut C, message: &PlistValue) -> RouteOutcome {
        let Some(dict) = message.as_dictionary() else {
            debug!("Got a plist that is not a dictionary, dropping");
            return RouteOutcome::Anomaly(Error::protocol("message is not a dictionary"));
        };

        let Some(selector) = dict.get(SELECTOR_KEY).and_then(PlistValue::as_string) else {
            debug!("Got an invalid plist without a selector, dropping");
            return RouteOutcome::Ignored;
        };

        let selector = Selector::parse(selector);
        if let Selector::Unknown(name) = &selector {
            debug!("No handler for selector '{}', doing nothing", name);
            return RouteOutcome::Ignored;
        }

        let Some(argument) = dict.get(ARGUMENT_KEY).and_then(PlistValue::as_dictionary) else {
            warn!("Selector '{}' arrived without an argument", selector.as_str());
            return RouteOutcome::Anomaly(Error::protocol(format!(
                "{} without {}",
                selector.as_str(),
                ARGUMENT_KEY
            )));
        };

        let payload = match selector {
            Selector::ReportSetup => {
                SpecialPayload::ReportIdentifier(simulator_info_from_dict(argument))
            }
            Selector::ReportConnectedApplicationList => SpecialPayload::ConnectedApplicationList(
                sub_dictionary(argument, keys::APPLICATION_DICTIONARY),
            ),
            Selector::ReportConnectedDriverList => SpecialPayload::ConnectedDriverList(
                sub_dictionary(argument, keys::DRIVER_DICTIONARY),
            ),
            Selector::ApplicationSentListing => {
                let Some(app_id) = argument
                    .get(keys::APPLICATION_ID)
                    .and_then(PlistValue::as_string)
                else {
                    warn!("Listing arrived without an application identifier");
                    return RouteOutcome::Anomaly(Error::protocol(
                        "listing without application identifier",
                    ));
                };
                SpecialPayload::ApplicationListing {
                    app_id: app_id.to_string(),
                    listing: sub_dictionary(argument, keys::LISTING),
                }
            }
            Selector::ApplicationConnected => SpecialPayload::ApplicationConnected(argument.clone()),
            Selector::ApplicationDisconnected => {
                SpecialPayload::ApplicationDisconnected(argument.clone())
            }
            Selector::ApplicationUpdated => SpecialPayload::ApplicationUpdated(argument.clone()),
            Selector::ApplicationSentData => {
                return match argument.get(keys::MESSAGE_DATA) {
                    Some(PlistValue::Data(bytes)) => self.route_data_message(ctx, bytes),
                    Some(PlistValue::String(text)) => {
                        self.route_data_message(ctx, text.as_bytes())
                    }
                    _ => {
                        warn!("Data message without {}", keys::MESSAGE_DATA);
                        RouteOutcome::Anomaly(Error::protocol(format!(
                            "data message without {}",
                            keys::MESSAGE_DATA
                        )))
                    }
                };
            }
            Selector::Unknown(_) => return RouteOutcome::Ignored,
        };

        self.fire_special(ctx, payload)
    }

    /// Invoke the handler bound to the payload's event, disarming one-shot
    /// handlers before they run.
    pub fn fire_special(&mut self, ctx: &mut C, payload: SpecialPayload) -> RouteOutcome {
        let event = payload.event();
        let Some(slot) = self.special.get_mut(&event) else {
            warn!("No special handler registered for {:?}", event);
            return RouteOutcome::Ignored;
        };

        match slot {
            SpecialSlot::Armed {
                handler,
                dispatch: Dispatch::Persistent,
                ..
            } => {
                handler(ctx, payload);
                RouteOutcome::Delivered
            }
            SpecialSlot::Armed {
                dispatch: Dispatch::OneShot,
                ..
            } => {
                let fired = std::mem::replace(slot, SpecialSlot::Inert);
                if let SpecialSlot::Armed { mut handler, .. } = fired {
                    handler(ctx, payload);
                }
                RouteOutcome::Delivered
            }
            SpecialSlot::Inert => {
                warn!("Special handler for {:?} already fired", event);
                RouteOutcome::Ignored
            }
        }
    }

    // ─────────────────────────────────────────────────────────
    // Data channel
    // ─────────────────────────────────────────────────────────

    /// Route one JSON data document.
    pub fn route_data_message(&mut self, ctx: &mut C, bytes: &[u8]) -> RouteOutcome {
        let envelope = match DataEnvelope::parse(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Unparseable data message ({} bytes): {}", bytes.len(), e);
                return RouteOutcome::Anomaly(Error::protocol(format!(
                    "unparseable data message: {e}"
                )));
            }
        };

        let id = envelope.correlation_id();

        // a thrown result is an error even without an `error` field
        let error = envelope
            .thrown_message()
            .map(Error::remote_script)
            .or_else(|| envelope.error_message().map(Error::remote_command));

        if let Some(error) = error {
            return self.deliver_error(id, error);
        }

        match envelope.method.as_deref() {
            Some(methods::PROFILER_RESET_PROFILES) => {
                debug!("Device asked to reset profiles");
                return RouteOutcome::Delivered;
            }
            Some(methods::PAGE_FRAME_NAVIGATED) => return self.on_frame_navigated(ctx),
            Some(methods::PAGE_LOAD_EVENT_FIRED) => return self.on_load_event_fired(ctx),
            Some(methods::TIMELINE_EVENT_RECORDED) => {
                let record = envelope
                    .params
                    .as_ref()
                    .and_then(|params| params.get("record"))
                    .cloned()
                    .unwrap_or(Value::Null);
                return match self.timeline.as_mut() {
                    Some(handler) => {
                        handler(record);
                        RouteOutcome::Delivered
                    }
                    None => {
                        debug!("Timeline record with no timeline listener");
                        RouteOutcome::Ignored
                    }
                };
            }
            _ => {}
        }

        let Some(id) = id else {
            if envelope.result.is_none() && envelope.method.is_none() {
                debug!("Got a blank data response from debugger");
                return RouteOutcome::Ignored;
            }
            debug!(
                "Uncorrelated data message ignored: method={:?}",
                envelope.method
            );
            return RouteOutcome::Ignored;
        };

        match self.data.get_mut(&id) {
            Some(slot @ DataSlot::Armed { .. }) => {
                let fired = std::mem::replace(slot, DataSlot::Inert);
                if let DataSlot::Armed {
                    on_success, raw, ..
                } = fired
                {
                    debug!("Found data handler for response {}", id);
                    let result = if raw {
                        envelope.result.unwrap_or(Value::Null)
                    } else {
                        unwrap_result_value(envelope.result)
                    };
                    on_success(result);
                }
                RouteOutcome::Delivered
            }
            Some(DataSlot::Inert) => {
                warn!("Debugger returned data for message {} but its handler already ran", id);
                RouteOutcome::Anomaly(Error::late_response(id))
            }
            None => {
                warn!(
                    "Debugger returned data for message {} but nothing was waiting for it",
                    id
                );
                RouteOutcome::Anomaly(Error::late_response(id))
            }
        }
    }

    fn deliver_error(&mut self, id: Option<String>, error: Error) -> RouteOutcome {
        let Some(id) = id else {
            error!("Error data message without an id: {}", error);
            return RouteOutcome::Anomaly(error);
        };

        match self.data.get_mut(&id) {
            Some(slot @ DataSlot::Armed { .. }) => {
                let fired = std::mem::replace(slot, DataSlot::Inert);
                match fired {
                    DataSlot::Armed {
                        on_error: Some(on_error),
                        ..
                    } => {
                        on_error(error);
                        RouteOutcome::Delivered
                    }
                    _ => {
                        error!("Error for message {} with no error handler: {}", id, error);
                        RouteOutcome::Anomaly(error)
                    }
                }
            }
            Some(DataSlot::Inert) => {
                warn!("Error for message {} arrived after its handler ran: {}", id, error);
                RouteOutcome::Anomaly(Error::late_response(id))
            }
            None => {
                error!("Error for message {} with no error handler: {}", id, error);
                RouteOutcome::Anomaly(error)
            }
        }
    }

    fn on_frame_navigated(&mut self, ctx: &mut C) -> RouteOutcome {
        if self.navigate_without_reload || ctx.navigation_in_progress() {
            debug!("Frame navigated but we were warned about it, page state kept");
            self.navigate_without_reload = false;
            return RouteOutcome::Ignored;
        }

        debug!("Frame navigated, unloading page");
        match self.special.insert(SpecialEvent::PageUnload, SpecialSlot::Inert) {
            Some(SpecialSlot::Armed { mut handler, .. }) => {
                handler(ctx, SpecialPayload::PageUnload);
                RouteOutcome::Delivered
            }
            _ => {
                debug!("No page unload handler armed");
                RouteOutcome::Ignored
            }
        }
    }

    fn on_load_event_fired(&mut self, ctx: &mut C) -> RouteOutcome {
        let Some(handler) = self.page_load.as_mut() else {
            debug!("Page load event with no page load handler");
            return RouteOutcome::Ignored;
        };
        if let Some(work) = handler(ctx) {
            self.deferred.push(work);
        }
        RouteOutcome::Delivered
    }
}

fn sub_dictionary(argument: &Dictionary, key: &str) -> Dictionary {
    argument
        .get(key)
        .and_then(PlistValue::as_dictionary)
        .cloned()
        .unwrap_or_default()
}

/// `result.result.value` when present, else the whole `result`.
fn unwrap_result_value(result: Option<Value>) -> Value {
    let result = result.unwrap_or(Value::Null);
    match result.get("result").and_then(|inner| inner.get("value")) {
        Some(value) if !value.is_null() => value.clone(),
        _ => result,
    }
}
