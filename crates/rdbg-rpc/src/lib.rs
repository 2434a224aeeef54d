//! # rdbg-rpc - Web Inspector RPC
//!
//! Talks to a device's remote debugging endpoint: frames binary plists over
//! the inspector socket (or JSON over a WebKit page socket), routes inbound
//! notifications to typed handlers, correlates responses by id, and keeps the
//! session's view of applications and pages current.
//!
//! Depends on [`rdbg_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Transport
//! - [`RpcClient`] - One duplex connection with background reader/writer tasks
//! - [`PlistCodec`] / [`BinaryPlistCodec`] - Plist encoding behind a trait
//!
//! ### Routing
//! - [`MessageRouter`] - Special and data handler tables
//! - [`Selector`], [`SpecialEvent`], [`Dispatch`] - Inbound vocabulary
//! - [`RpcMessage`], [`InspectorCommand`] - Outbound messages
//!
//! ### Session
//! - [`SessionState`] - Applications, target and navigation state
//! - [`RemoteDebugger`] - Caller-facing handle driving a session
//!
//! ### Normalization
//! - [`ResultNormalizer`] - Native and WebKit result unwrapping

pub mod codec;
pub mod debugger;
pub mod normalizer;
pub mod protocol;
pub mod router;
pub mod session;
pub mod transport;

pub use codec::{BinaryPlistCodec, PlistCodec};
pub use debugger::{page_socket_url, RemoteDebugger};
pub use normalizer::{normalizer_for, Evaluated, NativeNormalizer, ResultNormalizer, WebKitNormalizer};
pub use protocol::{
    ConnectionIds, DataEnvelope, Dispatch, InspectorCommand, RpcMessage, Selector, SpecialEvent,
    SpecialPayload,
};
pub use router::{
    DataHandler, ErrorHandler, MessageRouter, PageLoadHandler, RouteOutcome, RouterContext,
    SpecialHandler, TimelineHandler,
};
pub use session::{register_session_handlers, SessionSnapshot, SessionState};
pub use transport::{ConnectTarget, ConnectionState, Framing, InboundFrame, RpcClient};
