//! # rdbg-core - Core Domain Types
//!
//! Foundation crate for rdbg. Provides domain types, error handling, event
//! definitions, settings loading, and logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, chrono, thiserror, toml, tracing).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`Application`] - A remote application known to the session
//! - [`Page`] - An inspectable page within an application
//! - [`PageArray`] - A page listing, or the pending placeholder before the first listing
//! - [`DebuggerKind`] - Native (plist) or WebKit (HTTP/JSON) endpoint
//!
//! ### Events (`events`)
//! - [`SessionEvent`] - `PageChanged` / `Disconnected` lifecycle events
//! - [`TimelineRecord`] - Forwarded timeline record
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ### Settings (`config`)
//! - [`load_settings()`] - Read `.rdbg/config.toml`, falling back to defaults
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use rdbg_core::prelude::*;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod prelude;
pub mod types;

// Re-export commonly used types at crate root for convenience
pub use config::{
    load_settings, save_settings, DebuggerSettings, Settings, SimctlSettings, TargetFallback,
};
pub use error::{Error, Result, ResultExt};
pub use events::{SessionEvent, TimelineRecord};
pub use types::{
    parse_platform_version, strip_app_id_prefix, Application, DebuggerKind, Page, PageArray,
    SimulatorInfo,
};
