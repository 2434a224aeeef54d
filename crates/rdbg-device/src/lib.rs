//! # rdbg-device - Device Tooling
//!
//! External collaborators of a debugging session, kept behind trait seams so
//! they can be scripted in tests.
//!
//! Depends on [`rdbg_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Processes
//! - [`ProcessRunner`] - Run a command to completion, failing with its stderr
//! - [`TokioProcessRunner`] - Implementation on `tokio::process`
//!
//! ### Simulators
//! - [`Simctl`] - `xcrun simctl` subcommands
//! - [`SimDevice`] - One entry of `simctl list devices`
//!
//! ### Toolchain
//! - [`toolchain::developer_dir()`] / [`toolchain::version()`] - Memoized Xcode lookups
//!
//! ### Page listing
//! - [`PageListFetcher`] / [`HttpPageListFetcher`] - `GET /json` for WebKit endpoints

pub mod page_list;
pub mod process;
pub mod simctl;
pub mod toolchain;

pub use page_list::{HttpPageListFetcher, PageEntry, PageListFetcher};
pub use process::{ProcessOutput, ProcessRunner, RunOptions, TokioProcessRunner};
pub use simctl::{child_env, parse_device_list, DeviceList, SimDevice, Simctl};
