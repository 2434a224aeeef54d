//! Application error types with rich context

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Plist codec error: {message}")]
    Plist { message: String },

    // ─────────────────────────────────────────────────────────────
    // Transport/Session Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Remote debugger is not connected")]
    Disconnected,

    #[error("Operation timed out: {message}")]
    Timeout { message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol/RPC Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Protocol anomaly: {message}")]
    Protocol { message: String },

    #[error("Correlation id '{id}' already has a pending handler")]
    DuplicateCorrelation { id: String },

    #[error("Remote script error: {message}")]
    RemoteScript { message: String },

    #[error("Remote command failed: {message}")]
    RemoteCommand { message: String },

    #[error("Response for id '{id}' arrived late or was never requested")]
    LateResponse { id: String },

    // ─────────────────────────────────────────────────────────────
    // Process/Device Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Command '{command}' failed: {stderr}")]
    Process { command: String, stderr: String },

    #[error("Failed to spawn '{command}': {reason}")]
    ProcessSpawn { command: String, reason: String },

    #[error("Developer toolchain not found: {message}")]
    ToolchainNotFound { message: String },

    #[error("HTTP error: {message}")]
    Http { message: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn plist(message: impl Into<String>) -> Self {
        Self::Plist {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn duplicate_correlation(id: impl Into<String>) -> Self {
        Self::DuplicateCorrelation { id: id.into() }
    }

    /// Create a [`Error::RemoteScript`] from the value the remote side threw.
    pub fn remote_script(message: impl Into<String>) -> Self {
        Self::RemoteScript {
            message: message.into(),
        }
    }

    /// Create a [`Error::RemoteCommand`] from an explicit `error` field.
    pub fn remote_command(message: impl Into<String>) -> Self {
        Self::RemoteCommand {
            message: message.into(),
        }
    }

    pub fn late_response(id: impl Into<String>) -> Self {
        Self::LateResponse { id: id.into() }
    }

    pub fn process(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Process {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    pub fn process_spawn(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProcessSpawn {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn toolchain_not_found(message: impl Into<String>) -> Self {
        Self::ToolchainNotFound {
            message: message.into(),
        }
    }

    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Recoverable errors are scoped to a single request or frame; the session
    /// keeps running after them.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Protocol { .. }
                | Error::RemoteScript { .. }
                | Error::RemoteCommand { .. }
                | Error::LateResponse { .. }
                | Error::DuplicateCorrelation { .. }
                | Error::Timeout { .. }
        )
    }

    /// Check if this error ends the debugging session
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Connection { .. } | Error::Disconnected)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions (for use with color-eyre)
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
