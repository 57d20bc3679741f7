//! Result and error types for spa-probe.

use thiserror::Error;

/// Result type for spa-probe operations
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Errors that can occur while driving a scenario
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Browser executable not found
    #[error("Browser not found. Install Chromium or set CHROMIUM_PATH")]
    BrowserNotFound,

    /// Automation engine could not be started
    #[error("Failed to start automation engine: {message}")]
    EngineStart {
        /// Error message
        message: String,
    },

    /// Browser launch error
    #[error("Failed to launch browser: {message}")]
    BrowserLaunchError {
        /// Error message
        message: String,
    },

    /// Browser context could not be created or used
    #[error("Browser context error: {message}")]
    ContextError {
        /// Error message
        message: String,
    },

    /// Page error
    #[error("Page error: {message}")]
    PageError {
        /// Error message
        message: String,
    },

    /// Navigation error
    #[error("Navigation to {url} failed: {message}")]
    NavigationError {
        /// URL that failed
        url: String,
        /// Error message
        message: String,
    },

    /// A page or frame did not reach the requested load state in time
    #[error("Load state '{state}' not reached within {ms}ms")]
    LoadStateTimeout {
        /// Load state that was awaited
        state: String,
        /// Timeout in milliseconds
        ms: u64,
    },

    /// Operation timed out
    #[error("Operation timed out after {ms}ms")]
    Timeout {
        /// Timeout in milliseconds
        ms: u64,
    },

    /// No element matched the locator
    #[error("No element matches {locator}")]
    ElementNotFound {
        /// Locator that was resolved
        locator: String,
    },

    /// A user interaction could not be performed
    #[error("Interaction with {locator} failed after {attempts} attempt(s): {message}")]
    InteractionFailure {
        /// Locator of the target element
        locator: String,
        /// Attempts made, including retries
        attempts: u32,
        /// Error message from the last attempt
        message: String,
    },

    /// The browser session stopped responding
    #[error("Browser session unreachable: {message}")]
    SessionUnreachable {
        /// Error message
        message: String,
    },

    /// Teardown of one or more session handles failed
    #[error("Failed to release {handles}: {message}")]
    ResourceReleaseFailure {
        /// Handles that could not be released
        handles: String,
        /// Error message
        message: String,
    },

    /// Scenario failed validation
    #[error("Invalid scenario: {message}")]
    InvalidScenario {
        /// Error message
        message: String,
    },

    /// Scenario description could not be parsed
    #[error("Failed to parse scenario: {message}")]
    ScenarioParse {
        /// Error message
        message: String,
    },

    /// Runner configuration could not be parsed
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProbeError {
    /// Whether the error implicates the harness or target availability
    /// rather than the application under test.
    #[must_use]
    pub const fn is_environment(&self) -> bool {
        matches!(
            self,
            Self::BrowserNotFound
                | Self::EngineStart { .. }
                | Self::BrowserLaunchError { .. }
                | Self::ContextError { .. }
                | Self::SessionUnreachable { .. }
                | Self::ResourceReleaseFailure { .. }
        )
    }

    /// Whether the error is a deadline expiry
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::LoadStateTimeout { .. })
    }
}
