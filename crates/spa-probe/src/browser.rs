//! Browser launch configuration.
//!
//! Window size, sandboxing and IPC flags live here and are handed to
//! [`SessionManager::acquire`](crate::SessionManager::acquire) instead of being
//! inlined into each scenario.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable consulted by [`BrowserConfig::from_env`]
pub const CHROMIUM_PATH_ENV: &str = "CHROMIUM_PATH";

/// Default per-operation timeout for a fresh browser context (5 seconds)
pub const DEFAULT_CONTEXT_TIMEOUT_MS: u64 = 5000;

/// IPC namespace mode passed to the browser process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcMode {
    /// Let the browser decide
    #[default]
    Default,
    /// Share the host IPC namespace (`--ipc=host`)
    Host,
}

/// Browser configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Run in headless mode
    pub headless: bool,
    /// Viewport width
    pub viewport_width: u32,
    /// Viewport height
    pub viewport_height: u32,
    /// Path to chromium binary (None = auto-detect)
    pub chromium_path: Option<String>,
    /// Sandbox mode (disable for containers)
    pub sandbox: bool,
    /// Avoid `/dev/shm`, which is tiny in most containers
    pub disable_dev_shm: bool,
    /// IPC namespace mode
    pub ipc_mode: IpcMode,
    /// Run renderer and browser in one process
    pub single_process: bool,
    /// Additional raw command-line flags
    pub extra_args: Vec<String>,
    /// Default per-operation timeout applied to the context
    pub context_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            chromium_path: None,
            sandbox: true,
            disable_dev_shm: true,
            ipc_mode: IpcMode::Host,
            single_process: true,
            extra_args: Vec::new(),
            context_timeout_ms: DEFAULT_CONTEXT_TIMEOUT_MS,
        }
    }
}

impl BrowserConfig {
    /// Defaults, with the chromium path taken from `CHROMIUM_PATH` if set
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var(CHROMIUM_PATH_ENV) {
            if !path.trim().is_empty() {
                config.chromium_path = Some(path);
            }
        }
        config
    }

    /// Set viewport dimensions
    #[must_use]
    pub const fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.viewport_width = width;
        self.viewport_height = height;
        self
    }

    /// Set headless mode
    #[must_use]
    pub const fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Set chromium path
    #[must_use]
    pub fn with_chromium_path(mut self, path: impl Into<String>) -> Self {
        self.chromium_path = Some(path.into());
        self
    }

    /// Disable sandbox (for containers/CI)
    #[must_use]
    pub const fn with_no_sandbox(mut self) -> Self {
        self.sandbox = false;
        self
    }

    /// Set IPC mode
    #[must_use]
    pub const fn with_ipc_mode(mut self, mode: IpcMode) -> Self {
        self.ipc_mode = mode;
        self
    }

    /// Toggle single-process mode
    #[must_use]
    pub const fn with_single_process(mut self, enabled: bool) -> Self {
        self.single_process = enabled;
        self
    }

    /// Append a raw browser flag
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Set the context default timeout
    #[must_use]
    pub const fn with_context_timeout(mut self, timeout_ms: u64) -> Self {
        self.context_timeout_ms = timeout_ms;
        self
    }

    /// Context default timeout as Duration
    #[must_use]
    pub const fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms)
    }

    /// Command-line flags implied by this configuration
    #[must_use]
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = vec![format!(
            "--window-size={},{}",
            self.viewport_width, self.viewport_height
        )];
        if self.disable_dev_shm {
            args.push("--disable-dev-shm-usage".to_string());
        }
        if self.ipc_mode == IpcMode::Host {
            args.push("--ipc=host".to_string());
        }
        if self.single_process {
            args.push("--single-process".to_string());
        }
        if !self.sandbox {
            args.push("--no-sandbox".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}
