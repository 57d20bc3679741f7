//! Bounded waits.
//!
//! [`LoadStateWaiter`] gives a page and its nested frames a grace period to
//! reach a usable state. It never fails: single-page applications frequently
//! stay short of a strict load signal while already being interactive, so a
//! timeout here is logged and recorded, not propagated.
//!
//! [`poll_until`] is the polling primitive behind assertions: a probe is
//! re-evaluated on a fixed interval until it holds or the deadline passes.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::driver::{AutomationDriver, LoadTarget, PageHandle};
use crate::result::{ProbeError, ProbeResult};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Default grace period for a load-state settle (3 seconds)
pub const DEFAULT_SETTLE_TIMEOUT_MS: u64 = 3000;

/// Default polling interval (100ms)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

// =============================================================================
// LOAD STATE
// =============================================================================

/// Page load states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    /// Wait for the `load` event to fire
    Load,
    /// Wait for `DOMContentLoaded` event
    #[default]
    DomContentLoaded,
    /// Wait for network to be idle
    NetworkIdle,
}

impl LoadState {
    /// Get the JavaScript event name for this load state
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::DomContentLoaded => "DOMContentLoaded",
            Self::NetworkIdle => "networkidle",
        }
    }

    /// `document.readyState` values at which this state counts as reached
    #[must_use]
    pub const fn ready_states(&self) -> &'static [&'static str] {
        match self {
            Self::DomContentLoaded => &["interactive", "complete"],
            Self::Load | Self::NetworkIdle => &["complete"],
        }
    }
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.event_name())
    }
}

/// When a navigation counts as done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    /// The request was committed; nothing about the response is awaited
    #[default]
    Commit,
    /// `DOMContentLoaded` fired
    DomContentLoaded,
    /// `load` fired
    Load,
    /// Network went idle
    NetworkIdle,
}

impl WaitUntil {
    /// Load state implied by this wait mode, if any
    #[must_use]
    pub const fn load_state(&self) -> Option<LoadState> {
        match self {
            Self::Commit => None,
            Self::DomContentLoaded => Some(LoadState::DomContentLoaded),
            Self::Load => Some(LoadState::Load),
            Self::NetworkIdle => Some(LoadState::NetworkIdle),
        }
    }
}

impl std::fmt::Display for WaitUntil {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.load_state() {
            Some(state) => write!(f, "{state}"),
            None => write!(f, "commit"),
        }
    }
}

// =============================================================================
// SETTLE REPORT
// =============================================================================

/// Outcome of waiting on a single document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum SettleOutcome {
    /// Load state reached
    Reached,
    /// Grace period elapsed first
    TimedOut,
    /// The wait itself errored
    Failed(String),
}

/// What happened while a page settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleReport {
    /// Main document
    pub main: SettleOutcome,
    /// Nested frames, in document order
    pub frames: Vec<SettleOutcome>,
    /// Time spent settling
    pub elapsed: Duration,
}

impl SettleReport {
    /// Whether the main document and every frame reached the state
    #[must_use]
    pub fn is_fully_settled(&self) -> bool {
        self.main == SettleOutcome::Reached
            && self.frames.iter().all(|f| *f == SettleOutcome::Reached)
    }

    /// Number of documents that ran out of time
    #[must_use]
    pub fn timeouts(&self) -> usize {
        std::iter::once(&self.main)
            .chain(self.frames.iter())
            .filter(|o| **o == SettleOutcome::TimedOut)
            .count()
    }
}

// =============================================================================
// LOAD STATE WAITER
// =============================================================================

/// Tolerant, bounded wait for a page to become usable
#[derive(Debug, Clone)]
pub struct LoadStateWaiter {
    state: LoadState,
    timeout: Duration,
    include_frames: bool,
}

impl Default for LoadStateWaiter {
    fn default() -> Self {
        Self {
            state: LoadState::DomContentLoaded,
            timeout: Duration::from_millis(DEFAULT_SETTLE_TIMEOUT_MS),
            include_frames: true,
        }
    }
}

impl LoadStateWaiter {
    /// Wait for `state`, granting each document up to `timeout`
    #[must_use]
    pub const fn new(state: LoadState, timeout: Duration) -> Self {
        Self {
            state,
            timeout,
            include_frames: true,
        }
    }

    /// Whether nested frames are waited on as well
    #[must_use]
    pub const fn with_frames(mut self, include_frames: bool) -> Self {
        self.include_frames = include_frames;
        self
    }

    /// Replace the per-document grace period
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Per-document grace period
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Give `page` and its frames a bounded chance to settle. Never fails.
    pub async fn await_usable<D>(&self, driver: &D, page: PageHandle) -> SettleReport
    where
        D: AutomationDriver + ?Sized,
    {
        let start = Instant::now();
        let main = self.settle(driver, LoadTarget::Page(page)).await;

        let mut frames = Vec::new();
        if self.include_frames {
            let listed = tokio::time::timeout(self.timeout, driver.frames(page)).await;
            match listed {
                Ok(Ok(handles)) => {
                    for frame in handles {
                        frames.push(self.settle(driver, LoadTarget::Frame(frame)).await);
                    }
                }
                Ok(Err(e)) => warn!(%page, error = %e, "could not list frames; skipping frame settle"),
                Err(_) => warn!(%page, "listing frames timed out; skipping frame settle"),
            }
        }

        SettleReport {
            main,
            frames,
            elapsed: start.elapsed(),
        }
    }

    async fn settle<D>(&self, driver: &D, target: LoadTarget) -> SettleOutcome
    where
        D: AutomationDriver + ?Sized,
    {
        let waited = tokio::time::timeout(
            self.timeout,
            driver.wait_for_load_state(target, self.state, self.timeout),
        )
        .await;

        let outcome = match waited {
            Ok(Ok(())) => SettleOutcome::Reached,
            Ok(Err(e)) if e.is_timeout() => SettleOutcome::TimedOut,
            Ok(Err(e)) => SettleOutcome::Failed(e.to_string()),
            Err(_) => SettleOutcome::TimedOut,
        };

        match &outcome {
            SettleOutcome::Reached => debug!(%target, state = %self.state, "load state reached"),
            SettleOutcome::TimedOut => warn!(
                %target,
                state = %self.state,
                timeout_ms = self.timeout.as_millis() as u64,
                "load state not reached; continuing"
            ),
            SettleOutcome::Failed(reason) => {
                warn!(%target, state = %self.state, %reason, "load state wait failed; continuing");
            }
        }
        outcome
    }
}

// =============================================================================
// POLLING
// =============================================================================

/// Options for polling waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Timeout in milliseconds
    pub timeout_ms: u64,
    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_SETTLE_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl WaitOptions {
    /// Create new wait options with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set timeout in milliseconds
    #[must_use]
    pub const fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set polling interval in milliseconds
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    /// Get timeout as Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Get poll interval as Duration
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Result of a successful wait
#[derive(Debug, Clone)]
pub struct WaitResult {
    /// Time spent waiting
    pub elapsed: Duration,
    /// Number of probe evaluations
    pub attempts: u32,
}

/// Re-evaluate `probe` until it yields `true` or the deadline passes.
///
/// Probe errors that implicate the environment end the wait immediately;
/// others are treated as "not yet" and retried. The whole wait, including an
/// in-flight probe, is bounded by `options.timeout()`; on expiry the last
/// non-fatal probe error is discarded and `ProbeError::Timeout` is returned.
pub async fn poll_until<F, Fut>(options: &WaitOptions, mut probe: F) -> ProbeResult<WaitResult>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = ProbeResult<bool>>,
{
    let start = Instant::now();
    let deadline = start + options.timeout();

    let polling = async {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match probe(remaining).await {
                Ok(true) => return Ok(attempts),
                Ok(false) => {}
                Err(e) if e.is_environment() => return Err(e),
                Err(e) => debug!(error = %e, "probe failed; retrying"),
            }
            if Instant::now() + options.poll_interval() >= deadline {
                tokio::time::sleep_until(deadline).await;
                return Err(ProbeError::Timeout {
                    ms: options.timeout_ms,
                });
            }
            tokio::time::sleep(options.poll_interval()).await;
        }
    };

    match tokio::time::timeout_at(deadline, polling).await {
        Ok(Ok(attempts)) => Ok(WaitResult {
            elapsed: start.elapsed(),
            attempts,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProbeError::Timeout {
            ms: options.timeout_ms,
        }),
    }
}

// =============================================================================
// TESTS
// =============================================================================
