//! Interaction Retry Layer.
//!
//! Unlike load-state waits, interactions are meaningful user actions: when
//! one cannot be performed within its budget the failure is surfaced as
//! [`ProbeError::InteractionFailure`] and never tolerated.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::driver::{AutomationDriver, PageHandle};
use crate::locator::{Locator, Selector};
use crate::result::{ProbeError, ProbeResult};

/// Default action timeout (5 seconds)
pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 5000;

/// Default number of retries after the first failed attempt
pub const DEFAULT_RETRIES: u32 = 1;

fn default_action_timeout_ms() -> u64 {
    DEFAULT_ACTION_TIMEOUT_MS
}

const fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

/// Action performed on the located element
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ActionKind {
    /// Activate the element
    #[default]
    Click,
    /// Replace the element's value
    Fill {
        /// Text to enter
        text: String,
    },
}

/// One user interaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionStep {
    /// Element to act on
    pub locator: Selector,
    /// Which match to act on
    #[serde(default)]
    pub nth: usize,
    /// What to do
    #[serde(default)]
    pub action: ActionKind,
    /// Bound on each attempt
    #[serde(default = "default_action_timeout_ms")]
    pub timeout_ms: u64,
    /// Settle interval before each attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_wait_ms: Option<u64>,
    /// Retries after the first failed attempt
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl InteractionStep {
    /// Click `locator`
    #[must_use]
    pub const fn click(locator: Selector) -> Self {
        Self {
            locator,
            nth: 0,
            action: ActionKind::Click,
            timeout_ms: DEFAULT_ACTION_TIMEOUT_MS,
            pre_wait_ms: None,
            retries: DEFAULT_RETRIES,
        }
    }

    /// Type `text` into `locator`
    #[must_use]
    pub fn fill(locator: Selector, text: impl Into<String>) -> Self {
        Self {
            action: ActionKind::Fill { text: text.into() },
            ..Self::click(locator)
        }
    }

    /// Act on the `n`th match
    #[must_use]
    pub const fn with_nth(mut self, n: usize) -> Self {
        self.nth = n;
        self
    }

    /// Set per-attempt timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Wait before each attempt
    #[must_use]
    pub const fn with_pre_wait(mut self, pre_wait_ms: u64) -> Self {
        self.pre_wait_ms = Some(pre_wait_ms);
        self
    }

    /// Set the retry budget
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Narrowed locator
    #[must_use]
    pub fn target(&self) -> Locator {
        Locator::new(self.locator.clone()).nth(self.nth)
    }

    /// Per-attempt timeout as Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl fmt::Display for InteractionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            ActionKind::Click => write!(f, "click {}", self.target()),
            ActionKind::Fill { .. } => write!(f, "fill {}", self.target()),
        }
    }
}

/// A performed interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteractionReport {
    /// Attempts used, including the successful one
    pub attempts: u32,
    /// Time spent including pre-waits
    pub elapsed: Duration,
}

/// Perform `step` on `page`: pre-wait, locate, act. A failed attempt is
/// retried up to `step.retries` times.
///
/// # Errors
///
/// - Environment errors are returned as-is, without retrying.
/// - Otherwise, once the budget is spent, [`ProbeError::InteractionFailure`]
///   carrying the last attempt's error.
pub async fn interact<D: AutomationDriver + ?Sized>(
    driver: &mut D,
    page: PageHandle,
    step: &InteractionStep,
) -> ProbeResult<InteractionReport> {
    let started = Instant::now();
    let budget = step.retries.saturating_add(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        if let Some(ms) = step.pre_wait_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        let performed = tokio::time::timeout(step.timeout(), act(driver, page, step))
            .await
            .unwrap_or(Err(ProbeError::Timeout {
                ms: step.timeout_ms,
            }));

        match performed {
            Ok(()) => {
                debug!(interaction = %step, attempt, "interaction performed");
                return Ok(InteractionReport {
                    attempts: attempt,
                    elapsed: started.elapsed(),
                });
            }
            Err(e) if e.is_environment() => return Err(e),
            Err(e) if attempt >= budget => {
                return Err(ProbeError::InteractionFailure {
                    locator: step.target().to_string(),
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
            Err(e) => warn!(interaction = %step, attempt, error = %e, "interaction failed; retrying"),
        }
    }
}

async fn act<D: AutomationDriver + ?Sized>(
    driver: &mut D,
    page: PageHandle,
    step: &InteractionStep,
) -> ProbeResult<()> {
    let element = driver.locate(page, &step.target()).await?;
    match &step.action {
        ActionKind::Click => driver.click(&element, step.timeout()).await,
        ActionKind::Fill { text } => driver.fill(&element, text, step.timeout()).await,
    }
}
