//! Verification Engine and verdicts.
//!
//! The terminal assertion is polled until it holds or its deadline passes.
//! A miss is then classified from what the polls saw: if the page answered
//! at least one lookup, the application did not reach the expected state
//! (`assertion-failure`); otherwise the harness lost the application
//! (`environment-failure`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::driver::{AutomationDriver, PageHandle};
use crate::locator::{Locator, Selector};
use crate::result::ProbeError;
use crate::wait::{poll_until, WaitOptions, DEFAULT_POLL_INTERVAL_MS};

/// Default assertion deadline (3 seconds)
pub const DEFAULT_ASSERTION_TIMEOUT_MS: u64 = 3000;

fn default_assertion_timeout_ms() -> u64 {
    DEFAULT_ASSERTION_TIMEOUT_MS
}

// =============================================================================
// ASSERTION
// =============================================================================

/// What must become visible
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Some element containing this text
    VisibleText(String),
    /// An element matching this locator
    VisibleElement(Selector),
}

impl Condition {
    /// Locator that checks the condition
    #[must_use]
    pub fn locator(&self) -> Locator {
        match self {
            Self::VisibleText(text) => Locator::new(Selector::text(text.clone())),
            Self::VisibleElement(selector) => Locator::new(selector.clone()),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VisibleText(text) => write!(f, "text `{text}`"),
            Self::VisibleElement(selector) => write!(f, "element `{selector}`"),
        }
    }
}

/// The terminal expectation of a scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    /// Expected-visible condition
    #[serde(flatten)]
    pub condition: Condition,
    /// Deadline in milliseconds
    #[serde(default = "default_assertion_timeout_ms")]
    pub timeout_ms: u64,
    /// Expected end state in words, used in the failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Assertion {
    /// Expect `text` to become visible
    #[must_use]
    pub fn visible_text(text: impl Into<String>) -> Self {
        Self {
            condition: Condition::VisibleText(text.into()),
            timeout_ms: DEFAULT_ASSERTION_TIMEOUT_MS,
            description: None,
        }
    }

    /// Expect an element matching `selector` to become visible
    #[must_use]
    pub const fn visible_element(selector: Selector) -> Self {
        Self {
            condition: Condition::VisibleElement(selector),
            timeout_ms: DEFAULT_ASSERTION_TIMEOUT_MS,
            description: None,
        }
    }

    /// Set the deadline
    #[must_use]
    pub const fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Describe the expected end state
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Deadline as Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reason reported when the condition is not observed in time
    #[must_use]
    pub fn failure_reason(&self) -> String {
        match &self.description {
            Some(description) => format!("{description}; not observed"),
            None => format!(
                "expected {} to be visible within {} ms; not observed",
                self.condition, self.timeout_ms
            ),
        }
    }
}

// =============================================================================
// VERDICT
// =============================================================================

/// Terminal outcome of one scenario run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum Verdict {
    /// The expected state was observed
    Pass,
    /// The application did not reach the expected state
    AssertionFailure(String),
    /// The harness could not reach the application
    EnvironmentFailure(String),
}

impl Verdict {
    /// Whether the scenario passed
    #[must_use]
    pub const fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    /// Whether the failure implicates the harness or target availability
    #[must_use]
    pub const fn is_environment_failure(&self) -> bool {
        matches!(self, Self::EnvironmentFailure(_))
    }

    /// Failure reason, if any
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Pass => None,
            Self::AssertionFailure(r) | Self::EnvironmentFailure(r) => Some(r),
        }
    }

    /// Short label: `pass`, `assertion-failure` or `environment-failure`
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::AssertionFailure(_) => "assertion-failure",
            Self::EnvironmentFailure(_) => "environment-failure",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {reason}", self.label()),
            None => write!(f, "{}", self.label()),
        }
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Polls assertions and classifies misses
#[derive(Debug, Clone, Copy)]
pub struct VerificationEngine {
    poll_interval: Duration,
}

impl Default for VerificationEngine {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl VerificationEngine {
    /// Engine polling every `poll_interval`
    #[must_use]
    pub const fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Polling interval
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Poll `assertion` on `page` until it holds or its deadline passes.
    ///
    /// Nothing runs past the deadline. A miss is an assertion failure when
    /// some lookup got an answer from the page before the deadline, and an
    /// environment failure when none did.
    pub async fn verify<D: AutomationDriver + ?Sized>(
        &self,
        driver: &D,
        page: PageHandle,
        assertion: &Assertion,
    ) -> Verdict {
        let locator = assertion.condition.locator();
        let options = WaitOptions::new()
            .with_timeout(assertion.timeout_ms)
            .with_poll_interval(self.poll_interval.as_millis() as u64);

        let answered = AtomicBool::new(false);
        let polled = poll_until(&options, |remaining| {
            let locator = &locator;
            let answered = &answered;
            async move {
                let looked_up = async {
                    let element = driver.locate(page, locator).await?;
                    driver.is_visible(&element, remaining).await
                }
                .await;
                if !matches!(&looked_up, Err(e) if e.is_environment()) {
                    answered.store(true, Ordering::Relaxed);
                }
                looked_up
            }
        })
        .await;

        let verdict = match polled {
            Ok(result) => {
                debug!(condition = %assertion.condition, attempts = result.attempts, "assertion held");
                Verdict::Pass
            }
            Err(e) if e.is_environment() => Verdict::EnvironmentFailure(unreachable_reason(assertion, &e)),
            Err(_) if answered.load(Ordering::Relaxed) => {
                Verdict::AssertionFailure(assertion.failure_reason())
            }
            Err(e) => Verdict::EnvironmentFailure(unreachable_reason(assertion, &e)),
        };

        match &verdict {
            Verdict::Pass => info!(condition = %assertion.condition, "verification passed"),
            other => warn!(condition = %assertion.condition, verdict = %other, "verification failed"),
        }
        verdict
    }
}

fn unreachable_reason(assertion: &Assertion, cause: &ProbeError) -> String {
    format!(
        "browser session unreachable while waiting for {}: {cause}",
        assertion.condition
    )
}
