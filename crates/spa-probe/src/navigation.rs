//! Navigation Fallback Controller.
//!
//! A scenario reaches its target view through an ordered ladder of recovery
//! actions. Every step is executed, in order, exactly once; a step that
//! fails or times out is recorded and the ladder moves on. The page left
//! behind by the final step is the one carried forward. Only losing the
//! browser session aborts the ladder.
//!
//! ```text
//!   goto /dashboard ─► settle ─► goto / ─► settle ─► goto /?_r=1 ─► ... ─► ActivePage
//!        │                         │                    │
//!        └── Committed/Failed/TimedOut recorded per step in the NavigationTrace
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::driver::{AutomationDriver, PageHandle};
use crate::locator::{Locator, Selector};
use crate::result::ProbeResult;
use crate::session::Session;
use crate::wait::{LoadStateWaiter, SettleReport, WaitUntil};

/// Default per-step navigation timeout (10 seconds)
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 10_000;

const LOOPBACK_HOST: &str = "localhost";
const LOOPBACK_ADDR: &str = "127.0.0.1";
const CACHE_BUST_PARAM: &str = "_r";

fn default_step_timeout_ms() -> u64 {
    DEFAULT_STEP_TIMEOUT_MS
}

// =============================================================================
// STEPS
// =============================================================================

/// What a ladder step does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum NavigationAction {
    /// Navigate to a URL
    Goto {
        /// Target URL
        url: String,
    },
    /// Reload the current document
    Reload,
    /// Click a control that triggers navigation (e.g. an error page's reload button)
    Click {
        /// Control to click
        locator: Selector,
        /// Which match to click
        #[serde(default)]
        nth: usize,
    },
}

/// One rung of the fallback ladder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationStep {
    /// Action to perform
    #[serde(flatten)]
    pub action: NavigationAction,
    /// When the action counts as issued
    #[serde(default)]
    pub wait_until: WaitUntil,
    /// Bound on the action itself
    #[serde(default = "default_step_timeout_ms")]
    pub timeout_ms: u64,
    /// Grace period for the page to settle afterwards; `None` uses the
    /// controller's default, `Some(0)` skips settling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settle_ms: Option<u64>,
    /// Optional human-readable label used in traces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl NavigationStep {
    fn with_action(action: NavigationAction) -> Self {
        Self {
            action,
            wait_until: WaitUntil::Commit,
            timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            settle_ms: None,
            label: None,
        }
    }

    /// Navigate to `url`
    #[must_use]
    pub fn goto(url: impl Into<String>) -> Self {
        Self::with_action(NavigationAction::Goto { url: url.into() })
    }

    /// Reload whatever is currently loaded
    #[must_use]
    pub fn reload() -> Self {
        Self::with_action(NavigationAction::Reload)
    }

    /// Click a navigation control
    #[must_use]
    pub fn click_control(locator: Selector) -> Self {
        Self::with_action(NavigationAction::Click { locator, nth: 0 })
    }

    /// Navigate to `url` with a cache-busting query parameter
    #[must_use]
    pub fn cache_busted(url: &str, n: u32) -> Self {
        Self::goto(cache_bust(url, n))
    }

    /// Navigate to `url` with `localhost` replaced by the loopback address
    #[must_use]
    pub fn loopback(url: &str) -> Self {
        Self::goto(to_loopback(url))
    }

    /// Set the commit condition
    #[must_use]
    pub const fn with_wait_until(mut self, wait_until: WaitUntil) -> Self {
        self.wait_until = wait_until;
        self
    }

    /// Set the action timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the settle grace period
    #[must_use]
    pub const fn with_settle(mut self, settle_ms: u64) -> Self {
        self.settle_ms = Some(settle_ms);
        self
    }

    /// Label the step
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Action timeout as Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Explicit settle grace period, if any
    #[must_use]
    pub fn settle(&self) -> Option<Duration> {
        self.settle_ms.map(Duration::from_millis)
    }
}

impl fmt::Display for NavigationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(label) = &self.label {
            return write!(f, "{label}");
        }
        match &self.action {
            NavigationAction::Goto { url } => write!(f, "goto {url}"),
            NavigationAction::Reload => write!(f, "reload"),
            NavigationAction::Click { locator, nth } => {
                write!(f, "click {}", Locator::new(locator.clone()).nth(*nth))
            }
        }
    }
}

/// Append `_r=n`, keeping any fragment at the end
#[must_use]
pub fn cache_bust(url: &str, n: u32) -> String {
    let (base, fragment) = match url.find('#') {
        Some(i) => url.split_at(i),
        None => (url, ""),
    };
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{CACHE_BUST_PARAM}={n}{fragment}")
}

/// Replace a `localhost` host with `127.0.0.1`; other URLs are returned unchanged
#[must_use]
pub fn to_loopback(url: &str) -> String {
    let Some(scheme_end) = url.find("://").map(|i| i + 3) else {
        return url.to_string();
    };
    let rest = &url[scheme_end..];
    let host_end = rest
        .find(|c: char| matches!(c, '/' | ':' | '?' | '#'))
        .unwrap_or(rest.len());
    if rest[..host_end].eq_ignore_ascii_case(LOOPBACK_HOST) {
        format!("{}{LOOPBACK_ADDR}{}", &url[..scheme_end], &rest[host_end..])
    } else {
        url.to_string()
    }
}

// =============================================================================
// LADDER
// =============================================================================

/// Builder for ordered navigation ladders
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackLadder {
    steps: Vec<NavigationStep>,
}

impl FallbackLadder {
    /// Empty ladder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical recovery ladder for a single-page application:
    /// direct route, root, cache-busted root, loopback route, cache-busted
    /// loopback route.
    #[must_use]
    pub fn standard(base: &str, route: &str) -> Self {
        let base = base.trim_end_matches('/');
        let route = if route.starts_with('/') {
            route.to_string()
        } else {
            format!("/{route}")
        };
        let direct = format!("{base}{route}");
        let root = format!("{base}/");
        let loopback = to_loopback(&direct);

        Self::new()
            .then(NavigationStep::goto(direct))
            .then(NavigationStep::goto(root.clone()))
            .then(NavigationStep::cache_busted(&root, 1))
            .then(NavigationStep::goto(loopback.clone()))
            .then(NavigationStep::cache_busted(&loopback, 2))
    }

    /// Append a step
    #[must_use]
    pub fn then(mut self, step: NavigationStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a click on the browser error page's reload control
    #[must_use]
    pub fn with_reload_control(self, control: Selector) -> Self {
        self.then(NavigationStep::click_control(control).with_label("click reload control"))
    }

    /// Steps in order
    #[must_use]
    pub fn steps(&self) -> &[NavigationStep] {
        &self.steps
    }

    /// Consume into the step list
    #[must_use]
    pub fn into_steps(self) -> Vec<NavigationStep> {
        self.steps
    }
}

// =============================================================================
// TRACE
// =============================================================================

/// How a single step's action ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum StepOutcome {
    /// Navigation was issued
    Committed,
    /// The action errored; the ladder continued
    Failed(String),
    /// The action ran out of time; the ladder continued
    TimedOut,
}

/// Record of one executed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Position in the ladder
    pub index: usize,
    /// Human-readable step description
    pub description: String,
    /// Action outcome
    pub outcome: StepOutcome,
    /// Settle outcome, if settling ran
    pub settle: Option<SettleReport>,
    /// Time spent on the step including settle
    pub elapsed: Duration,
}

/// Every step executed by one `resolve` call, in order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationTrace {
    /// Step records
    pub steps: Vec<StepRecord>,
}

impl NavigationTrace {
    /// Number of steps executed
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no step ran
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step descriptions in execution order
    #[must_use]
    pub fn descriptions(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.description.as_str()).collect()
    }

    /// Number of steps whose action committed
    #[must_use]
    pub fn committed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Committed)
            .count()
    }
}

/// The page left behind by the ladder
#[derive(Debug, Clone)]
pub struct ActivePage {
    /// Most recently opened page of the session
    pub page: PageHandle,
    /// Its URL after the final step
    pub url: String,
    /// What happened on the way
    pub trace: NavigationTrace,
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Executes navigation ladders
#[derive(Debug, Clone, Default)]
pub struct NavigationController {
    waiter: LoadStateWaiter,
}

impl NavigationController {
    /// Controller settling pages with `waiter`; a step's explicit
    /// `settle_ms` overrides the waiter's timeout.
    #[must_use]
    pub const fn new(waiter: LoadStateWaiter) -> Self {
        Self { waiter }
    }

    /// Run every step in order and return the final page.
    ///
    /// # Errors
    ///
    /// Only environment errors (the session stopped responding) are
    /// returned; every other step failure is recorded and absorbed.
    pub async fn resolve<D: AutomationDriver>(
        &self,
        session: &mut Session<D>,
        steps: &[NavigationStep],
    ) -> ProbeResult<ActivePage> {
        let mut trace = NavigationTrace::default();

        for (index, step) in steps.iter().enumerate() {
            let started = Instant::now();
            let page = session.active_page().await?;
            let description = step.to_string();
            debug!(index, step = %description, %page, "navigation step");

            let acted = tokio::time::timeout(
                step.timeout(),
                perform(session.driver_mut(), page, step),
            )
            .await;
            let outcome = match acted {
                Ok(Ok(())) => StepOutcome::Committed,
                Ok(Err(e)) if e.is_environment() => {
                    warn!(index, step = %description, error = %e, "session lost; aborting navigation");
                    return Err(e);
                }
                Ok(Err(e)) if e.is_timeout() => StepOutcome::TimedOut,
                Ok(Err(e)) => StepOutcome::Failed(e.to_string()),
                Err(_) => StepOutcome::TimedOut,
            };
            match &outcome {
                StepOutcome::Committed => {}
                StepOutcome::TimedOut => {
                    warn!(index, step = %description, timeout_ms = step.timeout_ms, "navigation step timed out; continuing");
                }
                StepOutcome::Failed(reason) => {
                    warn!(index, step = %description, %reason, "navigation step failed; continuing");
                }
            }

            let grace = step.settle().unwrap_or_else(|| self.waiter.timeout());
            let settle = if grace.is_zero() {
                None
            } else {
                let page = session.active_page().await?;
                let waiter = self.waiter.clone().with_timeout(grace);
                Some(waiter.await_usable(session.driver(), page).await)
            };

            trace.steps.push(StepRecord {
                index,
                description,
                outcome,
                settle,
                elapsed: started.elapsed(),
            });
        }

        let page = session.active_page().await?;
        let url = match session.driver().current_url(page).await {
            Ok(url) => url,
            Err(e) if e.is_environment() => return Err(e),
            Err(_) => String::new(),
        };
        info!(
            %page,
            %url,
            steps = trace.len(),
            committed = trace.committed(),
            "navigation ladder finished"
        );
        Ok(ActivePage { page, url, trace })
    }
}

async fn perform<D: AutomationDriver + ?Sized>(
    driver: &mut D,
    page: PageHandle,
    step: &NavigationStep,
) -> ProbeResult<()> {
    match &step.action {
        NavigationAction::Goto { url } => {
            driver
                .goto(page, url, step.wait_until, step.timeout())
                .await
        }
        NavigationAction::Reload => driver.reload(page, step.wait_until, step.timeout()).await,
        NavigationAction::Click { locator, nth } => {
            let locator = Locator::new(locator.clone()).nth(*nth);
            let element = driver.locate(page, &locator).await?;
            driver.click(&element, step.timeout()).await
        }
    }
}
