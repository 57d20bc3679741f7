//! Scenario Runner.
//!
//! ```text
//! run(scenario)
//!   └─ acquire session ──────────────────────────────── environment-failure on error
//!        ├─ [scenario deadline]
//!        │    ├─ navigation ladder      (session loss → environment-failure)
//!        │    ├─ interactions, in order (first failure → verdict, rest skipped)
//!        │    └─ verification           (pass / assertion-failure / environment-failure)
//!        ├─ hold_after
//!        └─ release session ─────────────────────────── Err(ResourceReleaseFailure) on error
//! ```
//!
//! Each run gets its own driver from a [`DriverFactory`], so no two
//! scenarios ever share a session.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::browser::BrowserConfig;
use crate::driver::AutomationDriver;
use crate::interaction::interact;
use crate::navigation::{NavigationController, NavigationTrace};
use crate::result::{ProbeError, ProbeResult};
use crate::scenario::Scenario;
use crate::session::{Session, SessionManager};
use crate::verify::{VerificationEngine, Verdict};
use crate::wait::{LoadState, LoadStateWaiter, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SETTLE_TIMEOUT_MS};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Runner configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Browser launch configuration
    pub browser: BrowserConfig,
    /// Load state awaited after each navigation step
    pub settle_state: LoadState,
    /// Default settle grace period per document
    pub settle_timeout_ms: u64,
    /// Whether nested frames are settled too
    pub settle_frames: bool,
    /// Assertion polling interval
    pub poll_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            browser: BrowserConfig::default(),
            settle_state: LoadState::DomContentLoaded,
            settle_timeout_ms: DEFAULT_SETTLE_TIMEOUT_MS,
            settle_frames: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl RunnerConfig {
    /// Parse from YAML; missing keys take their defaults
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidConfig`] if the YAML is malformed.
    pub fn from_yaml(yaml: &str) -> ProbeResult<Self> {
        serde_yaml_ng::from_str(yaml).map_err(|e| ProbeError::InvalidConfig {
            message: e.to_string(),
        })
    }

    /// Load from a YAML file
    ///
    /// # Errors
    ///
    /// I/O or parse errors.
    pub fn load(path: impl AsRef<Path>) -> ProbeResult<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Set browser configuration
    #[must_use]
    pub fn with_browser(mut self, browser: BrowserConfig) -> Self {
        self.browser = browser;
        self
    }

    /// Set the load state awaited after navigation
    #[must_use]
    pub const fn with_settle_state(mut self, state: LoadState) -> Self {
        self.settle_state = state;
        self
    }

    /// Set the default settle grace period
    #[must_use]
    pub const fn with_settle_timeout(mut self, timeout_ms: u64) -> Self {
        self.settle_timeout_ms = timeout_ms;
        self
    }

    /// Toggle frame settling
    #[must_use]
    pub const fn with_settle_frames(mut self, enabled: bool) -> Self {
        self.settle_frames = enabled;
        self
    }

    /// Set the assertion polling interval
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    /// Load-state waiter implied by this configuration
    #[must_use]
    pub const fn waiter(&self) -> LoadStateWaiter {
        LoadStateWaiter::new(self.settle_state, Duration::from_millis(self.settle_timeout_ms))
            .with_frames(self.settle_frames)
    }
}

// =============================================================================
// REPORT
// =============================================================================

/// Outcome of one scenario run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Scenario that ran
    pub scenario_id: String,
    /// Session used, if one was acquired
    pub session_id: Option<Uuid>,
    /// Terminal verdict
    pub verdict: Verdict,
    /// Navigation ladder trace (empty if the ladder did not finish)
    pub navigation: NavigationTrace,
    /// Interactions performed successfully
    pub interactions_completed: usize,
    /// Wall time including acquisition and release
    pub duration: Duration,
}

impl RunReport {
    /// Whether the scenario passed
    #[must_use]
    pub const fn is_pass(&self) -> bool {
        self.verdict.is_pass()
    }

    /// Pretty-printed JSON
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Json`] if serialization fails.
    pub fn to_json(&self) -> ProbeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// =============================================================================
// RUNNER
// =============================================================================

/// Produces a fresh driver for every run
pub trait DriverFactory: Send + Sync {
    /// Driver type produced
    type Driver: AutomationDriver;

    /// Create a driver for one run
    fn create(&self) -> Self::Driver;
}

impl<F, D> DriverFactory for F
where
    F: Fn() -> D + Send + Sync,
    D: AutomationDriver,
{
    type Driver = D;

    fn create(&self) -> D {
        self()
    }
}

#[derive(Debug, Default)]
struct Progress {
    navigation: NavigationTrace,
    interactions_completed: usize,
}

struct BodyOutcome {
    session_id: Uuid,
    verdict: Verdict,
    progress: Progress,
}

/// Runs scenarios, one exclusively-owned session each
#[derive(Debug, Clone)]
pub struct ScenarioRunner<F> {
    factory: F,
    config: RunnerConfig,
}

impl<F: DriverFactory> ScenarioRunner<F> {
    /// Runner creating drivers with `factory` and default configuration
    #[must_use]
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            config: RunnerConfig::default(),
        }
    }

    /// Replace the configuration
    #[must_use]
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `scenario` to a verdict.
    ///
    /// Application and harness failures are reported through
    /// [`RunReport::verdict`].
    ///
    /// # Errors
    ///
    /// Only [`ProbeError::ResourceReleaseFailure`]: the session (or a
    /// partially acquired one) could not be torn down.
    pub async fn run(&self, scenario: &Scenario) -> ProbeResult<RunReport> {
        let span = info_span!(
            "scenario",
            id = %scenario.id(),
            session = tracing::field::Empty
        );
        self.run_inner(scenario).instrument(span).await
    }

    async fn run_inner(&self, scenario: &Scenario) -> ProbeResult<RunReport> {
        let started = Instant::now();
        info!(
            steps = scenario.navigation().len(),
            interactions = scenario.interactions().len(),
            "scenario started"
        );

        let manager = SessionManager::new(self.config.browser.clone());
        let controller = NavigationController::new(self.config.waiter());
        let engine = VerificationEngine::new(Duration::from_millis(self.config.poll_interval_ms));
        let owned = scenario.clone();

        let scoped = manager
            .with_session(self.factory.create(), move |session| {
                async move {
                    tracing::Span::current().record("session", tracing::field::display(session.id()));
                    let mut progress = Progress::default();
                    let body = execute(session, &owned, &controller, &engine, &mut progress);
                    let verdict = match tokio::time::timeout(owned.timeout(), body).await {
                        Ok(verdict) => verdict,
                        Err(_) => Verdict::EnvironmentFailure(format!(
                            "scenario exceeded its {} ms deadline",
                            owned.timeout().as_millis()
                        )),
                    };
                    if !owned.hold_after().is_zero() {
                        tokio::time::sleep(owned.hold_after()).await;
                    }
                    BodyOutcome {
                        session_id: session.id(),
                        verdict,
                        progress,
                    }
                }
                .boxed()
            })
            .await;

        let (session_id, verdict, progress) = match scoped {
            Ok(outcome) => (Some(outcome.session_id), outcome.verdict, outcome.progress),
            Err(e @ ProbeError::ResourceReleaseFailure { .. }) => {
                warn!(error = %e, "scenario aborted: browser resources could not be released");
                return Err(e);
            }
            Err(e) => (
                None,
                Verdict::EnvironmentFailure(format!("could not acquire browser session: {e}")),
                Progress::default(),
            ),
        };

        info!(verdict = %verdict, "scenario finished");
        Ok(RunReport {
            scenario_id: scenario.id().to_string(),
            session_id,
            verdict,
            navigation: progress.navigation,
            interactions_completed: progress.interactions_completed,
            duration: started.elapsed(),
        })
    }
}

async fn execute<D: AutomationDriver>(
    session: &mut Session<D>,
    scenario: &Scenario,
    controller: &NavigationController,
    engine: &VerificationEngine,
    progress: &mut Progress,
) -> Verdict {
    let active = match controller.resolve(session, scenario.navigation()).await {
        Ok(active) => active,
        Err(e) => {
            return Verdict::EnvironmentFailure(format!("browser session lost during navigation: {e}"))
        }
    };
    progress.navigation = active.trace;

    for (index, step) in scenario.interactions().iter().enumerate() {
        let page = match session.active_page().await {
            Ok(page) => page,
            Err(e) => return Verdict::EnvironmentFailure(format!("browser session lost: {e}")),
        };
        match interact(session.driver_mut(), page, step).await {
            Ok(_) => progress.interactions_completed += 1,
            Err(e) if e.is_environment() => {
                return Verdict::EnvironmentFailure(format!(
                    "browser session lost during interaction {index} ({step}): {e}"
                ));
            }
            Err(e) => {
                if !session.is_reachable().await {
                    return Verdict::EnvironmentFailure(format!(
                        "browser session unreachable after interaction {index} ({step}) failed: {e}"
                    ));
                }
                return Verdict::AssertionFailure(format!("interaction {index} ({step}) failed: {e}"));
            }
        }
    }

    let page = match session.active_page().await {
        Ok(page) => page,
        Err(e) => return Verdict::EnvironmentFailure(format!("browser session lost: {e}")),
    };
    engine.verify(session.driver(), page, scenario.assertion()).await
}
