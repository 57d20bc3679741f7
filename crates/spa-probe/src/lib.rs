//! spa-probe: resilient end-to-end verification for single-page applications
//!
//! Each scenario gets an exclusively owned browser session, walks a
//! fallback navigation ladder, performs a few retried interactions and ends
//! with one of three verdicts: `pass`, `assertion-failure` (the application
//! misbehaved) or `environment-failure` (the harness or target was
//! unavailable).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        ScenarioRunner                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌─────────────┐  ┌────────┐ │
//! │  │ Navigation   │─►│ Interaction  │─►│ Verification│─►│ Verdict│ │
//! │  │ Controller   │  │ Retry Layer  │  │ Engine      │  │        │ │
//! │  └──────┬───────┘  └──────────────┘  └─────────────┘  └────────┘ │
//! │         │ LoadStateWaiter                                        │
//! │  ┌──────┴─────────────────────────────────────────────────────┐  │
//! │  │ SessionManager: engine → browser → context → page          │  │
//! │  └──────┬─────────────────────────────────────────────────────┘  │
//! └─────────┼────────────────────────────────────────────────────────┘
//!           ▼
//!   AutomationDriver  (ChromiumDriver with `browser` feature, MockDriver)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use spa_probe::prelude::*;
//!
//! # async fn demo() -> ProbeResult<()> {
//! let scenario = Scenario::builder("login")
//!     .ladder(FallbackLadder::standard("http://localhost:3000", "/dashboard"))
//!     .interact(InteractionStep::click(Selector::text("Sign in")).with_pre_wait(3000))
//!     .assertion(Assertion::visible_text("User Dashboard"))
//!     .build()?;
//!
//! let runner = ScenarioRunner::new(MockDriver::new);
//! let report = runner.run(&scenario).await?;
//! println!("{}", report.verdict);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod browser;
#[cfg(feature = "browser")]
mod cdp;
mod driver;
mod interaction;
mod locator;
pub mod logging;
mod navigation;
mod result;
mod runner;
mod scenario;
mod session;
mod verify;
mod wait;

pub use browser::{BrowserConfig, IpcMode, CHROMIUM_PATH_ENV, DEFAULT_CONTEXT_TIMEOUT_MS};
#[cfg(feature = "browser")]
pub use cdp::ChromiumDriver;
pub use driver::{
    AutomationDriver, BrowserHandle, ContextHandle, ElementHandle, FrameHandle, Handle,
    LoadTarget, MockDriver, MockFailures, MockPage, PageHandle,
};
pub use interaction::{
    interact, ActionKind, InteractionReport, InteractionStep, DEFAULT_ACTION_TIMEOUT_MS,
    DEFAULT_RETRIES,
};
pub use locator::{Locator, Selector};
pub use logging::{init_tracing, LogFormat};
pub use navigation::{
    cache_bust, to_loopback, ActivePage, FallbackLadder, NavigationAction, NavigationController,
    NavigationStep, NavigationTrace, StepOutcome, StepRecord, DEFAULT_STEP_TIMEOUT_MS,
};
pub use result::{ProbeError, ProbeResult};
pub use runner::{DriverFactory, RunReport, RunnerConfig, ScenarioRunner};
pub use scenario::{Scenario, ScenarioBuilder, DEFAULT_SCENARIO_TIMEOUT_MS};
pub use session::{Session, SessionManager, RELEASE_STEP_TIMEOUT};
pub use verify::{Assertion, Condition, Verdict, VerificationEngine, DEFAULT_ASSERTION_TIMEOUT_MS};
pub use wait::{
    poll_until, LoadState, LoadStateWaiter, SettleOutcome, SettleReport, WaitOptions, WaitResult,
    WaitUntil, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SETTLE_TIMEOUT_MS,
};

/// Prelude for convenient imports
pub mod prelude {
    #[cfg(feature = "browser")]
    pub use super::cdp::ChromiumDriver;
    pub use super::{
        AutomationDriver, Assertion, BrowserConfig, FallbackLadder, InteractionStep, LoadState,
        MockDriver, MockPage, NavigationStep, ProbeError, ProbeResult, RunReport, RunnerConfig,
        Scenario, ScenarioRunner, Selector, SessionManager, Verdict, WaitUntil,
    };
}
