//! Session Lifecycle Manager.
//!
//! A [`Session`] owns the engine, one browser, one isolated context and the
//! pages opened in it. Acquisition is all-or-nothing: if any step fails the
//! handles already obtained are torn down before the error is returned.
//! Release runs in reverse acquisition order (context, browser, engine),
//! keeps going past individual failures and reports every handle it could not
//! close as one [`ProbeError::ResourceReleaseFailure`].

use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::browser::BrowserConfig;
use crate::driver::{AutomationDriver, BrowserHandle, ContextHandle, Handle, PageHandle};
use crate::result::{ProbeError, ProbeResult};

/// Upper bound on each individual teardown call
pub const RELEASE_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Exclusively-owned browser session for one scenario run
pub struct Session<D: AutomationDriver> {
    id: Uuid,
    driver: D,
    browser: BrowserHandle,
    context: ContextHandle,
    page: PageHandle,
    released: bool,
}

impl<D: AutomationDriver> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("browser", &self.browser)
            .field("context", &self.context)
            .field("page", &self.page)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<D: AutomationDriver> Session<D> {
    /// Unique id of this session
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The underlying driver
    #[must_use]
    pub const fn driver(&self) -> &D {
        &self.driver
    }

    /// The underlying driver, mutably
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Browser handle
    #[must_use]
    pub const fn browser(&self) -> BrowserHandle {
        self.browser
    }

    /// Context handle
    #[must_use]
    pub const fn context(&self) -> ContextHandle {
        self.context
    }

    /// The page opened at acquisition
    #[must_use]
    pub const fn initial_page(&self) -> PageHandle {
        self.page
    }

    /// Pages of the context, most recent first
    pub async fn pages(&self) -> ProbeResult<Vec<PageHandle>> {
        let mut pages = self.driver.pages(self.context).await?;
        pages.reverse();
        Ok(pages)
    }

    /// The most recently opened page, which interactions and assertions target
    pub async fn active_page(&self) -> ProbeResult<PageHandle> {
        Ok(self.pages().await?.first().copied().unwrap_or(self.page))
    }

    /// Whether the browser behind this session still responds
    pub async fn is_reachable(&self) -> bool {
        self.driver.is_connected().await
    }

    /// Tear the session down: close context, close browser, stop engine.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::ResourceReleaseFailure`] naming every handle
    /// that failed to close. All steps are attempted regardless.
    pub async fn release(mut self) -> ProbeResult<()> {
        self.released = true;
        let result = teardown(
            &mut self.driver,
            Some(self.context),
            Some(self.browser),
            true,
        )
        .await;
        match &result {
            Ok(()) => info!(session = %self.id, "session released"),
            Err(e) => error!(session = %self.id, error = %e, "session release failed"),
        }
        result
    }
}

impl<D: AutomationDriver> Drop for Session<D> {
    fn drop(&mut self) {
        if !self.released {
            error!(
                session = %self.id,
                browser = %self.browser,
                "session dropped without release; browser resources leaked"
            );
        }
    }
}

/// Acquires sessions with a fixed browser configuration
#[derive(Debug, Clone, Default)]
pub struct SessionManager {
    config: BrowserConfig,
}

impl SessionManager {
    /// Manager launching browsers with `config`
    #[must_use]
    pub const fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    /// Browser configuration in use
    #[must_use]
    pub const fn config(&self) -> &BrowserConfig {
        &self.config
    }

    /// Start the engine, launch a browser, open a context and one page.
    ///
    /// # Errors
    ///
    /// Returns the failing step's error after tearing down whatever was
    /// already acquired. If that teardown fails too, returns
    /// [`ProbeError::ResourceReleaseFailure`] mentioning both.
    pub async fn acquire<D: AutomationDriver>(&self, mut driver: D) -> ProbeResult<Session<D>> {
        let id = Uuid::new_v4();
        let mut engine = false;
        let mut browser = None;
        let mut context = None;

        let acquired: ProbeResult<(BrowserHandle, ContextHandle, PageHandle)> = async {
            driver.start().await?;
            engine = true;
            let b = driver.launch(&self.config).await?;
            browser = Some(b);
            let c = driver.new_context(b, self.config.context_timeout()).await?;
            context = Some(c);
            let p = driver.new_page(c).await?;
            Ok((b, c, p))
        }
        .await;

        match acquired {
            Ok((browser, context, page)) => {
                info!(session = %id, %browser, %context, %page, "session acquired");
                Ok(Session {
                    id,
                    driver,
                    browser,
                    context,
                    page,
                    released: false,
                })
            }
            Err(cause) => {
                error!(session = %id, error = %cause, "session acquisition failed; releasing partial session");
                match teardown(&mut driver, context, browser, engine).await {
                    Ok(()) => Err(cause),
                    Err(ProbeError::ResourceReleaseFailure { handles, message }) => {
                        Err(ProbeError::ResourceReleaseFailure {
                            handles,
                            message: format!("{message} (after acquisition failed: {cause})"),
                        })
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }

    /// Run `body` with a freshly acquired session and release it on every
    /// exit path, including a panic inside `body` (re-raised after release).
    ///
    /// A panic takes precedence over a release failure: the release error is
    /// logged and the body's panic is re-raised unchanged.
    ///
    /// # Errors
    ///
    /// Acquisition errors, or [`ProbeError::ResourceReleaseFailure`] if the
    /// session could not be torn down.
    pub async fn with_session<D, T, F>(&self, driver: D, body: F) -> ProbeResult<T>
    where
        D: AutomationDriver,
        F: for<'a> FnOnce(&'a mut Session<D>) -> BoxFuture<'a, T>,
    {
        let mut session = self.acquire(driver).await?;
        let outcome = AssertUnwindSafe(body(&mut session)).catch_unwind().await;
        let released = session.release().await;
        match outcome {
            Ok(value) => released.map(|()| value),
            Err(panic) => {
                if let Err(e) = released {
                    error!(error = %e, "release failed while unwinding; re-raising the body's panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

async fn teardown<D: AutomationDriver + ?Sized>(
    driver: &mut D,
    context: Option<ContextHandle>,
    browser: Option<BrowserHandle>,
    engine: bool,
) -> ProbeResult<()> {
    let mut failed = Vec::new();
    let mut messages = Vec::new();

    let handles = context
        .map(Handle::Context)
        .into_iter()
        .chain(browser.map(Handle::Browser));
    for handle in handles {
        let closed = tokio::time::timeout(RELEASE_STEP_TIMEOUT, driver.close(handle)).await;
        match closed {
            Ok(Ok(())) => debug!(%handle, "closed"),
            Ok(Err(e)) => {
                failed.push(handle.to_string());
                messages.push(e.to_string());
            }
            Err(_) => {
                failed.push(handle.to_string());
                messages.push(format!("close timed out after {}ms", RELEASE_STEP_TIMEOUT.as_millis()));
            }
        }
    }

    if engine {
        match tokio::time::timeout(RELEASE_STEP_TIMEOUT, driver.stop()).await {
            Ok(Ok(())) => debug!("engine stopped"),
            Ok(Err(e)) => {
                failed.push("engine".to_string());
                messages.push(e.to_string());
            }
            Err(_) => {
                failed.push("engine".to_string());
                messages.push(format!("stop timed out after {}ms", RELEASE_STEP_TIMEOUT.as_millis()));
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(ProbeError::ResourceReleaseFailure {
            handles: failed.join(", "),
            message: messages.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MockDriver, MockFailures};

    fn failing(failures: MockFailures) -> MockDriver {
        MockDriver::new().with_failures(failures)
    }

    mod acquire_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_acquire_opens_in_order() {
            let driver = MockDriver::new();
            let session = SessionManager::default()
                .acquire(driver.clone())
                .await
                .unwrap();

            let journal = driver.journal();
            assert_eq!(journal[0], "start");
            assert!(journal[1].starts_with("launch:--window-size=1280,720"));
            assert_eq!(journal[2], "new_context:5000ms");
            assert_eq!(journal[3], "new_page");
            assert_eq!(session.active_page().await.unwrap(), session.initial_page());

            session.release().await.unwrap();
        }

        #[tokio::test(start_paused = true)]
        async fn test_partial_acquire_tears_down_acquired_only() {
            let driver = failing(MockFailures {
                new_context: true,
                ..MockFailures::default()
            });
            let err = SessionManager::default()
                .acquire(driver.clone())
                .await
                .unwrap_err();

            assert!(matches!(err, ProbeError::ContextError { .. }));
            assert!(!driver.was_called("close:context"));
            assert_eq!(driver.count("close:browser"), 1);
            assert_eq!(driver.count("stop"), 1);
            assert_eq!(driver.open_handles(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn test_engine_failure_releases_nothing() {
            let driver = failing(MockFailures {
                start: true,
                ..MockFailures::default()
            });
            let err = SessionManager::default()
                .acquire(driver.clone())
                .await
                .unwrap_err();

            assert!(err.is_environment());
            assert_eq!(driver.journal(), vec!["start"]);
        }

        #[tokio::test(start_paused = true)]
        async fn test_partial_teardown_failure_is_surfaced() {
            let driver = failing(MockFailures {
                new_page: true,
                close_browser: true,
                ..MockFailures::default()
            });
            let err = SessionManager::default()
                .acquire(driver.clone())
                .await
                .unwrap_err();

            match err {
                ProbeError::ResourceReleaseFailure { handles, message } => {
                    assert!(handles.contains("browser#"));
                    assert!(message.contains("acquisition failed"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    mod release_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_release_in_reverse_order() {
            let driver = MockDriver::new();
            let session = SessionManager::default()
                .acquire(driver.clone())
                .await
                .unwrap();
            session.release().await.unwrap();

            let closes: Vec<String> = driver
                .journal()
                .into_iter()
                .filter(|c| c.starts_with("close:") || c == "stop")
                .collect();
            assert!(closes[0].starts_with("close:context#"));
            assert!(closes[1].starts_with("close:browser#"));
            assert_eq!(closes[2], "stop");
            assert_eq!(driver.open_handles(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn test_release_continues_past_failures() {
            let driver = failing(MockFailures {
                close_context: true,
                stop: true,
                ..MockFailures::default()
            });
            let session = SessionManager::default()
                .acquire(driver.clone())
                .await
                .unwrap();
            let err = session.release().await.unwrap_err();

            assert_eq!(driver.count("close:browser"), 1);
            match err {
                ProbeError::ResourceReleaseFailure { handles, .. } => {
                    assert!(handles.contains("context#"));
                    assert!(handles.contains("engine"));
                    assert!(!handles.contains("browser#"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test(start_paused = true)]
        async fn test_release_after_crash_succeeds() {
            let driver = MockDriver::new();
            let session = SessionManager::default()
                .acquire(driver.clone())
                .await
                .unwrap();
            driver.crash();
            assert!(!session.is_reachable().await);
            session.release().await.unwrap();
        }
    }

    mod scoped_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_with_session_releases_after_body() {
            let driver = MockDriver::new();
            let id = SessionManager::default()
                .with_session(driver.clone(), |session| {
                    async move { session.id() }.boxed()
                })
                .await
                .unwrap();

            assert!(!id.is_nil());
            assert_eq!(driver.count("stop"), 1);
            assert_eq!(driver.open_handles(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn test_with_session_releases_on_panic() {
            let driver = MockDriver::new();
            let manager = SessionManager::default();
            let outcome = AssertUnwindSafe(manager.with_session::<_, (), _>(driver.clone(), |_session| {
                async move { panic!("scenario body exploded") }.boxed()
            }))
            .catch_unwind()
            .await;

            assert!(outcome.is_err());
            assert_eq!(driver.count("close:context"), 1);
            assert_eq!(driver.count("stop"), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn test_panic_wins_over_release_failure() {
            let driver = failing(MockFailures {
                close_context: true,
                ..MockFailures::default()
            });
            let manager = SessionManager::default();
            let outcome = AssertUnwindSafe(manager.with_session::<_, (), _>(driver.clone(), |_session| {
                async move { panic!("scenario body exploded") }.boxed()
            }))
            .catch_unwind()
            .await;

            let payload = outcome.unwrap_err();
            assert_eq!(payload.downcast_ref::<&str>(), Some(&"scenario body exploded"));
            assert_eq!(driver.count("close:context"), 1);
            assert_eq!(driver.count("close:browser"), 1);
            assert_eq!(driver.count("stop"), 1);
        }
    }
}
