//! Chromium implementation of [`AutomationDriver`] over CDP.
//!
//! Contexts map to CDP browser contexts; pages are targets created inside
//! them, plus any the application opens itself (popups, `target=_blank`).
//! Load states and element actions are observed by evaluating small
//! scripts in the page, so no DOM node ids are held across re-renders.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig as CdpConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::page::{EventFrameNavigated, NavigateParams, ReloadParams};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams, GetTargetsParams,
    TargetId,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page as CdpPage;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::browser::BrowserConfig;
use crate::driver::{
    AutomationDriver, BrowserHandle, ContextHandle, ElementHandle, FrameHandle, Handle,
    LoadTarget, PageHandle,
};
use crate::locator::Locator;
use crate::result::{ProbeError, ProbeResult};
use crate::wait::{LoadState, WaitUntil, DEFAULT_POLL_INTERVAL_MS};

const FRAME_SELECTOR: &str = "iframe, frame";

struct LaunchedBrowser {
    handle: BrowserHandle,
    inner: Mutex<CdpBrowser>,
    handler: tokio::task::JoinHandle<()>,
}

struct OpenPage {
    handle: PageHandle,
    context: ContextHandle,
    inner: CdpPage,
}

/// Chromium driver (requires the `browser` feature)
#[derive(Default)]
pub struct ChromiumDriver {
    started: bool,
    next_id: AtomicU64,
    browser: Option<LaunchedBrowser>,
    contexts: HashMap<ContextHandle, BrowserContextId>,
    /// Registration order is open order; never held across an await
    pages: std::sync::Mutex<Vec<OpenPage>>,
}

impl std::fmt::Debug for ChromiumDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromiumDriver")
            .field("started", &self.started)
            .field("browser", &self.browser.as_ref().map(|b| b.handle))
            .field("contexts", &self.contexts.len())
            .field("pages", &self.open_pages().len())
            .finish()
    }
}

impl ChromiumDriver {
    /// Create a driver; nothing is launched until [`AutomationDriver::launch`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mint(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn open_pages(&self) -> MutexGuard<'_, Vec<OpenPage>> {
        self.pages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, context: ContextHandle, inner: CdpPage) -> PageHandle {
        let handle = PageHandle(self.mint());
        self.open_pages().push(OpenPage {
            handle,
            context,
            inner,
        });
        handle
    }

    fn launched(&self) -> ProbeResult<&LaunchedBrowser> {
        self.browser
            .as_ref()
            .ok_or_else(|| ProbeError::SessionUnreachable {
                message: "no browser launched".to_string(),
            })
    }

    fn page(&self, page: PageHandle) -> ProbeResult<CdpPage> {
        self.open_pages()
            .iter()
            .find(|p| p.handle == page)
            .map(|p| p.inner.clone())
            .ok_or_else(|| ProbeError::PageError {
                message: format!("{page} is closed"),
            })
    }

    async fn eval<T: serde::de::DeserializeOwned>(
        &self,
        page: PageHandle,
        script: String,
    ) -> ProbeResult<T> {
        let result = self.page(page)?.evaluate(script).await.map_err(page_error)?;
        result.into_value().map_err(|e| ProbeError::PageError {
            message: e.to_string(),
        })
    }

    /// Re-run an element script until it evaluates to `true`; `false`
    /// means nothing matched `locator`
    async fn eval_until_true(
        &self,
        page: PageHandle,
        locator: &Locator,
        script: &str,
        timeout: Duration,
    ) -> ProbeResult<()> {
        let poll = Duration::from_millis(DEFAULT_POLL_INTERVAL_MS);
        let deadline = Instant::now() + timeout;
        loop {
            if self.eval::<bool>(page, script.to_string()).await? {
                return Ok(());
            }
            if Instant::now() + poll >= deadline {
                return Err(ProbeError::ElementNotFound {
                    locator: locator.to_string(),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Issue a navigation and return once the main frame commits.
    ///
    /// The command reply alone is not enough: chromiumoxide holds
    /// `Page.navigate` replies until the load event, so the main frame's
    /// `frameNavigated` is raced against it.
    async fn commit<F>(target: &CdpPage, issue: F) -> ProbeResult<Option<String>>
    where
        F: std::future::Future<Output = ProbeResult<Option<String>>>,
    {
        let mut navigated = target
            .event_listener::<EventFrameNavigated>()
            .await
            .map_err(page_error)?;
        let committed = async {
            while let Some(event) = navigated.next().await {
                let frame = &event.frame;
                match main_frame_commit(frame.parent_id.is_some(), frame.unreachable_url.as_deref()) {
                    Some(Commit::Committed) => return Ok(None),
                    Some(Commit::ErrorPage(reason)) => return Ok(Some(reason)),
                    None => {}
                }
            }
            Err(ProbeError::SessionUnreachable {
                message: "page event stream closed".to_string(),
            })
        };
        tokio::pin!(issue);
        tokio::pin!(committed);
        tokio::select! {
            issued = &mut issue => match issued? {
                Some(error_text) => Ok(Some(error_text)),
                None => committed.await,
            },
            seen = &mut committed => seen,
        }
    }

    async fn bounded<T>(
        timeout: Duration,
        fut: impl std::future::Future<Output = ProbeResult<T>>,
    ) -> ProbeResult<T> {
        tokio::time::timeout(timeout, fut)
            .await
            .unwrap_or(Err(ProbeError::Timeout {
                ms: timeout.as_millis() as u64,
            }))
    }
}

/// What a `frameNavigated` event says about the page
#[derive(Debug, Clone, PartialEq, Eq)]
enum Commit {
    Committed,
    ErrorPage(String),
}

/// Child-frame navigations say nothing about the page and yield `None`
fn main_frame_commit(is_child_frame: bool, unreachable_url: Option<&str>) -> Option<Commit> {
    if is_child_frame {
        return None;
    }
    Some(match unreachable_url {
        Some(url) => Commit::ErrorPage(format!("{url} is unreachable")),
        None => Commit::Committed,
    })
}

fn kill_outcome(browser: BrowserHandle, killed: Option<std::io::Result<()>>) -> ProbeResult<()> {
    match killed {
        Some(Err(e)) => Err(ProbeError::ResourceReleaseFailure {
            handles: browser.to_string(),
            message: format!("kill failed: {e}"),
        }),
        Some(Ok(())) | None => Ok(()),
    }
}

fn is_disconnect(e: &CdpError) -> bool {
    matches!(
        e,
        CdpError::Ws(_) | CdpError::NoResponse | CdpError::ChannelSendError(_)
    )
}

fn page_error(e: CdpError) -> ProbeError {
    if is_disconnect(&e) {
        ProbeError::SessionUnreachable {
            message: e.to_string(),
        }
    } else {
        ProbeError::PageError {
            message: e.to_string(),
        }
    }
}

fn ready_state_script(target: LoadTarget) -> String {
    match target {
        LoadTarget::Page(_) => "document.readyState".to_string(),
        // Cross-origin frames expose no document; they report `null` and count as ready.
        LoadTarget::Frame(frame) => format!(
            "(() => {{ const f = document.querySelectorAll('{FRAME_SELECTOR}')[{}]; \
             if (!f) return 'complete'; \
             try {{ return f.contentDocument ? f.contentDocument.readyState : null; }} \
             catch (_) {{ return null; }} }})()",
            frame.index
        ),
    }
}

#[async_trait]
impl AutomationDriver for ChromiumDriver {
    async fn start(&mut self) -> ProbeResult<()> {
        // The CDP connection is owned by the launched browser; nothing to spawn yet.
        self.started = true;
        Ok(())
    }

    async fn launch(&mut self, config: &BrowserConfig) -> ProbeResult<BrowserHandle> {
        if !self.started {
            return Err(ProbeError::EngineStart {
                message: "driver not started".to_string(),
            });
        }

        let mut builder = CdpConfig::builder()
            .viewport(None)
            .request_timeout(config.context_timeout())
            .args(config.launch_args());

        if !config.headless {
            builder = builder.with_head();
        }

        if let Some(ref path) = config.chromium_path {
            if !Path::new(path).exists() {
                warn!(%path, "configured chromium executable does not exist");
                return Err(ProbeError::BrowserNotFound);
            }
            builder = builder.chrome_executable(path);
        }

        // Without a configured path, build only fails when detection finds nothing.
        let cdp_config = builder.build().map_err(|message| {
            if config.chromium_path.is_none() {
                debug!(%message, "chromium executable detection failed");
                ProbeError::BrowserNotFound
            } else {
                ProbeError::BrowserLaunchError { message }
            }
        })?;

        let (browser, mut handler) = CdpBrowser::launch(cdp_config).await.map_err(|e| {
            ProbeError::BrowserLaunchError {
                message: e.to_string(),
            }
        })?;

        let handler = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        let handle = BrowserHandle(self.mint());
        self.browser = Some(LaunchedBrowser {
            handle,
            inner: Mutex::new(browser),
            handler,
        });
        debug!(%handle, "chromium launched");
        Ok(handle)
    }

    async fn new_context(
        &mut self,
        browser: BrowserHandle,
        default_timeout: Duration,
    ) -> ProbeResult<ContextHandle> {
        let launched = self.launched()?;
        if launched.handle != browser {
            return Err(ProbeError::ContextError {
                message: format!("{browser} is not running"),
            });
        }
        let created = Self::bounded(default_timeout, async {
            launched
                .inner
                .lock()
                .await
                .execute(CreateBrowserContextParams::default())
                .await
                .map_err(|e| ProbeError::ContextError {
                    message: e.to_string(),
                })
        })
        .await?;

        let handle = ContextHandle(self.mint());
        self.contexts
            .insert(handle, created.result.browser_context_id.clone());
        Ok(handle)
    }

    async fn new_page(&mut self, context: ContextHandle) -> ProbeResult<PageHandle> {
        let context_id = self
            .contexts
            .get(&context)
            .cloned()
            .ok_or_else(|| ProbeError::ContextError {
                message: format!("{context} is closed"),
            })?;
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id)
            .build()
            .map_err(|message| ProbeError::PageError { message })?;

        let inner = self
            .launched()?
            .inner
            .lock()
            .await
            .new_page(params)
            .await
            .map_err(page_error)?;

        Ok(self.register(context, inner))
    }

    async fn pages(&self, context: ContextHandle) -> ProbeResult<Vec<PageHandle>> {
        let Some(context_id) = self.contexts.get(&context) else {
            return Ok(Vec::new());
        };
        let browser = self.launched()?.inner.lock().await;
        let live: Vec<TargetId> = browser
            .execute(GetTargetsParams::default())
            .await
            .map_err(page_error)?
            .result
            .target_infos
            .into_iter()
            .filter(|t| t.r#type == "page" && t.browser_context_id.as_ref() == Some(context_id))
            .map(|t| t.target_id)
            .collect();

        for target in &live {
            let known = self
                .open_pages()
                .iter()
                .any(|p| p.inner.target_id() == target);
            if known {
                continue;
            }
            match browser.get_page(target.clone()).await {
                Ok(inner) => {
                    let handle = self.register(context, inner);
                    debug!(%context, page = %handle, "adopted page opened by the application");
                }
                Err(e) => debug!(?target, error = %e, "target not attached yet; skipping"),
            }
        }
        drop(browser);

        let mut pages = self.open_pages();
        pages.retain(|p| p.context != context || live.contains(p.inner.target_id()));
        Ok(pages
            .iter()
            .filter(|p| p.context == context)
            .map(|p| p.handle)
            .collect())
    }

    async fn goto(
        &mut self,
        page: PageHandle,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> ProbeResult<()> {
        let target = self.page(page)?;
        let nav_error = |message: String| ProbeError::NavigationError {
            url: url.to_string(),
            message,
        };

        Self::bounded(timeout, async {
            if wait_until == WaitUntil::Commit {
                let issue = async {
                    let response = target
                        .execute(NavigateParams::new(url))
                        .await
                        .map_err(page_error)?;
                    Ok::<_, ProbeError>(response.result.error_text.clone())
                };
                if let Some(text) = Self::commit(&target, issue).await? {
                    return Err(nav_error(text));
                }
            } else {
                target.goto(url).await.map_err(|e| {
                    if is_disconnect(&e) {
                        page_error(e)
                    } else {
                        nav_error(e.to_string())
                    }
                })?;
            }
            Ok(())
        })
        .await
    }

    async fn reload(
        &mut self,
        page: PageHandle,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> ProbeResult<()> {
        let target = self.page(page)?;
        Self::bounded(timeout, async {
            if wait_until == WaitUntil::Commit {
                let issue = async {
                    target
                        .execute(ReloadParams::default())
                        .await
                        .map_err(page_error)?;
                    Ok::<Option<String>, ProbeError>(None)
                };
                if let Some(reason) = Self::commit(&target, issue).await? {
                    return Err(ProbeError::PageError { message: reason });
                }
            } else {
                target.reload().await.map_err(page_error)?;
            }
            Ok(())
        })
        .await
    }

    async fn current_url(&self, page: PageHandle) -> ProbeResult<String> {
        let url = self.page(page)?.url().await.map_err(page_error)?;
        Ok(url.unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn frames(&self, page: PageHandle) -> ProbeResult<Vec<FrameHandle>> {
        let count: usize = self
            .eval(
                page,
                format!("document.querySelectorAll('{FRAME_SELECTOR}').length"),
            )
            .await?;
        Ok((0..count).map(|index| FrameHandle { page, index }).collect())
    }

    async fn wait_for_load_state(
        &self,
        target: LoadTarget,
        state: LoadState,
        timeout: Duration,
    ) -> ProbeResult<()> {
        let page = match target {
            LoadTarget::Page(p) => p,
            LoadTarget::Frame(f) => f.page,
        };
        let script = ready_state_script(target);
        let deadline = Instant::now() + timeout;
        loop {
            let ready: Option<String> = self.eval(page, script.clone()).await?;
            match ready {
                None => return Ok(()),
                Some(r) if state.ready_states().contains(&r.as_str()) => return Ok(()),
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(ProbeError::LoadStateTimeout {
                    state: state.to_string(),
                    ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)).await;
        }
    }

    async fn locate(&self, page: PageHandle, locator: &Locator) -> ProbeResult<ElementHandle> {
        self.page(page)?;
        Ok(ElementHandle {
            page,
            locator: locator.clone(),
        })
    }

    async fn click(&mut self, element: &ElementHandle, timeout: Duration) -> ProbeResult<()> {
        let script = element.locator.click_script();
        Self::bounded(
            timeout,
            self.eval_until_true(element.page, &element.locator, &script, timeout),
        )
        .await
    }

    async fn fill(
        &mut self,
        element: &ElementHandle,
        text: &str,
        timeout: Duration,
    ) -> ProbeResult<()> {
        let script = element.locator.fill_script(text);
        Self::bounded(
            timeout,
            self.eval_until_true(element.page, &element.locator, &script, timeout),
        )
        .await
    }

    async fn is_visible(&self, element: &ElementHandle, timeout: Duration) -> ProbeResult<bool> {
        let script = element.locator.visibility_script();
        Self::bounded(timeout.max(Duration::from_millis(1)), async {
            self.eval::<bool>(element.page, script).await
        })
        .await
    }

    async fn is_connected(&self) -> bool {
        let Ok(launched) = self.launched() else {
            return false;
        };
        let browser = launched.inner.lock().await;
        browser.version().await.is_ok()
    }

    async fn close(&mut self, handle: Handle) -> ProbeResult<()> {
        match handle {
            Handle::Page(page) => {
                let open = {
                    let mut pages = self.open_pages();
                    let index = pages
                        .iter()
                        .position(|p| p.handle == page)
                        .ok_or_else(|| ProbeError::PageError {
                            message: format!("{page} is closed"),
                        })?;
                    pages.remove(index)
                };
                open.inner.close().await.map_err(page_error)?;
            }
            Handle::Context(context) => {
                self.open_pages().retain(|p| p.context != context);
                let Some(id) = self.contexts.remove(&context) else {
                    return Ok(());
                };
                let Ok(launched) = self.launched() else {
                    return Ok(());
                };
                let disposed = launched
                    .inner
                    .lock()
                    .await
                    .execute(DisposeBrowserContextParams::new(id))
                    .await;
                match disposed {
                    Ok(_) => {}
                    // A crashed browser has already dropped the context.
                    Err(e) if is_disconnect(&e) => {
                        warn!(%context, error = %e, "browser gone; context already released");
                    }
                    Err(e) => {
                        return Err(ProbeError::ContextError {
                            message: e.to_string(),
                        })
                    }
                }
            }
            Handle::Browser(browser) => {
                let Some(launched) = self.browser.take() else {
                    return Ok(());
                };
                if launched.handle != browser {
                    self.browser = Some(launched);
                    return Err(ProbeError::BrowserLaunchError {
                        message: format!("{browser} is not running"),
                    });
                }
                self.open_pages().clear();
                self.contexts.clear();
                let mut inner = launched.inner.into_inner();
                let closed = inner.close().await;
                let waited = inner.wait().await;
                launched.handler.abort();
                if let Err(e) = closed {
                    if !is_disconnect(&e) {
                        return Err(ProbeError::BrowserLaunchError {
                            message: e.to_string(),
                        });
                    }
                }
                waited.map_err(ProbeError::Io)?;
            }
        }
        Ok(())
    }

    async fn stop(&mut self) -> ProbeResult<()> {
        self.started = false;
        let Some(launched) = self.browser.take() else {
            return Ok(());
        };
        warn!(browser = %launched.handle, "stopping with browser still open; killing it");
        self.open_pages().clear();
        self.contexts.clear();
        let mut inner = launched.inner.into_inner();
        let killed = inner.kill().await;
        launched.handler.abort();
        kill_outcome(launched.handle, killed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_ready_state_script() {
        assert_eq!(
            ready_state_script(LoadTarget::Page(PageHandle(1))),
            "document.readyState"
        );
    }

    #[test]
    fn test_frame_ready_state_script_indexes_frame() {
        let script = ready_state_script(LoadTarget::Frame(FrameHandle {
            page: PageHandle(1),
            index: 2,
        }));
        assert!(script.contains("[2]"));
        assert!(script.contains("contentDocument"));
    }

    #[tokio::test]
    async fn test_launch_requires_start() {
        let mut driver = ChromiumDriver::new();
        let err = driver.launch(&BrowserConfig::default()).await.unwrap_err();
        assert!(matches!(err, ProbeError::EngineStart { .. }));
        assert!(!driver.is_connected().await);
    }

    #[tokio::test]
    async fn test_missing_executable_is_browser_not_found() {
        let mut driver = ChromiumDriver::new();
        driver.start().await.unwrap();
        let config = BrowserConfig::default().with_chromium_path("/nonexistent/chromium");
        let err = driver.launch(&config).await.unwrap_err();
        assert!(matches!(err, ProbeError::BrowserNotFound));
        assert!(err.is_environment());
    }

    #[tokio::test]
    async fn test_pages_of_unknown_context_is_empty() {
        let driver = ChromiumDriver::new();
        assert!(driver.pages(ContextHandle(7)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_browser_is_ok() {
        let mut driver = ChromiumDriver::new();
        driver.start().await.unwrap();
        driver.stop().await.unwrap();
        assert!(!driver.is_connected().await);
    }

    mod commit_tests {
        use super::*;

        #[test]
        fn test_child_frame_navigation_is_ignored() {
            assert_eq!(main_frame_commit(true, None), None);
            assert_eq!(main_frame_commit(true, Some("http://ads/")), None);
        }

        #[test]
        fn test_main_frame_navigation_commits() {
            assert_eq!(main_frame_commit(false, None), Some(Commit::Committed));
        }

        #[test]
        fn test_main_frame_error_page_names_url() {
            assert_eq!(
                main_frame_commit(false, Some("http://localhost:3000/")),
                Some(Commit::ErrorPage(
                    "http://localhost:3000/ is unreachable".to_string()
                ))
            );
        }
    }

    mod kill_tests {
        use super::*;

        #[test]
        fn test_failed_kill_is_release_failure() {
            let killed = Some(Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "operation not permitted",
            )));
            match kill_outcome(BrowserHandle(3), killed).unwrap_err() {
                ProbeError::ResourceReleaseFailure { handles, message } => {
                    assert_eq!(handles, "browser#3");
                    assert!(message.contains("operation not permitted"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[test]
        fn test_kill_success_or_no_child_is_ok() {
            assert!(kill_outcome(BrowserHandle(3), Some(Ok(()))).is_ok());
            assert!(kill_outcome(BrowserHandle(3), None).is_ok());
        }
    }
}
