//! AutomationDriver - the browser automation capability consumed by the core.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  AutomationDriver (async trait)                                  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────┐          ┌─────────────────────┐        │
//! │  │  ChromiumDriver     │          │  MockDriver         │        │
//! │  │  (feature browser)  │          │  (scripted, tests)  │        │
//! │  │  CDP via            │          │  in-memory routes,  │        │
//! │  │  chromiumoxide      │          │  failure injection  │        │
//! │  └─────────────────────┘          └─────────────────────┘        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Handles are opaque ids minted by the driver. Every call that can block
//! takes an explicit timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::browser::BrowserConfig;
use crate::locator::{Locator, Selector};
use crate::result::{ProbeError, ProbeResult};
use crate::wait::{LoadState, WaitUntil, DEFAULT_POLL_INTERVAL_MS};

// =============================================================================
// HANDLES
// =============================================================================

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

handle_type!(
    /// A launched browser instance
    BrowserHandle,
    "browser"
);
handle_type!(
    /// An isolated cookie/storage scope within a browser
    ContextHandle,
    "context"
);
handle_type!(
    /// A page (tab) within a context
    PageHandle,
    "page"
);

/// A nested frame of a page, by document order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameHandle {
    /// Owning page
    pub page: PageHandle,
    /// Zero-based frame index
    pub index: usize,
}

impl fmt::Display for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}.{}", self.page.0, self.index)
    }
}

/// Something a load state can be awaited on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadTarget {
    /// Main document of a page
    Page(PageHandle),
    /// A nested frame
    Frame(FrameHandle),
}

impl fmt::Display for LoadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Page(p) => write!(f, "{p}"),
            Self::Frame(fr) => write!(f, "{fr}"),
        }
    }
}

/// Any closable handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    /// Browser instance
    Browser(BrowserHandle),
    /// Browser context
    Context(ContextHandle),
    /// Page
    Page(PageHandle),
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Browser(h) => write!(f, "{h}"),
            Self::Context(h) => write!(f, "{h}"),
            Self::Page(h) => write!(f, "{h}"),
        }
    }
}

/// A locator bound to a page. Resolution is lazy: the element is looked up
/// afresh by every action, so it survives re-renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    /// Page the locator is evaluated in
    pub page: PageHandle,
    /// What to look for
    pub locator: Locator,
}

// =============================================================================
// DRIVER TRAIT
// =============================================================================

/// Browser automation capability
///
/// # Implementations
///
/// - `ChromiumDriver` - CDP via chromiumoxide (feature `browser`)
/// - `MockDriver` - scripted, for unit and integration tests
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Start the automation engine
    async fn start(&mut self) -> ProbeResult<()>;

    /// Launch an isolated browser instance
    async fn launch(&mut self, config: &BrowserConfig) -> ProbeResult<BrowserHandle>;

    /// Open an isolated context with a default per-operation timeout
    async fn new_context(
        &mut self,
        browser: BrowserHandle,
        default_timeout: Duration,
    ) -> ProbeResult<ContextHandle>;

    /// Open a page in a context
    async fn new_page(&mut self, context: ContextHandle) -> ProbeResult<PageHandle>;

    /// Pages of a context, in the order they were opened
    async fn pages(&self, context: ContextHandle) -> ProbeResult<Vec<PageHandle>>;

    /// Navigate a page
    async fn goto(
        &mut self,
        page: PageHandle,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> ProbeResult<()>;

    /// Reload the current document of a page
    async fn reload(
        &mut self,
        page: PageHandle,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> ProbeResult<()>;

    /// Current URL of a page
    async fn current_url(&self, page: PageHandle) -> ProbeResult<String>;

    /// Nested frames of a page
    async fn frames(&self, page: PageHandle) -> ProbeResult<Vec<FrameHandle>>;

    /// Wait for a document to reach a load state
    async fn wait_for_load_state(
        &self,
        target: LoadTarget,
        state: LoadState,
        timeout: Duration,
    ) -> ProbeResult<()>;

    /// Bind a locator to a page
    async fn locate(&self, page: PageHandle, locator: &Locator) -> ProbeResult<ElementHandle>;

    /// Click an element, waiting up to `timeout` for it to exist
    async fn click(&mut self, element: &ElementHandle, timeout: Duration) -> ProbeResult<()>;

    /// Replace an input's value, waiting up to `timeout` for it to exist
    async fn fill(
        &mut self,
        element: &ElementHandle,
        text: &str,
        timeout: Duration,
    ) -> ProbeResult<()>;

    /// Whether the element is currently rendered and visible
    async fn is_visible(&self, element: &ElementHandle, timeout: Duration) -> ProbeResult<bool>;

    /// Whether the engine and browser still respond
    async fn is_connected(&self) -> bool;

    /// Close a handle
    async fn close(&mut self, handle: Handle) -> ProbeResult<()>;

    /// Stop the automation engine
    async fn stop(&mut self) -> ProbeResult<()>;
}

// =============================================================================
// MOCK DRIVER
// =============================================================================

/// Scripted content of one route
#[derive(Debug, Clone, Default)]
pub struct MockPage {
    /// Visible text fragments
    pub texts: Vec<String>,
    /// Structural selectors present on the page
    pub elements: Vec<Selector>,
    /// Number of nested frames
    pub frames: usize,
    /// Never reaches any load state
    pub load_hang: bool,
    /// Commit takes this long
    pub commit_delay: Option<Duration>,
    /// Content only appears this long after navigation
    pub reveal_after: Option<Duration>,
    /// Clicking a selector navigates to a URL
    pub on_click: HashMap<Selector, String>,
    /// Clicking a selector opens a URL in a new page of the same context
    pub opens_tab: HashMap<Selector, String>,
}

impl MockPage {
    /// Empty page
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add visible text
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.texts.push(text.into());
        self
    }

    /// Add a structural element
    #[must_use]
    pub fn with_element(mut self, selector: Selector) -> Self {
        self.elements.push(selector);
        self
    }

    /// Set nested frame count
    #[must_use]
    pub const fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    /// Never signal any load state
    #[must_use]
    pub const fn with_load_hang(mut self) -> Self {
        self.load_hang = true;
        self
    }

    /// Delay the navigation commit
    #[must_use]
    pub const fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    /// Reveal content only after `delay`
    #[must_use]
    pub const fn revealed_after(mut self, delay: Duration) -> Self {
        self.reveal_after = Some(delay);
        self
    }

    /// Clicking `selector` navigates to `url`
    #[must_use]
    pub fn on_click(mut self, selector: Selector, url: impl Into<String>) -> Self {
        self.elements.push(selector.clone());
        self.on_click.insert(selector, url.into());
        self
    }

    /// Clicking `selector` opens `url` in a new page, like a
    /// `target=_blank` link
    #[must_use]
    pub fn on_click_opens_tab(mut self, selector: Selector, url: impl Into<String>) -> Self {
        self.elements.push(selector.clone());
        self.opens_tab.insert(selector, url.into());
        self
    }

    fn matches(&self, selector: &Selector) -> usize {
        match selector {
            Selector::Text(t) => self.texts.iter().filter(|x| x.contains(t.as_str())).count(),
            other => self.elements.iter().filter(|e| *e == other).count(),
        }
    }
}

/// Failure injection for [`MockDriver`]
#[derive(Debug, Clone, Default)]
pub struct MockFailures {
    /// Engine fails to start
    pub start: bool,
    /// Browser fails to launch
    pub launch: bool,
    /// Context cannot be created
    pub new_context: bool,
    /// Page cannot be opened
    pub new_page: bool,
    /// Closing the context fails
    pub close_context: bool,
    /// Closing the browser fails
    pub close_browser: bool,
    /// Stopping the engine fails
    pub stop: bool,
    /// Navigating to this URL crashes the browser
    pub disconnect_on: Option<String>,
}

#[derive(Debug)]
struct MockPageState {
    context: ContextHandle,
    url: String,
    navigated_at: Instant,
    open: bool,
}

#[derive(Debug, Default)]
struct MockState {
    routes: HashMap<String, MockPage>,
    error_page: MockPage,
    failures: MockFailures,
    journal: Vec<String>,
    next_id: u64,
    engine_running: bool,
    crashed: bool,
    stalled: bool,
    ping_delay: Option<Duration>,
    browsers: Vec<BrowserHandle>,
    contexts: HashMap<ContextHandle, BrowserHandle>,
    pages: Vec<(PageHandle, MockPageState)>,
}

impl MockState {
    fn mint(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_connected(&self) -> ProbeResult<()> {
        if self.crashed {
            return Err(ProbeError::SessionUnreachable {
                message: "Target page, context or browser has been closed".to_string(),
            });
        }
        if !self.engine_running {
            return Err(ProbeError::SessionUnreachable {
                message: "automation engine is not running".to_string(),
            });
        }
        Ok(())
    }

    fn page(&self, page: PageHandle) -> ProbeResult<&MockPageState> {
        self.pages
            .iter()
            .find(|(h, s)| *h == page && s.open)
            .map(|(_, s)| s)
            .ok_or_else(|| ProbeError::PageError {
                message: format!("{page} is closed"),
            })
    }

    fn page_mut(&mut self, page: PageHandle) -> ProbeResult<&mut MockPageState> {
        self.pages
            .iter_mut()
            .find(|(h, s)| *h == page && s.open)
            .map(|(_, s)| s)
            .ok_or_else(|| ProbeError::PageError {
                message: format!("{page} is closed"),
            })
    }

    fn content(&self, url: &str) -> &MockPage {
        self.routes.get(url).unwrap_or(&self.error_page)
    }

    /// Time until `selector` exists on `page`; `None` if it never will
    fn time_until_present(&self, page: PageHandle, locator: &Locator) -> ProbeResult<Option<Duration>> {
        let state = self.page(page)?;
        let content = self.content(&state.url);
        if content.matches(&locator.selector) <= locator.nth {
            return Ok(None);
        }
        let waited = state.navigated_at.elapsed();
        Ok(Some(
            content
                .reveal_after
                .map_or(Duration::ZERO, |d| d.saturating_sub(waited)),
        ))
    }
}

/// Scripted in-memory driver
///
/// Clones share state, so a test can keep one clone for inspection while a
/// runner owns another.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    /// Create new mock driver
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `page` at `url`
    #[must_use]
    pub fn with_route(self, url: impl Into<String>, page: MockPage) -> Self {
        self.state().routes.insert(url.into(), page);
        self
    }

    /// Content shown for unrouted URLs
    #[must_use]
    pub fn with_error_page(self, page: MockPage) -> Self {
        self.state().error_page = page;
        self
    }

    /// Inject failures
    #[must_use]
    pub fn with_failures(self, failures: MockFailures) -> Self {
        self.state().failures = failures;
        self
    }

    /// Replace or add a route after construction
    pub fn set_route(&self, url: impl Into<String>, page: MockPage) {
        self.state().routes.insert(url.into(), page);
    }

    /// Simulate a browser crash
    pub fn crash(&self) {
        self.state().crashed = true;
    }

    /// Simulate a hung renderer: element lookups never answer
    pub fn stall(&self) {
        self.state().stalled = true;
    }

    /// Delay every liveness check by `delay`
    #[must_use]
    pub fn with_ping_delay(self, delay: Duration) -> Self {
        self.state().ping_delay = Some(delay);
        self
    }

    /// Every call made so far
    #[must_use]
    pub fn journal(&self) -> Vec<String> {
        self.state().journal.clone()
    }

    /// Number of calls starting with `prefix`
    #[must_use]
    pub fn count(&self, prefix: &str) -> usize {
        self.state()
            .journal
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Check if method was called
    #[must_use]
    pub fn was_called(&self, prefix: &str) -> bool {
        self.count(prefix) > 0
    }

    /// URLs navigated to, in order
    #[must_use]
    pub fn visited(&self) -> Vec<String> {
        self.state()
            .journal
            .iter()
            .filter_map(|c| c.strip_prefix("goto:").map(str::to_string))
            .collect()
    }

    /// Engine, browsers and contexts still open
    #[must_use]
    pub fn open_handles(&self) -> usize {
        let state = self.state();
        usize::from(state.engine_running) + state.browsers.len() + state.contexts.len()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: impl Into<String>) {
        self.state().journal.push(call.into());
    }

    fn navigate_now(&self, page: PageHandle, url: &str) -> ProbeResult<Option<Duration>> {
        let mut state = self.state();
        state.ensure_connected()?;
        if state.failures.disconnect_on.as_deref() == Some(url) {
            state.crashed = true;
            return Err(ProbeError::SessionUnreachable {
                message: format!("browser crashed while navigating to {url}"),
            });
        }
        let delay = state.routes.get(url).and_then(|p| p.commit_delay);
        let routed = state.routes.contains_key(url);
        let target = state.page_mut(page)?;
        target.url = url.to_string();
        target.navigated_at = Instant::now();
        if routed {
            Ok(delay)
        } else {
            Err(ProbeError::NavigationError {
                url: url.to_string(),
                message: "net::ERR_CONNECTION_REFUSED".to_string(),
            })
        }
    }

    async fn await_present(&self, element: &ElementHandle, timeout: Duration) -> ProbeResult<()> {
        let wait = {
            let state = self.state();
            state.ensure_connected()?;
            state.time_until_present(element.page, &element.locator)?
        };
        match wait {
            Some(d) if d <= timeout => {
                tokio::time::sleep(d).await;
                Ok(())
            }
            Some(_) => {
                tokio::time::sleep(timeout).await;
                Err(ProbeError::Timeout {
                    ms: timeout.as_millis() as u64,
                })
            }
            // The last lookup happens one poll interval before the deadline.
            None => {
                let poll = Duration::from_millis(DEFAULT_POLL_INTERVAL_MS);
                tokio::time::sleep(timeout.saturating_sub(poll)).await;
                Err(ProbeError::ElementNotFound {
                    locator: element.locator.to_string(),
                })
            }
        }
    }

    fn open_tab(&self, context: ContextHandle, url: &str) {
        let mut state = self.state();
        let handle = PageHandle(state.mint());
        state.journal.push(format!("open_tab:{url}"));
        state.pages.push((
            handle,
            MockPageState {
                context,
                url: url.to_string(),
                navigated_at: Instant::now(),
                open: true,
            },
        ));
    }
}

#[async_trait]
impl AutomationDriver for MockDriver {
    async fn start(&mut self) -> ProbeResult<()> {
        self.record("start");
        let mut state = self.state();
        if state.failures.start {
            return Err(ProbeError::EngineStart {
                message: "mock engine refused to start".to_string(),
            });
        }
        state.engine_running = true;
        Ok(())
    }

    async fn launch(&mut self, config: &BrowserConfig) -> ProbeResult<BrowserHandle> {
        self.record(format!("launch:{}", config.launch_args().join(" ")));
        let mut state = self.state();
        state.ensure_connected()?;
        if state.failures.launch {
            return Err(ProbeError::BrowserLaunchError {
                message: "mock browser refused to launch".to_string(),
            });
        }
        let handle = BrowserHandle(state.mint());
        state.browsers.push(handle);
        Ok(handle)
    }

    async fn new_context(
        &mut self,
        browser: BrowserHandle,
        default_timeout: Duration,
    ) -> ProbeResult<ContextHandle> {
        self.record(format!("new_context:{}ms", default_timeout.as_millis()));
        let mut state = self.state();
        state.ensure_connected()?;
        if state.failures.new_context || !state.browsers.contains(&browser) {
            return Err(ProbeError::ContextError {
                message: format!("cannot open context in {browser}"),
            });
        }
        let handle = ContextHandle(state.mint());
        state.contexts.insert(handle, browser);
        Ok(handle)
    }

    async fn new_page(&mut self, context: ContextHandle) -> ProbeResult<PageHandle> {
        self.record("new_page");
        let mut state = self.state();
        state.ensure_connected()?;
        if state.failures.new_page || !state.contexts.contains_key(&context) {
            return Err(ProbeError::PageError {
                message: format!("cannot open page in {context}"),
            });
        }
        let handle = PageHandle(state.mint());
        state.pages.push((
            handle,
            MockPageState {
                context,
                url: "about:blank".to_string(),
                navigated_at: Instant::now(),
                open: true,
            },
        ));
        Ok(handle)
    }

    async fn pages(&self, context: ContextHandle) -> ProbeResult<Vec<PageHandle>> {
        let state = self.state();
        state.ensure_connected()?;
        Ok(state
            .pages
            .iter()
            .filter(|(_, s)| s.context == context && s.open)
            .map(|(h, _)| *h)
            .collect())
    }

    async fn goto(
        &mut self,
        page: PageHandle,
        url: &str,
        _wait_until: WaitUntil,
        timeout: Duration,
    ) -> ProbeResult<()> {
        self.record(format!("goto:{url}"));
        match self.navigate_now(page, url)? {
            Some(delay) if delay > timeout => {
                tokio::time::sleep(timeout).await;
                Err(ProbeError::Timeout {
                    ms: timeout.as_millis() as u64,
                })
            }
            Some(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn reload(
        &mut self,
        page: PageHandle,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> ProbeResult<()> {
        let url = self.current_url(page).await?;
        self.record(format!("reload:{url}"));
        let _ = wait_until;
        match self.navigate_now(page, &url)? {
            Some(delay) if delay > timeout => {
                tokio::time::sleep(timeout).await;
                Err(ProbeError::Timeout {
                    ms: timeout.as_millis() as u64,
                })
            }
            Some(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn current_url(&self, page: PageHandle) -> ProbeResult<String> {
        let state = self.state();
        state.ensure_connected()?;
        Ok(state.page(page)?.url.clone())
    }

    async fn frames(&self, page: PageHandle) -> ProbeResult<Vec<FrameHandle>> {
        let state = self.state();
        state.ensure_connected()?;
        let count = state.content(&state.page(page)?.url).frames;
        Ok((0..count).map(|index| FrameHandle { page, index }).collect())
    }

    async fn wait_for_load_state(
        &self,
        target: LoadTarget,
        state: LoadState,
        timeout: Duration,
    ) -> ProbeResult<()> {
        self.record(format!("wait_for_load_state:{target}"));
        let hangs = {
            let s = self.state();
            s.ensure_connected()?;
            let page = match target {
                LoadTarget::Page(p) => p,
                LoadTarget::Frame(f) => f.page,
            };
            s.content(&s.page(page)?.url).load_hang
        };
        if hangs {
            tokio::time::sleep(timeout).await;
            return Err(ProbeError::LoadStateTimeout {
                state: state.to_string(),
                ms: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    async fn locate(&self, page: PageHandle, locator: &Locator) -> ProbeResult<ElementHandle> {
        let stalled = {
            let state = self.state();
            state.ensure_connected()?;
            state.page(page)?;
            state.stalled
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(ElementHandle {
            page,
            locator: locator.clone(),
        })
    }

    async fn click(&mut self, element: &ElementHandle, timeout: Duration) -> ProbeResult<()> {
        self.record(format!("click:{}", element.locator));
        self.await_present(element, timeout).await?;
        let (target, tab, context) = {
            let state = self.state();
            let opened = state.page(element.page)?;
            let content = state.content(&opened.url);
            let selector = &element.locator.selector;
            (
                content.on_click.get(selector).cloned(),
                content.opens_tab.get(selector).cloned(),
                opened.context,
            )
        };
        if let Some(url) = target {
            // Navigation triggered by a click is not awaited.
            let _ = self.navigate_now(element.page, &url);
        }
        if let Some(url) = tab {
            self.open_tab(context, &url);
        }
        Ok(())
    }

    async fn fill(
        &mut self,
        element: &ElementHandle,
        text: &str,
        timeout: Duration,
    ) -> ProbeResult<()> {
        self.record(format!("fill:{}={text}", element.locator));
        self.await_present(element, timeout).await
    }

    async fn is_visible(&self, element: &ElementHandle, _timeout: Duration) -> ProbeResult<bool> {
        self.record(format!("is_visible:{}", element.locator));
        let state = self.state();
        state.ensure_connected()?;
        Ok(state.time_until_present(element.page, &element.locator)? == Some(Duration::ZERO))
    }

    async fn is_connected(&self) -> bool {
        let delay = self.state().ping_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state().ensure_connected().is_ok()
    }

    async fn close(&mut self, handle: Handle) -> ProbeResult<()> {
        self.record(format!("close:{handle}"));
        let mut state = self.state();
        match handle {
            Handle::Context(context) => {
                if state.failures.close_context {
                    return Err(ProbeError::ContextError {
                        message: format!("{context} refused to close"),
                    });
                }
                state.contexts.remove(&context);
                for (_, page) in &mut state.pages {
                    if page.context == context {
                        page.open = false;
                    }
                }
            }
            Handle::Browser(browser) => {
                if state.failures.close_browser {
                    return Err(ProbeError::BrowserLaunchError {
                        message: format!("{browser} refused to close"),
                    });
                }
                state.browsers.retain(|b| *b != browser);
                state.contexts.retain(|_, b| *b != browser);
            }
            Handle::Page(page) => {
                state.page_mut(page)?.open = false;
            }
        }
        Ok(())
    }

    async fn stop(&mut self) -> ProbeResult<()> {
        self.record("stop");
        let mut state = self.state();
        if state.failures.stop {
            return Err(ProbeError::EngineStart {
                message: "mock engine refused to stop".to_string(),
            });
        }
        state.engine_running = false;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
