//! Structural and text locators.
//!
//! Locator strings use the familiar engine prefixes: `xpath=...`, `text=...`
//! and `css=...`. A bare string starting with `/` or `(` is treated as XPath,
//! anything else as CSS.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::result::{ProbeError, ProbeResult};

/// Selector type for locating elements
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Selector {
    /// CSS selector (e.g., "button.primary")
    Css(String),
    /// XPath selector
    XPath(String),
    /// Text content selector (substring match, innermost element)
    Text(String),
}

impl Selector {
    /// Create a CSS selector
    #[must_use]
    pub fn css(selector: impl Into<String>) -> Self {
        Self::Css(selector.into())
    }

    /// Create an XPath selector
    #[must_use]
    pub fn xpath(selector: impl Into<String>) -> Self {
        Self::XPath(selector.into())
    }

    /// Create a text selector
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Parse a prefixed locator string
    pub fn parse(raw: &str) -> ProbeResult<Self> {
        let raw = raw.trim();
        let selector = if let Some(rest) = raw.strip_prefix("xpath=") {
            Self::XPath(rest.to_string())
        } else if let Some(rest) = raw.strip_prefix("text=") {
            Self::Text(unquote(rest).to_string())
        } else if let Some(rest) = raw.strip_prefix("css=") {
            Self::Css(rest.to_string())
        } else if raw.starts_with('/') || raw.starts_with('(') {
            Self::XPath(raw.to_string())
        } else {
            Self::Css(raw.to_string())
        };

        if selector.body().trim().is_empty() {
            return Err(ProbeError::InvalidScenario {
                message: format!("empty locator '{raw}'"),
            });
        }
        Ok(selector)
    }

    /// The selector body without its engine prefix
    #[must_use]
    pub fn body(&self) -> &str {
        match self {
            Self::Css(s) | Self::XPath(s) | Self::Text(s) => s,
        }
    }

    /// JavaScript expression evaluating to every matching element, in document order
    #[must_use]
    pub fn to_query_all(&self) -> String {
        match self {
            Self::Css(s) => format!("Array.from(document.querySelectorAll({}))", js_string(s)),
            Self::XPath(s) => format!(
                "(() => {{ const r = document.evaluate({}, document, null, \
                 XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null); \
                 return Array.from({{ length: r.snapshotLength }}, (_, i) => r.snapshotItem(i)); }})()",
                js_string(s)
            ),
            Self::Text(t) => format!(
                "(() => {{ const t = {}; \
                 return Array.from(document.querySelectorAll('body *')).filter(el => \
                 el.textContent.includes(t) && \
                 !Array.from(el.children).some(c => c.textContent.includes(t))); }})()",
                js_string(t)
            ),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css(s) => write!(f, "css={s}"),
            Self::XPath(s) => write!(f, "xpath={s}"),
            Self::Text(t) => write!(f, "text={t}"),
        }
    }
}

impl FromStr for Selector {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Selector {
    type Error = ProbeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Selector> for String {
    fn from(selector: Selector) -> Self {
        selector.to_string()
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|r| r.strip_suffix(quote)) {
            return inner;
        }
    }
    s
}

fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// A selector narrowed to one match
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    /// Underlying selector
    pub selector: Selector,
    /// Zero-based index among matches
    pub nth: usize,
}

impl Locator {
    /// First match of `selector`
    #[must_use]
    pub const fn new(selector: Selector) -> Self {
        Self { selector, nth: 0 }
    }

    /// Select the `n`th match instead of the first
    #[must_use]
    pub const fn nth(mut self, n: usize) -> Self {
        self.nth = n;
        self
    }

    /// JavaScript expression evaluating to the element or `null`
    #[must_use]
    pub fn to_query(&self) -> String {
        format!("({}[{}] ?? null)", self.selector.to_query_all(), self.nth)
    }

    /// JavaScript expression evaluating to whether the element is rendered and visible
    #[must_use]
    pub fn visibility_script(&self) -> String {
        format!(
            "(() => {{ const el = {}; if (!el) return false; \
             const r = el.getBoundingClientRect(); const s = window.getComputedStyle(el); \
             return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none'; }})()",
            self.to_query()
        )
    }

    /// JavaScript expression that clicks the element, evaluating to whether it existed
    #[must_use]
    pub fn click_script(&self) -> String {
        format!(
            "(() => {{ const el = {}; if (!el) return false; \
             el.scrollIntoView({{ block: 'center' }}); el.click(); return true; }})()",
            self.to_query()
        )
    }

    /// JavaScript expression that fills the element, evaluating to whether it existed
    #[must_use]
    pub fn fill_script(&self, text: &str) -> String {
        format!(
            "(() => {{ const el = {}; if (!el) return false; el.focus(); el.value = {}; \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }})()",
            self.to_query(),
            js_string(text)
        )
    }
}

impl From<Selector> for Locator {
    fn from(selector: Selector) -> Self {
        Self::new(selector)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nth == 0 {
            write!(f, "{}", self.selector)
        } else {
            write!(f, "{} >> nth={}", self.selector, self.nth)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parse_tests {
        use super::*;

        #[test]
        fn test_prefixed_selectors() {
            assert_eq!(
                Selector::parse("xpath=html/body/div[1]/button").unwrap(),
                Selector::xpath("html/body/div[1]/button")
            );
            assert_eq!(
                Selector::parse("text=User Dashboard").unwrap(),
                Selector::text("User Dashboard")
            );
            assert_eq!(
                Selector::parse("css=button.primary").unwrap(),
                Selector::css("button.primary")
            );
        }

        #[test]
        fn test_bare_selectors() {
            assert_eq!(
                Selector::parse("//button[@id='reload-button']").unwrap(),
                Selector::xpath("//button[@id='reload-button']")
            );
            assert_eq!(
                Selector::parse("(//button)[2]").unwrap(),
                Selector::xpath("(//button)[2]")
            );
            assert_eq!(
                Selector::parse("#login-form input").unwrap(),
                Selector::css("#login-form input")
            );
        }

        #[test]
        fn test_quoted_text() {
            assert_eq!(
                Selector::parse("text=\"401 - Unauthorized\"").unwrap(),
                Selector::text("401 - Unauthorized")
            );
        }

        #[test]
        fn test_empty_locator_rejected() {
            assert!(Selector::parse("").is_err());
            assert!(Selector::parse("text=").is_err());
            assert!(Selector::parse("xpath=  ").is_err());
        }

        #[test]
        fn test_serde_string_form() {
            let selector: Selector = serde_json::from_str("\"text=Sign in\"").unwrap();
            assert_eq!(selector, Selector::text("Sign in"));
            assert_eq!(serde_json::to_string(&selector).unwrap(), "\"text=Sign in\"");
        }
    }

    mod query_tests {
        use super::*;

        #[test]
        fn test_css_query_escapes() {
            let query = Selector::css("a[title=\"x\"]").to_query_all();
            assert!(query.contains(r#""a[title=\"x\"]""#));
        }

        #[test]
        fn test_locator_query_indexes_match() {
            let locator = Locator::new(Selector::css("button")).nth(2);
            assert!(locator.to_query().ends_with("[2] ?? null)"));
        }

        #[test]
        fn test_text_query_prefers_innermost() {
            let query = Selector::text("Reports").to_query_all();
            assert!(query.contains("el.children"));
        }

        #[test]
        fn test_fill_script_quotes_text() {
            let script = Locator::new(Selector::css("input")).fill_script("it's \"quoted\"");
            assert!(script.contains(r#""it's \"quoted\"""#));
        }

        #[test]
        fn test_locator_display() {
            assert_eq!(Locator::new(Selector::text("Save")).to_string(), "text=Save");
            assert_eq!(
                Locator::new(Selector::css("li")).nth(3).to_string(),
                "css=li >> nth=3"
            );
        }
    }
}
