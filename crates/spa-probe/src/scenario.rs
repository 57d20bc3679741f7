//! Declarative scenario descriptions.
//!
//! A [`Scenario`] is immutable once built: an id, a navigation ladder, an
//! ordered list of interactions, one terminal assertion and an overall
//! deadline. Scenarios are loaded from YAML or JSON and validated on load.
//!
//! ```yaml
//! id: TC001_User_Login_Success
//! timeout_ms: 60000
//! navigation:
//!   - action: goto
//!     url: http://localhost:3000/login
//! interactions:
//!   - locator: "text=Sign in"
//! assertion:
//!   visible_text: User Dashboard
//!   description: expected authenticated redirect to dashboard
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::interaction::InteractionStep;
use crate::navigation::{FallbackLadder, NavigationAction, NavigationStep};
use crate::result::{ProbeError, ProbeResult};
use crate::verify::{Assertion, Condition};

/// Default overall scenario deadline (2 minutes)
pub const DEFAULT_SCENARIO_TIMEOUT_MS: u64 = 120_000;

fn default_scenario_timeout_ms() -> u64 {
    DEFAULT_SCENARIO_TIMEOUT_MS
}

/// One end-to-end verification case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default = "default_scenario_timeout_ms")]
    timeout_ms: u64,
    #[serde(default)]
    hold_after_ms: u64,
    #[serde(default)]
    navigation: Vec<NavigationStep>,
    #[serde(default)]
    interactions: Vec<InteractionStep>,
    assertion: Assertion,
}

impl Scenario {
    /// Start building a scenario in code
    #[must_use]
    pub fn builder(id: impl Into<String>) -> ScenarioBuilder {
        ScenarioBuilder::new(id)
    }

    /// Parse and validate a YAML description
    ///
    /// # Errors
    ///
    /// [`ProbeError::ScenarioParse`] for malformed YAML,
    /// [`ProbeError::InvalidScenario`] if validation fails.
    pub fn from_yaml(yaml: &str) -> ProbeResult<Self> {
        let scenario: Self = serde_yaml_ng::from_str(yaml).map_err(|e| ProbeError::ScenarioParse {
            message: e.to_string(),
        })?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Parse and validate a JSON description
    ///
    /// # Errors
    ///
    /// [`ProbeError::ScenarioParse`] for malformed JSON,
    /// [`ProbeError::InvalidScenario`] if validation fails.
    pub fn from_json(json: &str) -> ProbeResult<Self> {
        let scenario: Self = serde_json::from_str(json).map_err(|e| ProbeError::ScenarioParse {
            message: e.to_string(),
        })?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load from a `.yaml`, `.yml` or `.json` file
    ///
    /// # Errors
    ///
    /// I/O errors, an unsupported extension, or any parse/validation error.
    pub fn load(path: impl AsRef<Path>) -> ProbeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml(&content),
            Some("json") => Self::from_json(&content),
            _ => Err(ProbeError::InvalidScenario {
                message: format!(
                    "{}: unsupported scenario format (expected .yaml, .yml or .json)",
                    path.display()
                ),
            }),
        }
    }

    /// Serialize to YAML
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::ScenarioParse`] if serialization fails.
    pub fn to_yaml(&self) -> ProbeResult<String> {
        serde_yaml_ng::to_string(self).map_err(|e| ProbeError::ScenarioParse {
            message: e.to_string(),
        })
    }

    /// Check structural constraints
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidScenario`] naming the first violation.
    pub fn validate(&self) -> ProbeResult<()> {
        let invalid = |message: String| {
            Err(ProbeError::InvalidScenario {
                message: format!("{}: {message}", self.id),
            })
        };

        if self.id.trim().is_empty() {
            return Err(ProbeError::InvalidScenario {
                message: "scenario id must not be empty".to_string(),
            });
        }
        if self.timeout_ms == 0 {
            return invalid("timeout_ms must be positive".to_string());
        }

        for (i, step) in self.navigation.iter().enumerate() {
            if let NavigationAction::Goto { url } = &step.action {
                if url.trim().is_empty() {
                    return invalid(format!("navigation step {i} has an empty url"));
                }
            }
            if step.timeout_ms == 0 {
                return invalid(format!("navigation step {i} has a zero timeout"));
            }
        }

        for (i, step) in self.interactions.iter().enumerate() {
            if step.timeout_ms == 0 {
                return invalid(format!("interaction {i} ({step}) has a zero timeout"));
            }
        }

        if self.assertion.timeout_ms == 0 {
            return invalid("assertion timeout_ms must be positive".to_string());
        }
        if let Condition::VisibleText(text) = &self.assertion.condition {
            if text.trim().is_empty() {
                return invalid("assertion text must not be empty".to_string());
            }
        }

        Ok(())
    }

    /// Identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Free-form description
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Overall deadline for navigation, interactions and verification
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Linger after verification, before release
    #[must_use]
    pub const fn hold_after(&self) -> Duration {
        Duration::from_millis(self.hold_after_ms)
    }

    /// Navigation ladder, in order
    #[must_use]
    pub fn navigation(&self) -> &[NavigationStep] {
        &self.navigation
    }

    /// Interactions, in order
    #[must_use]
    pub fn interactions(&self) -> &[InteractionStep] {
        &self.interactions
    }

    /// Terminal assertion
    #[must_use]
    pub const fn assertion(&self) -> &Assertion {
        &self.assertion
    }
}

/// Builder for [`Scenario`]
#[derive(Debug, Clone)]
pub struct ScenarioBuilder {
    id: String,
    description: Option<String>,
    timeout_ms: u64,
    hold_after_ms: u64,
    navigation: Vec<NavigationStep>,
    interactions: Vec<InteractionStep>,
    assertion: Option<Assertion>,
}

impl ScenarioBuilder {
    /// Builder for scenario `id`
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            timeout_ms: DEFAULT_SCENARIO_TIMEOUT_MS,
            hold_after_ms: 0,
            navigation: Vec::new(),
            interactions: Vec::new(),
            assertion: None,
        }
    }

    /// Set description
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set overall deadline
    #[must_use]
    pub const fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Linger after verification
    #[must_use]
    pub const fn hold_after_ms(mut self, hold_after_ms: u64) -> Self {
        self.hold_after_ms = hold_after_ms;
        self
    }

    /// Append a navigation step
    #[must_use]
    pub fn navigate(mut self, step: NavigationStep) -> Self {
        self.navigation.push(step);
        self
    }

    /// Append every step of a ladder
    #[must_use]
    pub fn ladder(mut self, ladder: FallbackLadder) -> Self {
        self.navigation.extend(ladder.into_steps());
        self
    }

    /// Append an interaction
    #[must_use]
    pub fn interact(mut self, step: InteractionStep) -> Self {
        self.interactions.push(step);
        self
    }

    /// Set the terminal assertion
    #[must_use]
    pub fn assertion(mut self, assertion: Assertion) -> Self {
        self.assertion = Some(assertion);
        self
    }

    /// Build and validate
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidScenario`] if no assertion was set or
    /// validation fails.
    pub fn build(self) -> ProbeResult<Scenario> {
        let assertion = self.assertion.ok_or_else(|| ProbeError::InvalidScenario {
            message: format!("{}: missing assertion", self.id),
        })?;
        let scenario = Scenario {
            id: self.id,
            description: self.description,
            timeout_ms: self.timeout_ms,
            hold_after_ms: self.hold_after_ms,
            navigation: self.navigation,
            interactions: self.interactions,
            assertion,
        };
        scenario.validate()?;
        Ok(scenario)
    }
}
