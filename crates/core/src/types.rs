//! Core types shared by the scheduler, the services and the connectors

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::resource::RenderDom;

/// Identity of one running test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(Uuid);

impl TestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one check step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(Uuid);

impl StepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Session lifecycle
// ============================================================================

/// Browser / environment descriptor of a test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserInfo {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

impl Default for BrowserInfo {
    fn default() -> Self {
        Self {
            name: "chrome".to_string(),
            width: 1280,
            height: 800,
            device_name: None,
        }
    }
}

impl fmt::Display for BrowserInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device_name {
            Some(device) => write!(f, "{} ({})", self.name, device),
            None => write!(f, "{} {}x{}", self.name, self.width, self.height),
        }
    }
}

/// What a caller supplies when opening a test
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestDescriptor {
    pub app_name: String,
    pub test_name: String,
    #[serde(default)]
    pub browser: BrowserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl TestDescriptor {
    pub fn new(app_name: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            test_name: test_name.into(),
            ..Default::default()
        }
    }

    pub fn with_browser(mut self, browser: BrowserInfo) -> Self {
        self.browser = browser;
        self
    }
}

/// Payload of a start-session request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartInfo {
    pub test_id: TestId,
    pub app_name: String,
    pub test_name: String,
    pub browser: BrowserInfo,
    pub batch_id: Option<String>,
    pub properties: BTreeMap<String, String>,
}

impl SessionStartInfo {
    pub fn new(test_id: TestId, descriptor: &TestDescriptor) -> Self {
        Self {
            test_id,
            app_name: descriptor.app_name.clone(),
            test_name: descriptor.test_name.clone(),
            browser: descriptor.browser.clone(),
            batch_id: descriptor.batch_id.clone(),
            properties: descriptor.properties.clone(),
        }
    }
}

/// A session the server has started for one test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningSession {
    pub id: String,
    pub session_id: String,
    pub url: String,
    pub is_new: bool,
}

/// Answer to a start-session request
#[derive(Debug, Clone)]
pub enum StartSessionOutcome {
    Started(RunningSession),
    /// The server has no room for another session right now
    ConcurrencyFull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStopInfo {
    pub session: RunningSession,
    pub aborted: bool,
}

// ============================================================================
// Checks
// ============================================================================

/// Caller-defined check configuration, carried through untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckSettings {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CheckSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Output captured (or rendered) for one step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_url: Option<String>,
    /// Raw screenshot waiting to be uploaded
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
}

impl AppOutput {
    pub fn from_screenshot(screenshot: Vec<u8>) -> Self {
        Self {
            screenshot: Some(screenshot),
            ..Default::default()
        }
    }

    pub fn needs_upload(&self) -> bool {
        self.screenshot_url.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchWindowData {
    pub session: RunningSession,
    pub step_id: StepId,
    pub settings: CheckSettings,
    pub output: AppOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub as_expected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
}

// ============================================================================
// Results
// ============================================================================

/// Server verdict for a closed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResultsStatus {
    Passed,
    Unresolved,
    Failed,
    NotOpened,
}

impl fmt::Display for TestResultsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestResultsStatus::Passed => write!(f, "passed"),
            TestResultsStatus::Unresolved => write!(f, "unresolved"),
            TestResultsStatus::Failed => write!(f, "failed"),
            TestResultsStatus::NotOpened => write!(f, "not_opened"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    pub name: String,
    pub status: TestResultsStatus,
    pub steps: u32,
    pub matches: u32,
    pub mismatches: u32,
    pub missing: u32,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub is_aborted: bool,
}

impl TestResults {
    pub fn is_different(&self) -> bool {
        matches!(
            self.status,
            TestResultsStatus::Unresolved | TestResultsStatus::Failed
        )
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// One render job sent to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub step_id: StepId,
    pub url: String,
    pub dom: RenderDom,
    pub browser: BrowserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    Rendering,
    Rendered,
    Error,
}

impl fmt::Display for RenderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderStatus::Rendering => write!(f, "rendering"),
            RenderStatus::Rendered => write!(f, "rendered"),
            RenderStatus::Error => write!(f, "error"),
        }
    }
}

/// Acknowledgement of a render request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningRender {
    pub render_id: String,
    pub status: RenderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderStatusResults {
    pub render_id: String,
    pub status: RenderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RenderStatusResults {
    /// Output to match once a render has finished
    pub fn to_app_output(&self) -> AppOutput {
        AppOutput {
            tag: None,
            screenshot_url: self.image_location.clone(),
            dom_url: self.dom_location.clone(),
            screenshot: None,
        }
    }
}
