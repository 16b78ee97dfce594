//! YAML test suites for `snapgrid run`

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use snapgrid_core::{BrowserInfo, SimulatedServerConfig, StaticResourceFetcher};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// A suite: every test runs once per browser
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suite {
    pub app_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Overrides the configured test concurrency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub server: SimulatedServerConfig,
    #[serde(default = "default_browsers")]
    pub browsers: Vec<BrowserInfo>,
    /// Static resources served to rendered steps, keyed by absolute URL
    #[serde(default)]
    pub site: BTreeMap<String, SiteResource>,
    pub tests: Vec<TestSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteResource {
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    /// Abort instead of closing once every step was submitted
    #[serde(default)]
    pub abort: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// A plain name is a captured screenshot; a page is rendered server-side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepSpec {
    Screenshot(String),
    Page {
        name: String,
        url: String,
        #[serde(default)]
        resources: Vec<String>,
    },
}

impl StepSpec {
    pub fn name(&self) -> &str {
        match self {
            StepSpec::Screenshot(name) => name,
            StepSpec::Page { name, .. } => name,
        }
    }
}

fn default_browsers() -> Vec<BrowserInfo> {
    vec![BrowserInfo::default()]
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

impl Suite {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading suite {}", path.display()))?;
        let suite: Suite = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing suite {}", path.display()))?;
        suite.validate()?;
        Ok(suite)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tests.is_empty() {
            bail!("suite has no tests");
        }
        if self.browsers.is_empty() {
            bail!("suite has no browsers");
        }
        let mut seen = HashSet::new();
        for test in &self.tests {
            if !seen.insert(test.name.as_str()) {
                bail!("duplicate test name {}", test.name);
            }
        }
        Ok(())
    }

    /// Fetcher serving the suite's site map
    pub fn fetcher(&self) -> StaticResourceFetcher {
        self.site
            .iter()
            .fold(StaticResourceFetcher::new(), |fetcher, (url, resource)| {
                fetcher.with_resource(url.clone(), resource.content_type.clone(), resource.content.clone())
            })
    }

    /// Number of test runs (tests times browsers)
    pub fn run_count(&self) -> usize {
        self.tests.len() * self.browsers.len()
    }
}
