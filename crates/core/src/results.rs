//! Per-test outcomes and their aggregation

use serde::{Deserialize, Serialize};

use crate::running_test::TestState;
use crate::types::{TestDescriptor, TestId, TestResults, TestResultsStatus};

/// Final outcome of one test, published once the test is terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResultContainer {
    pub test_id: TestId,
    pub descriptor: TestDescriptor,
    pub state: TestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<TestResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestResultContainer {
    /// True when the test ended with an error or with differences
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
            || self
                .results
                .as_ref()
                .is_some_and(|r| r.is_different() && !r.is_aborted)
    }

    pub fn status(&self) -> Option<TestResultsStatus> {
        self.results.as_ref().map(|r| r.status)
    }

    pub fn failure_reason(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        self.results
            .as_ref()
            .filter(|r| r.is_different() && !r.is_aborted)
            .map(|r| format!("differences found ({})", r.status))
    }
}

/// All finished tests of a scheduler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestResultsSummary {
    pub results: Vec<TestResultContainer>,
    pub passed: usize,
    pub unresolved: usize,
    pub failed: usize,
    pub exceptions: usize,
    pub mismatches: u32,
    pub matches: u32,
    pub missing: u32,
}

impl TestResultsSummary {
    pub fn from_containers(mut results: Vec<TestResultContainer>) -> Self {
        results.sort_by(|a, b| {
            a.descriptor
                .test_name
                .cmp(&b.descriptor.test_name)
                .then_with(|| a.test_id.cmp(&b.test_id))
        });

        let mut summary = Self::default();
        for container in &results {
            if container.error.is_some() {
                summary.exceptions += 1;
            }
            if let Some(r) = &container.results {
                match r.status {
                    TestResultsStatus::Passed => summary.passed += 1,
                    TestResultsStatus::Unresolved => summary.unresolved += 1,
                    TestResultsStatus::Failed => summary.failed += 1,
                    TestResultsStatus::NotOpened => {}
                }
                summary.matches += r.matches;
                summary.mismatches += r.mismatches;
                summary.missing += r.missing;
            }
        }
        summary.results = results;
        summary
    }

    /// First container that counts as a failure, in report order
    pub fn first_failure(&self) -> Option<&TestResultContainer> {
        self.results.iter().find(|c| c.is_failure())
    }

    pub fn all_passed(&self) -> bool {
        self.first_failure().is_none()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
