//! Per-test state machine
//!
//! ```text
//! Created -> Opening -> Open -> Closing -> Closed | Aborted
//!               |                  \----> Failed
//!               +--> OpenFailed -> Failed (never opened)
//! Created | Opening (open still queued) -> Aborted
//! ```
//!
//! Only the service runner mutates a `RunningTest`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::check_task::{CheckTask, CheckTaskState};
use crate::results::TestResultContainer;
use crate::types::*;
use crate::{GridError, GridResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestState {
    Created,
    Opening,
    Open,
    OpenFailed,
    Closing,
    Closed,
    Aborted,
    Failed,
}

impl TestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TestState::Closed | TestState::Aborted | TestState::Failed)
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestState::Created => write!(f, "created"),
            TestState::Opening => write!(f, "opening"),
            TestState::Open => write!(f, "open"),
            TestState::OpenFailed => write!(f, "open_failed"),
            TestState::Closing => write!(f, "closing"),
            TestState::Closed => write!(f, "closed"),
            TestState::Aborted => write!(f, "aborted"),
            TestState::Failed => write!(f, "failed"),
        }
    }
}

/// Whether the caller (or an error) asked the test to end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseIntent {
    None,
    Close,
    Abort,
}

pub struct RunningTest {
    id: TestId,
    descriptor: TestDescriptor,
    state: TestState,
    session: Option<RunningSession>,
    tasks: Vec<CheckTask>,
    close_intent: CloseIntent,
    error: Option<String>,
    match_results: Vec<(StepId, MatchResult)>,
    results: Option<TestResults>,
    parallel_steps: usize,
}

impl RunningTest {
    pub fn new(id: TestId, descriptor: TestDescriptor, parallel_steps: usize) -> Self {
        Self {
            id,
            descriptor,
            state: TestState::Created,
            session: None,
            tasks: Vec::new(),
            close_intent: CloseIntent::None,
            error: None,
            match_results: Vec::new(),
            results: None,
            parallel_steps: parallel_steps.max(1),
        }
    }

    pub fn id(&self) -> TestId {
        self.id
    }

    pub fn descriptor(&self) -> &TestDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> TestState {
        self.state
    }

    pub fn session(&self) -> Option<&RunningSession> {
        self.session.as_ref()
    }

    pub fn close_intent(&self) -> CloseIntent {
        self.close_intent
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn tasks(&self) -> &[CheckTask] {
        &self.tasks
    }

    pub fn match_results(&self) -> &[(StepId, MatchResult)] {
        &self.match_results
    }

    fn transition(&mut self, allowed: &[TestState], to: TestState) -> GridResult<()> {
        if !allowed.contains(&self.state) {
            return Err(GridError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    // ========================================================================
    // Open
    // ========================================================================

    pub fn prepare_for_open(&mut self) -> GridResult<SessionStartInfo> {
        self.transition(&[TestState::Created], TestState::Opening)?;
        Ok(SessionStartInfo::new(self.id, &self.descriptor))
    }

    pub fn open_completed(&mut self, session: RunningSession) -> GridResult<()> {
        self.transition(&[TestState::Opening], TestState::Open)?;
        self.session = Some(session);
        Ok(())
    }

    /// Record the failure and drop every step; the test then closes as never opened
    pub fn open_failed(&mut self, reason: String) -> GridResult<Vec<CheckTask>> {
        self.transition(&[TestState::Opening], TestState::OpenFailed)?;
        self.error.get_or_insert(reason);
        Ok(self.issue_abort())
    }

    /// Abort a test whose open never reached the server
    pub fn abort_unopened(&mut self) -> GridResult<Vec<CheckTask>> {
        self.transition(&[TestState::Created, TestState::Opening], TestState::Aborted)?;
        Ok(self.issue_abort())
    }

    // ========================================================================
    // Checks
    // ========================================================================

    pub fn add_check(&mut self, task: CheckTask) -> GridResult<()> {
        if self.state.is_terminal()
            || matches!(self.state, TestState::Closing | TestState::OpenFailed)
            || self.close_intent != CloseIntent::None
        {
            return Err(GridError::InvalidStateTransition {
                from: self.state.to_string(),
                to: "check".to_string(),
            });
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn task_mut(&mut self, step_id: StepId) -> Option<&mut CheckTask> {
        self.tasks.iter_mut().find(|t| t.step_id() == step_id)
    }

    /// Readiness of the task at `index`:
    /// its output exists, the test can take checks, and fewer than the
    /// parallel-step budget of earlier tasks are still unrendered.
    pub fn is_check_task_ready(&self, index: usize) -> bool {
        let Some(task) = self.tasks.get(index) else {
            return false;
        };
        if task.state() != CheckTaskState::Ready {
            return false;
        }

        let accepting = match self.state {
            TestState::Open => true,
            TestState::Opening => task.has_supplied_output(),
            _ => false,
        };
        if !accepting || self.close_intent == CloseIntent::Abort {
            return false;
        }

        let unrendered_before = self.tasks[..index]
            .iter()
            .filter(|t| !t.is_render_finished())
            .count();
        unrendered_before < self.parallel_steps
    }

    /// Steps that may be dispatched now, in step order
    pub fn ready_steps(&self) -> Vec<StepId> {
        (0..self.tasks.len())
            .filter(|&index| self.is_check_task_ready(index))
            .map(|index| self.tasks[index].step_id())
            .collect()
    }

    pub fn check_completed(&mut self, step_id: StepId, result: MatchResult) -> GridResult<()> {
        let index = self
            .tasks
            .iter()
            .position(|t| t.step_id() == step_id)
            .ok_or_else(|| GridError::UnknownStep(step_id.to_string()))?;
        let mut task = self.tasks.remove(index);
        task.complete(result.clone());
        self.match_results.push((step_id, result));
        Ok(())
    }

    /// A step failed: the test goes into exception mode
    pub fn check_failed(&mut self, step_id: StepId, reason: String) -> Vec<CheckTask> {
        if let Some(task) = self.task_mut(step_id) {
            task.fail();
        }
        self.set_exception(format!("step {} failed: {}", step_id, reason))
    }

    /// Keep the first error and abort
    pub fn set_exception(&mut self, reason: String) -> Vec<CheckTask> {
        self.error.get_or_insert(reason);
        self.issue_abort()
    }

    // ========================================================================
    // Close
    // ========================================================================

    pub fn issue_close(&mut self) {
        if self.close_intent == CloseIntent::None {
            self.close_intent = CloseIntent::Close;
        }
    }

    /// Mark the test aborted and hand back the steps it will never run
    pub fn issue_abort(&mut self) -> Vec<CheckTask> {
        self.close_intent = CloseIntent::Abort;
        std::mem::take(&mut self.tasks)
    }

    /// Takes checks and has not started closing
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
            && !matches!(self.state, TestState::Closing | TestState::OpenFailed)
            && self.close_intent != CloseIntent::Abort
    }

    /// Open has resolved, an end was requested and no step is left
    pub fn is_ready_to_close(&self) -> bool {
        matches!(self.state, TestState::Open | TestState::OpenFailed)
            && self.close_intent != CloseIntent::None
            && self.tasks.is_empty()
    }

    pub fn prepare_stop_session(&mut self) -> GridResult<(RunningSession, bool)> {
        let session = self.session.clone().ok_or_else(|| GridError::InvalidStateTransition {
            from: self.state.to_string(),
            to: TestState::Closing.to_string(),
        })?;
        self.transition(&[TestState::Open], TestState::Closing)?;
        Ok((session, self.close_intent == CloseIntent::Abort))
    }

    pub fn close_completed(&mut self, results: TestResults) -> GridResult<()> {
        let aborted = self.close_intent == CloseIntent::Abort;
        let to = if aborted { TestState::Aborted } else { TestState::Closed };
        self.transition(&[TestState::Closing], to)?;
        if !aborted && results.is_different() {
            self.error
                .get_or_insert_with(|| format!("differences found ({})", results.status));
        }
        self.results = Some(results);
        Ok(())
    }

    pub fn close_failed(&mut self, reason: String) -> GridResult<()> {
        self.transition(&[TestState::Closing], TestState::Failed)?;
        self.error.get_or_insert(reason);
        Ok(())
    }

    /// Close of a test that never opened
    pub fn finalize_never_opened(&mut self) -> GridResult<()> {
        self.transition(&[TestState::OpenFailed], TestState::Failed)?;
        let never_opened = GridError::NeverOpened(self.id.to_string()).to_string();
        self.error = Some(match self.error.take() {
            Some(cause) => format!("{}: {}", never_opened, cause),
            None => never_opened,
        });
        Ok(())
    }

    pub fn to_container(&self) -> TestResultContainer {
        TestResultContainer {
            test_id: self.id,
            descriptor: self.descriptor.clone(),
            state: self.state,
            results: self.results.clone(),
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check_task::CheckTask;
    use test_case::test_case;

    fn session() -> RunningSession {
        RunningSession {
            id: "1".into(),
            session_id: "1".into(),
            url: "https://snapgrid.local/sessions/1".into(),
            is_new: false,
        }
    }

    fn test() -> RunningTest {
        RunningTest::new(TestId::new(), TestDescriptor::new("app", "state"), 1)
    }

    fn supplied(test: &RunningTest) -> CheckTask {
        CheckTask::with_output(test.id(), StepId::new(), CheckSettings::named("s"), AppOutput::from_screenshot(vec![1]))
    }

    fn rendered(test: &RunningTest) -> CheckTask {
        CheckTask::for_render(test.id(), StepId::new(), CheckSettings::named("r"))
    }

    fn results(status: TestResultsStatus) -> TestResults {
        TestResults {
            name: "state".into(),
            status,
            steps: 0,
            matches: 0,
            mismatches: 0,
            missing: 0,
            url: String::new(),
            is_new: false,
            is_aborted: false,
        }
    }

    #[test]
    fn test_happy_path() {
        let mut t = test();
        t.prepare_for_open().unwrap();
        assert_eq!(t.state(), TestState::Opening);
        t.open_completed(session()).unwrap();

        let task = supplied(&t);
        let step = task.step_id();
        t.add_check(task).unwrap();
        assert_eq!(t.ready_steps(), vec![step]);

        t.issue_close();
        assert!(!t.is_ready_to_close());
        t.check_completed(step, MatchResult { as_expected: true, window_id: None }).unwrap();
        assert!(t.is_ready_to_close());

        let (_, aborted) = t.prepare_stop_session().unwrap();
        assert!(!aborted);
        t.close_completed(results(TestResultsStatus::Passed)).unwrap();
        assert_eq!(t.state(), TestState::Closed);
        assert!(t.to_container().error.is_none());
    }

    #[test]
    fn test_differences_become_error() {
        let mut t = test();
        t.prepare_for_open().unwrap();
        t.open_completed(session()).unwrap();
        t.issue_close();
        t.prepare_stop_session().unwrap();
        t.close_completed(results(TestResultsStatus::Unresolved)).unwrap();
        assert_eq!(t.error(), Some("differences found (unresolved)"));
    }

    #[test]
    fn test_budget_blocks_steps_behind_unrendered() {
        let mut t = test();
        t.prepare_for_open().unwrap();
        t.open_completed(session()).unwrap();

        let first = rendered(&t);
        let second = supplied(&t);
        let second_id = second.step_id();
        t.add_check(first).unwrap();
        t.add_check(second).unwrap();

        // the first step has no render yet, so nothing may run
        assert!(t.ready_steps().is_empty());

        let mut wide = RunningTest::new(TestId::new(), TestDescriptor::new("app", "wide"), 2);
        wide.prepare_for_open().unwrap();
        wide.open_completed(session()).unwrap();
        wide.add_check(rendered(&wide)).unwrap();
        let later = supplied(&wide);
        let later_id = later.step_id();
        wide.add_check(later).unwrap();
        assert_eq!(wide.ready_steps(), vec![later_id]);
        assert_ne!(second_id, later_id);
    }

    #[test]
    fn test_supplied_output_ready_while_opening() {
        let mut t = test();
        t.prepare_for_open().unwrap();
        t.add_check(supplied(&t)).unwrap();
        t.add_check(rendered(&t)).unwrap();
        assert_eq!(t.ready_steps().len(), 1);
    }

    #[test]
    fn test_abort_drops_steps() {
        let mut t = test();
        t.prepare_for_open().unwrap();
        t.open_completed(session()).unwrap();
        for _ in 0..3 {
            t.add_check(supplied(&t)).unwrap();
        }

        let dropped = t.issue_abort();
        assert_eq!(dropped.len(), 3);
        assert!(t.ready_steps().is_empty());
        assert!(!t.is_active());
        assert!(t.is_ready_to_close());

        let (_, aborted) = t.prepare_stop_session().unwrap();
        assert!(aborted);
        t.close_completed(results(TestResultsStatus::Unresolved)).unwrap();
        assert_eq!(t.state(), TestState::Aborted);
        assert!(t.error().is_none());
    }

    #[test]
    fn test_open_failure_closes_as_never_opened() {
        let mut t = test();
        t.prepare_for_open().unwrap();
        t.add_check(supplied(&t)).unwrap();

        let dropped = t.open_failed("server unreachable".into()).unwrap();
        assert_eq!(dropped.len(), 1);
        assert!(t.is_ready_to_close());

        t.finalize_never_opened().unwrap();
        assert_eq!(t.state(), TestState::Failed);
        let error = t.error().unwrap();
        assert!(error.contains("never opened"));
        assert!(error.contains("server unreachable"));
    }

    #[test]
    fn test_check_failure_sets_exception() {
        let mut t = test();
        t.prepare_for_open().unwrap();
        t.open_completed(session()).unwrap();
        let task = supplied(&t);
        let step = task.step_id();
        t.add_check(task).unwrap();
        t.add_check(supplied(&t)).unwrap();

        let dropped = t.check_failed(step, "timeout".into());
        assert_eq!(dropped.len(), 2);
        assert_eq!(t.close_intent(), CloseIntent::Abort);
        assert!(t.error().unwrap().contains("timeout"));
    }

    #[test_case(TestState::Closed ; "closed")]
    #[test_case(TestState::Aborted ; "aborted")]
    #[test_case(TestState::Failed ; "failed")]
    fn test_terminal_states(state: TestState) {
        assert!(state.is_terminal());
    }

    #[test]
    fn test_invalid_transition() {
        let mut t = test();
        let err = t.open_completed(session()).unwrap_err();
        assert!(err.is_fatal());
        assert!(t.add_check(supplied(&t)).is_ok());
        t.issue_close();
        assert!(t.add_check(supplied(&t)).is_err());
    }
}
