//! One pending check step

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{AppOutput, CheckSettings, MatchResult, RenderRequest, RenderStatusResults, StepId, TestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckTaskState {
    /// Waiting for its page resources to be collected
    Pending,
    /// Render requested, result not in yet
    RenderPending,
    /// Output available, not dispatched
    Ready,
    InFlight,
    Completed,
    Failed,
}

impl fmt::Display for CheckTaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckTaskState::Pending => write!(f, "pending"),
            CheckTaskState::RenderPending => write!(f, "render_pending"),
            CheckTaskState::Ready => write!(f, "ready"),
            CheckTaskState::InFlight => write!(f, "in_flight"),
            CheckTaskState::Completed => write!(f, "completed"),
            CheckTaskState::Failed => write!(f, "failed"),
        }
    }
}

/// What the check service needs to match a step
pub struct MatchPayload {
    pub settings: CheckSettings,
    pub output: AppOutput,
    pub render_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckTask {
    step_id: StepId,
    test_id: TestId,
    settings: CheckSettings,
    state: CheckTaskState,
    output: Option<AppOutput>,
    render_request: Option<RenderRequest>,
    render_result: Option<RenderStatusResults>,
    result: Option<MatchResult>,
}

impl CheckTask {
    /// A step whose output was captured by the caller
    pub fn with_output(test_id: TestId, step_id: StepId, settings: CheckSettings, output: AppOutput) -> Self {
        Self {
            step_id,
            test_id,
            settings,
            state: CheckTaskState::Ready,
            output: Some(output),
            render_request: None,
            render_result: None,
            result: None,
        }
    }

    /// A step whose output comes from a server-side render
    pub fn for_render(test_id: TestId, step_id: StepId, settings: CheckSettings) -> Self {
        Self {
            step_id,
            test_id,
            settings,
            state: CheckTaskState::Pending,
            output: None,
            render_request: None,
            render_result: None,
            result: None,
        }
    }

    pub fn step_id(&self) -> StepId {
        self.step_id
    }

    pub fn test_id(&self) -> TestId {
        self.test_id
    }

    pub fn state(&self) -> CheckTaskState {
        self.state
    }

    pub fn settings(&self) -> &CheckSettings {
        &self.settings
    }

    pub fn has_supplied_output(&self) -> bool {
        self.output.is_some()
    }

    /// Output is either supplied or rendered
    pub fn is_render_finished(&self) -> bool {
        !matches!(self.state, CheckTaskState::Pending | CheckTaskState::RenderPending)
    }

    pub fn render_request(&self) -> Option<&RenderRequest> {
        self.render_request.as_ref()
    }

    pub fn set_render_request(&mut self, request: RenderRequest) {
        self.render_request = Some(request);
        self.state = CheckTaskState::RenderPending;
    }

    pub fn set_render_result(&mut self, result: RenderStatusResults) {
        self.render_result = Some(result);
        self.state = CheckTaskState::Ready;
    }

    /// Take what the check service needs and mark the task in flight
    pub fn dispatch(&mut self) -> MatchPayload {
        self.state = CheckTaskState::InFlight;
        let (output, render_id) = match (self.output.take(), &self.render_result) {
            (Some(output), _) => (output, None),
            (None, Some(rendered)) => (rendered.to_app_output(), Some(rendered.render_id.clone())),
            (None, None) => (AppOutput::default(), None),
        };
        MatchPayload {
            settings: self.settings.clone(),
            output,
            render_id,
        }
    }

    pub fn complete(&mut self, result: MatchResult) {
        self.result = Some(result);
        self.state = CheckTaskState::Completed;
    }

    pub fn fail(&mut self) {
        self.state = CheckTaskState::Failed;
    }

    pub fn result(&self) -> Option<&MatchResult> {
        self.result.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RenderStatus;

    #[test]
    fn test_supplied_output_is_ready() {
        let task = CheckTask::with_output(
            TestId::new(),
            StepId::new(),
            CheckSettings::named("home"),
            AppOutput::from_screenshot(vec![1]),
        );
        assert_eq!(task.state(), CheckTaskState::Ready);
        assert!(task.is_render_finished());
    }

    #[test]
    fn test_render_lifecycle() {
        let mut task = CheckTask::for_render(TestId::new(), StepId::new(), CheckSettings::named("home"));
        assert_eq!(task.state(), CheckTaskState::Pending);
        assert!(!task.is_render_finished());

        task.set_render_result(RenderStatusResults {
            render_id: "r-1".into(),
            status: RenderStatus::Rendered,
            image_location: Some("https://snapgrid.local/renders/r-1.png".into()),
            dom_location: None,
            error: None,
        });
        assert!(task.is_render_finished());

        let payload = task.dispatch();
        assert_eq!(payload.render_id.as_deref(), Some("r-1"));
        assert!(!payload.output.needs_upload());
        assert_eq!(task.state(), CheckTaskState::InFlight);
        assert!(task.is_render_finished());
    }

    #[test]
    fn test_dispatch_moves_screenshot_out() {
        let mut task = CheckTask::with_output(
            TestId::new(),
            StepId::new(),
            CheckSettings::named("home"),
            AppOutput::from_screenshot(vec![7, 7]),
        );
        let payload = task.dispatch();
        assert_eq!(payload.output.screenshot, Some(vec![7, 7]));
        assert!(task.is_render_finished());
    }
}
