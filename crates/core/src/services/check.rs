//! Screenshot upload and window matching
//!
//! A check may be dispatched before its test has a session. Such a check
//! uploads its screenshot, then waits in the parked set until
//! `attach_session` (open succeeded) or `discard` (open failed or aborted).

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

use super::{BoundedService, ServiceOutcome, SlotRelease};
use crate::connector::ServerConnector;
use crate::types::*;
use crate::GridError;

pub struct CheckInput {
    pub test_id: TestId,
    pub session: Option<RunningSession>,
    pub settings: CheckSettings,
    pub output: AppOutput,
    pub render_id: Option<String>,
}

#[derive(Default)]
struct ParkedChecks {
    sessions: HashMap<TestId, RunningSession>,
    awaiting: HashMap<TestId, Vec<(StepId, CheckInput)>>,
    discarded: HashSet<TestId>,
}

pub struct CheckService {
    inner: Arc<BoundedService<StepId, CheckInput, MatchResult>>,
    connector: Arc<dyn ServerConnector>,
    parked: Arc<Mutex<ParkedChecks>>,
}

impl CheckService {
    pub fn new(connector: Arc<dyn ServerConnector>, concurrency: Option<usize>) -> Self {
        Self {
            inner: Arc::new(BoundedService::new("check", concurrency, SlotRelease::OnCompletion)),
            connector,
            parked: Arc::new(Mutex::new(ParkedChecks::default())),
        }
    }

    pub fn add_input(&self, step_id: StepId, input: CheckInput) {
        self.inner.add_input(step_id, input);
    }

    pub fn run(&self) -> usize {
        let connector = Arc::clone(&self.connector);
        let parked = Arc::clone(&self.parked);
        self.inner.dispatch(move |step_id, input| {
            let connector = Arc::clone(&connector);
            let parked = Arc::clone(&parked);
            async move { check_window(connector, parked, step_id, input).await }
        })
    }

    /// Session of a test became known; wake its parked checks in their original order
    pub fn attach_session(&self, test_id: TestId, session: RunningSession) -> usize {
        let mut parked = self.parked.lock();
        let waiting = parked.awaiting.remove(&test_id).unwrap_or_default();
        let count = waiting.len();
        for (step_id, mut input) in waiting.into_iter().rev() {
            input.session = Some(session.clone());
            self.inner.requeue_front(step_id, input, None);
        }
        parked.sessions.insert(test_id, session);
        count
    }

    /// Drop every queued or parked check of a test; returns the dropped step ids.
    ///
    /// Uploads still running for the test end as failures, which the runner ignores.
    pub fn discard(&self, test_id: TestId) -> Vec<StepId> {
        let mut dropped: Vec<StepId> = self
            .inner
            .remove_pending_where(|_, input| input.test_id == test_id)
            .into_iter()
            .map(|(step_id, _)| step_id)
            .collect();

        let mut parked = self.parked.lock();
        parked.sessions.remove(&test_id);
        parked.discarded.insert(test_id);
        if let Some(waiting) = parked.awaiting.remove(&test_id) {
            dropped.extend(waiting.into_iter().map(|(step_id, _)| step_id));
        }
        if !dropped.is_empty() {
            debug!("Discarded {} checks of test {}", dropped.len(), test_id);
        }
        dropped
    }

    /// Stop remembering discarded tests that `keep` no longer vouches for
    pub fn forget_discarded(&self, keep: impl Fn(&TestId) -> bool) -> usize {
        let mut parked = self.parked.lock();
        let before = parked.discarded.len();
        parked.discarded.retain(|test_id| keep(test_id));
        before - parked.discarded.len()
    }

    pub fn discarded_len(&self) -> usize {
        self.parked.lock().discarded.len()
    }

    pub fn parked_len(&self, test_id: &TestId) -> usize {
        self.parked.lock().awaiting.get(test_id).map_or(0, Vec::len)
    }

    pub fn get_succeeded_tasks(&self) -> Vec<(StepId, MatchResult)> {
        self.inner.get_succeeded_tasks()
    }

    pub fn get_failed_tasks(&self) -> Vec<(StepId, GridError)> {
        self.inner.get_failed_tasks()
    }

    #[cfg(test)]
    pub(crate) fn settle(&self, step_id: StepId, outcome: ServiceOutcome<CheckInput, MatchResult>) {
        self.inner.settle(step_id, outcome);
    }
}

enum SessionLookup {
    Ready(RunningSession, CheckInput),
    Parked,
    Discarded(TestId),
}

fn lookup_session(parked: &Mutex<ParkedChecks>, step_id: StepId, input: CheckInput) -> SessionLookup {
    if let Some(session) = input.session.clone() {
        return SessionLookup::Ready(session, input);
    }
    let mut parked = parked.lock();
    if parked.discarded.contains(&input.test_id) {
        return SessionLookup::Discarded(input.test_id);
    }
    if let Some(session) = parked.sessions.get(&input.test_id).cloned() {
        return SessionLookup::Ready(session, input);
    }
    trace!("Check {} parked until test {} opens", step_id, input.test_id);
    parked.awaiting.entry(input.test_id).or_default().push((step_id, input));
    SessionLookup::Parked
}

async fn check_window(
    connector: Arc<dyn ServerConnector>,
    parked: Arc<Mutex<ParkedChecks>>,
    step_id: StepId,
    mut input: CheckInput,
) -> ServiceOutcome<CheckInput, MatchResult> {
    if input.output.needs_upload() {
        let Some(image) = input.output.screenshot.take() else {
            return ServiceOutcome::Failed(GridError::UploadFailed(format!(
                "step {} has neither a screenshot nor a screenshot url",
                step_id
            )));
        };
        match connector.upload_image(image).await {
            Ok(location) => input.output.screenshot_url = Some(location),
            Err(e) => return ServiceOutcome::Failed(GridError::UploadFailed(e.to_string())),
        }
    }

    let (session, input) = match lookup_session(&parked, step_id, input) {
        SessionLookup::Ready(session, input) => (session, input),
        SessionLookup::Parked => return ServiceOutcome::Parked,
        SessionLookup::Discarded(test_id) => {
            return ServiceOutcome::Failed(GridError::NeverOpened(test_id.to_string()))
        }
    };

    let data = MatchWindowData {
        session,
        step_id,
        settings: input.settings,
        output: input.output,
        render_id: input.render_id,
    };
    match connector.match_window(data).await {
        Ok(result) => ServiceOutcome::Done(result),
        Err(e) => ServiceOutcome::Failed(GridError::MatchFailed(e.to_string())),
    }
}
