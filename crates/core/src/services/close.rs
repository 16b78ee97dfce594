//! Session stop

use std::sync::Arc;
use tracing::debug;

use super::{BoundedService, ServiceOutcome, SlotRelease};
use crate::connector::ServerConnector;
use crate::types::{RunningSession, SessionStopInfo, TestId, TestResults};
use crate::GridError;

pub struct CloseInput {
    pub session: RunningSession,
    pub aborted: bool,
}

pub struct CloseService {
    inner: Arc<BoundedService<TestId, CloseInput, TestResults>>,
    connector: Arc<dyn ServerConnector>,
}

impl CloseService {
    pub fn new(connector: Arc<dyn ServerConnector>, concurrency: Option<usize>) -> Self {
        Self {
            inner: Arc::new(BoundedService::new("close", concurrency, SlotRelease::OnCompletion)),
            connector,
        }
    }

    pub fn add_input(&self, test_id: TestId, session: RunningSession, aborted: bool) {
        self.inner.add_input(test_id, CloseInput { session, aborted });
    }

    pub fn run(&self) -> usize {
        let connector = Arc::clone(&self.connector);
        self.inner.dispatch(move |test_id, input| {
            let connector = Arc::clone(&connector);
            async move {
                let info = SessionStopInfo {
                    session: input.session.clone(),
                    aborted: input.aborted,
                };
                match connector.stop_session(info).await {
                    Ok(mut results) => {
                        debug!("Session {} of test {} stopped", input.session.session_id, test_id);
                        results.url = input.session.url;
                        results.is_new = input.session.is_new;
                        results.is_aborted |= input.aborted;
                        ServiceOutcome::Done(results)
                    }
                    Err(e) => ServiceOutcome::Failed(GridError::CloseFailed(e.to_string())),
                }
            }
        })
    }

    pub fn get_succeeded_tasks(&self) -> Vec<(TestId, TestResults)> {
        self.inner.get_succeeded_tasks()
    }

    pub fn get_failed_tasks(&self) -> Vec<(TestId, GridError)> {
        self.inner.get_failed_tasks()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight_len()
    }
}
