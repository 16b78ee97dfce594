//! Session start
//!
//! The slot taken at dispatch stays held after a successful open; it is handed
//! back by the close phase through `decrement_concurrency`.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{BoundedService, ServiceOutcome, SlotRelease};
use crate::config::OpenRetryConfig;
use crate::connector::ServerConnector;
use crate::types::{RunningSession, SessionStartInfo, StartSessionOutcome, TestId};
use crate::{GridError, GridResult};

pub struct OpenInput {
    pub info: SessionStartInfo,
    /// First `ConcurrencyFull` answer; back-off and timeout are measured from here
    pub first_rejected_at: Option<Instant>,
}

impl OpenInput {
    pub fn new(info: SessionStartInfo) -> Self {
        Self {
            info,
            first_rejected_at: None,
        }
    }
}

pub struct OpenService {
    inner: Arc<BoundedService<TestId, OpenInput, RunningSession>>,
    connector: Arc<dyn ServerConnector>,
    retry: OpenRetryConfig,
}

impl OpenService {
    pub fn new(connector: Arc<dyn ServerConnector>, concurrency: usize, retry: OpenRetryConfig) -> Self {
        Self {
            inner: Arc::new(BoundedService::new("open", Some(concurrency), SlotRelease::Explicit)),
            connector,
            retry,
        }
    }

    pub fn add_input(&self, test_id: TestId, info: SessionStartInfo) {
        self.inner.add_input(test_id, OpenInput::new(info));
    }

    /// Withdraw an open that has not reached the server (or is waiting out back-off)
    pub fn remove_pending(&self, test_id: &TestId) -> bool {
        self.inner.remove_pending(test_id).is_some()
    }

    pub fn run(&self) -> usize {
        let connector = Arc::clone(&self.connector);
        let retry = self.retry.clone();
        self.inner.dispatch(move |test_id, input| {
            let connector = Arc::clone(&connector);
            let retry = retry.clone();
            async move { start_session(connector, retry, test_id, input).await }
        })
    }

    pub fn get_succeeded_tasks(&self) -> Vec<(TestId, RunningSession)> {
        self.inner.get_succeeded_tasks()
    }

    pub fn get_failed_tasks(&self) -> Vec<(TestId, GridError)> {
        self.inner.get_failed_tasks()
    }

    /// Free the slot of a test whose session is gone
    pub fn decrement_concurrency(&self) {
        self.inner.decrement_concurrency();
    }

    pub fn set_concurrency_limit(&self, limit: usize) {
        self.inner.set_concurrency_limit(Some(limit));
    }

    pub fn slots_in_use(&self) -> usize {
        self.inner.slots_in_use()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending_len()
    }
}

async fn start_session(
    connector: Arc<dyn ServerConnector>,
    retry: OpenRetryConfig,
    test_id: TestId,
    mut input: OpenInput,
) -> ServiceOutcome<OpenInput, RunningSession> {
    match connector.start_session(input.info.clone()).await {
        Ok(StartSessionOutcome::Started(session)) => {
            debug!("Session {} started for test {}", session.session_id, test_id);
            ServiceOutcome::Done(session)
        }
        Ok(StartSessionOutcome::ConcurrencyFull) => match backoff(&retry, &mut input) {
            Ok(at) => {
                info!(
                    "Server concurrency limit reached, retrying open of test {} in {:?}",
                    test_id,
                    at.saturating_duration_since(Instant::now())
                );
                ServiceOutcome::RetryAt(input, at)
            }
            Err(e) => {
                warn!("Giving up opening test {}: {}", test_id, e);
                ServiceOutcome::Failed(e)
            }
        },
        Err(e) => ServiceOutcome::Failed(e),
    }
}

/// Next attempt time, or a timeout error once the open has waited too long
fn backoff(retry: &OpenRetryConfig, input: &mut OpenInput) -> GridResult<Instant> {
    let waited = input.first_rejected_at.get_or_insert_with(Instant::now).elapsed();
    if waited >= retry.open_timeout() {
        return Err(GridError::OpenTimeout {
            waited_ms: waited.as_millis() as u64,
        });
    }
    Ok(Instant::now() + retry.delay_after(waited))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedConnector, SimulatedServerConfig};
    use crate::types::TestDescriptor;
    use std::time::Duration;

    fn info(name: &str) -> SessionStartInfo {
        SessionStartInfo::new(TestId::new(), &TestDescriptor::new("app", name))
    }

    async fn settle(service: &OpenService) {
        for _ in 0..200 {
            if service.inner.in_flight_len() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_open_holds_slot() {
        let connector = Arc::new(SimulatedConnector::new(SimulatedServerConfig::default()));
        let service = OpenService::new(connector, 2, OpenRetryConfig::immediate());

        let id = TestId::new();
        service.add_input(id, info("a"));
        assert_eq!(service.run(), 1);
        settle(&service).await;

        let opened = service.get_succeeded_tasks();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].0, id);
        assert_eq!(service.slots_in_use(), 1);

        service.decrement_concurrency();
        assert_eq!(service.slots_in_use(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_full_requeues_without_failure() {
        let connector = Arc::new(SimulatedConnector::new(SimulatedServerConfig {
            capacity: Some(0),
            ..Default::default()
        }));
        let service = OpenService::new(connector.clone(), 3, OpenRetryConfig::default());

        service.add_input(TestId::new(), info("a"));
        service.run();
        settle(&service).await;

        assert!(service.get_failed_tasks().is_empty());
        assert!(service.get_succeeded_tasks().is_empty());
        assert_eq!(service.slots_in_use(), 0);
        assert_eq!(service.pending_len(), 1);
        assert_eq!(connector.stats().concurrency_full_responses, 1);

        // held back by the 2 second delay
        assert_eq!(service.run(), 0);
    }

    #[tokio::test]
    async fn test_open_timeout() {
        let connector = Arc::new(SimulatedConnector::new(SimulatedServerConfig {
            capacity: Some(0),
            ..Default::default()
        }));
        let retry = OpenRetryConfig {
            open_timeout_ms: 0,
            ..OpenRetryConfig::immediate()
        };
        let service = OpenService::new(connector, 1, retry);

        service.add_input(TestId::new(), info("a"));
        service.run();
        settle(&service).await;

        let failed = service.get_failed_tasks();
        assert_eq!(failed.len(), 1);
        assert!(matches!(failed[0].1, GridError::OpenTimeout { .. }));
        // the slot is handed back by the close phase
        assert_eq!(service.slots_in_use(), 1);
    }

    #[tokio::test]
    async fn test_queue_wait_does_not_count_towards_timeout() {
        let connector = Arc::new(SimulatedConnector::new(SimulatedServerConfig {
            capacity: Some(0),
            ..Default::default()
        }));
        let retry = OpenRetryConfig {
            open_timeout_ms: 50,
            ..OpenRetryConfig::immediate()
        };
        let service = OpenService::new(connector.clone(), 1, retry);

        service.add_input(TestId::new(), info("a"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        service.run();
        settle(&service).await;

        assert!(service.get_failed_tasks().is_empty());
        assert_eq!(service.pending_len(), 1);
        assert_eq!(service.slots_in_use(), 0);
        assert_eq!(connector.stats().concurrency_full_responses, 1);

        // retried right away, still inside the window opened by the first rejection
        assert_eq!(service.run(), 1);
        settle(&service).await;
        assert!(service.get_failed_tasks().is_empty());
        assert_eq!(connector.stats().concurrency_full_responses, 2);
    }

    #[test]
    fn test_backoff_starts_at_first_rejection() {
        let retry = OpenRetryConfig::default();
        let mut input = OpenInput::new(info("a"));
        assert!(input.first_rejected_at.is_none());

        let at = backoff(&retry, &mut input).unwrap();
        let first = input.first_rejected_at.unwrap();
        assert!(at >= first + Duration::from_millis(retry.initial_delay_ms));
        assert!(at < first + Duration::from_millis(retry.initial_delay_ms) + Duration::from_secs(1));

        backoff(&retry, &mut input).unwrap();
        assert_eq!(input.first_rejected_at, Some(first));
    }
}
