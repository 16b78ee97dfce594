//! Caller-facing scheduler handle
//!
//! Callers only enqueue commands and read published snapshots; every state
//! transition happens on the service runner task.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::connector::{ResourceFetcher, ServerConnector, UnavailableFetcher};
use crate::resource::{new_resource_cache, FrameData, ResourceCache};
use crate::results::{TestResultContainer, TestResultsSummary};
use crate::runner::{Command, ServiceRunner};
use crate::running_test::TestState;
use crate::types::{AppOutput, CheckSettings, StepId, TestDescriptor, TestId};
use crate::{GridError, GridResult};

// ============================================================================
// Shared state
// ============================================================================

/// State visible to callers, written by the runner
pub(crate) struct SchedulerShared {
    running: AtomicBool,
    fatal: RwLock<Option<String>>,
    pub(crate) states: DashMap<TestId, TestState>,
    pub(crate) results: DashMap<TestId, TestResultContainer>,
    registered: Mutex<Vec<TestId>>,
    summary: Mutex<Option<(usize, TestResultsSummary)>>,
    concurrency: AtomicUsize,
    slots_in_use: AtomicUsize,
}

impl SchedulerShared {
    pub(crate) fn new(concurrency: usize) -> Self {
        Self {
            running: AtomicBool::new(true),
            fatal: RwLock::new(None),
            states: DashMap::new(),
            results: DashMap::new(),
            registered: Mutex::new(Vec::new()),
            summary: Mutex::new(None),
            concurrency: AtomicUsize::new(concurrency),
            slots_in_use: AtomicUsize::new(0),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Halt everything; waiting callers get the error instead of results
    pub(crate) fn record_fatal(&self, err: &GridError) {
        self.fatal.write().get_or_insert_with(|| err.to_string());
        self.set_stopped();
    }

    pub(crate) fn fatal(&self) -> Option<GridError> {
        self.fatal.read().clone().map(GridError::ExecutionCrashed)
    }

    /// Track a test whose open was accepted; the runner may already have published a later state
    fn register(&self, test_id: TestId) {
        self.states.entry(test_id).or_insert(TestState::Created);
        self.registered.lock().push(test_id);
    }

    pub(crate) fn publish_state(&self, test_id: TestId, state: TestState) {
        self.states.insert(test_id, state);
    }

    pub(crate) fn publish_result(&self, container: TestResultContainer) {
        let test_id = container.test_id;
        let state = container.state;
        self.results.insert(test_id, container);
        self.states.insert(test_id, state);
    }

    pub(crate) fn set_slots_in_use(&self, slots: usize) {
        self.slots_in_use.store(slots, Ordering::SeqCst);
    }

    fn registered(&self) -> Vec<TestId> {
        self.registered.lock().clone()
    }

    fn all_finished(&self) -> bool {
        self.registered
            .lock()
            .iter()
            .all(|id| self.results.contains_key(id))
    }

    /// Summary of every finished test; rebuilt only when a new test finished
    fn summary(&self) -> TestResultsSummary {
        let finished = self.results.len();
        let mut cached = self.summary.lock();
        if let Some((count, summary)) = cached.as_ref() {
            if *count == finished {
                return summary.clone();
            }
        }
        let containers = self.results.iter().map(|entry| entry.value().clone()).collect();
        let summary = TestResultsSummary::from_containers(containers);
        *cached = Some((finished, summary.clone()));
        summary
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    connector: Arc<dyn ServerConnector>,
    fetcher: Arc<dyn ResourceFetcher>,
    cache: ResourceCache,
}

impl SchedulerBuilder {
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Share (or pre-seed) the cache used by every crawl of this scheduler
    pub fn with_resource_cache(mut self, cache: ResourceCache) -> Self {
        self.cache = cache;
        self
    }

    /// Spawn the service runner; must be called inside a tokio runtime
    pub fn start(self) -> GridResult<Scheduler> {
        self.config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SchedulerShared::new(self.config.test_concurrency));
        let runner = ServiceRunner::new(
            self.config.clone(),
            Arc::clone(&shared),
            rx,
            self.connector,
            self.fetcher,
            self.cache,
        );
        let handle = tokio::spawn(runner.run());
        info!("Scheduler started with concurrency {}", self.config.test_concurrency);

        Ok(Scheduler {
            shared,
            commands: tx,
            config: self.config,
            runner: Arc::new(Mutex::new(Some(handle))),
        })
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Handle to a running scheduler; cheap to clone
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    commands: mpsc::UnboundedSender<Command>,
    config: SchedulerConfig,
    runner: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn builder(connector: Arc<dyn ServerConnector>) -> SchedulerBuilder {
        SchedulerBuilder {
            config: SchedulerConfig::default(),
            connector,
            fetcher: Arc::new(UnavailableFetcher),
            cache: new_resource_cache(),
        }
    }

    pub fn start(config: SchedulerConfig, connector: Arc<dyn ServerConnector>) -> GridResult<Self> {
        Self::builder(connector).with_config(config).start()
    }

    fn send(&self, command: Command) -> GridResult<()> {
        if let Some(err) = self.shared.fatal() {
            return Err(err);
        }
        if !self.shared.is_running() {
            return Err(GridError::SchedulerStopped);
        }
        self.commands
            .send(command)
            .map_err(|_| GridError::SchedulerStopped)
    }

    fn ensure_known(&self, test_id: TestId) -> GridResult<()> {
        if self.shared.states.contains_key(&test_id) {
            Ok(())
        } else {
            Err(GridError::UnknownTest(test_id.to_string()))
        }
    }

    /// Register a test and queue its open
    pub fn open(&self, descriptor: TestDescriptor) -> GridResult<TestId> {
        let test_id = TestId::new();
        if let Some(err) = self.shared.fatal() {
            return Err(err);
        }
        let name = descriptor.test_name.clone();
        self.send(Command::Open {
            test_id,
            descriptor,
        })?;
        self.shared.register(test_id);
        debug!("Registered test {} ({})", test_id, name);
        Ok(test_id)
    }

    /// Queue a check with caller-supplied output
    pub fn check(&self, test_id: TestId, settings: CheckSettings, output: AppOutput) -> GridResult<StepId> {
        self.ensure_known(test_id)?;
        let step_id = StepId::new();
        self.send(Command::Check {
            test_id,
            step_id,
            settings,
            output,
        })?;
        Ok(step_id)
    }

    /// Queue one rendered check per target, all sharing one crawl of `frame`
    pub fn check_dom(&self, frame: FrameData, targets: Vec<(TestId, CheckSettings)>) -> GridResult<Vec<StepId>> {
        for (test_id, _) in &targets {
            self.ensure_known(*test_id)?;
        }
        let targets: Vec<(TestId, StepId, CheckSettings)> = targets
            .into_iter()
            .map(|(test_id, settings)| (test_id, StepId::new(), settings))
            .collect();
        let steps = targets.iter().map(|(_, step_id, _)| *step_id).collect();
        self.send(Command::CheckDom { frame, targets })?;
        Ok(steps)
    }

    /// Close once every queued check has finished
    pub fn close(&self, test_id: TestId) -> GridResult<()> {
        self.ensure_known(test_id)?;
        self.send(Command::Close { test_id })
    }

    /// Drop pending checks and end the test as aborted
    pub fn abort(&self, test_id: TestId) -> GridResult<()> {
        self.ensure_known(test_id)?;
        self.send(Command::Abort { test_id })
    }

    pub fn test_state(&self, test_id: TestId) -> Option<TestState> {
        self.shared.states.get(&test_id).map(|s| *s.value())
    }

    pub fn result(&self, test_id: TestId) -> Option<TestResultContainer> {
        self.shared.results.get(&test_id).map(|c| c.value().clone())
    }

    /// Wait until one test is terminal
    pub async fn wait_for_test(&self, test_id: TestId, throw_on_failure: bool) -> GridResult<TestResultContainer> {
        self.ensure_known(test_id)?;
        loop {
            if let Some(err) = self.shared.fatal() {
                return Err(err);
            }
            if let Some(container) = self.result(test_id) {
                if throw_on_failure {
                    if let Some(reason) = container.failure_reason() {
                        return Err(GridError::TestFailed {
                            test_id: test_id.to_string(),
                            reason,
                        });
                    }
                }
                return Ok(container);
            }
            if !self.shared.is_running() {
                return Err(GridError::SchedulerStopped);
            }
            tokio::time::sleep(self.config.results_poll_interval()).await;
        }
    }

    /// Collect per-test outcomes.
    ///
    /// Blocking mode requests close for every unfinished test and waits until all
    /// of them are terminal. Non-blocking mode reports the tests finished so far.
    pub async fn get_all_results(&self, blocking: bool, throw_on_failure: bool) -> GridResult<TestResultsSummary> {
        if let Some(err) = self.shared.fatal() {
            return Err(err);
        }

        if blocking {
            for test_id in self.shared.registered() {
                if !self.shared.results.contains_key(&test_id) {
                    self.send(Command::Close { test_id })?;
                }
            }
            loop {
                if let Some(err) = self.shared.fatal() {
                    return Err(err);
                }
                if self.shared.all_finished() {
                    break;
                }
                if !self.shared.is_running() {
                    return Err(GridError::SchedulerStopped);
                }
                tokio::time::sleep(self.config.results_poll_interval()).await;
            }
        }

        let summary = self.shared.summary();
        if throw_on_failure {
            if let Some(failed) = summary.first_failure() {
                return Err(GridError::TestFailed {
                    test_id: failed.test_id.to_string(),
                    reason: failed.failure_reason().unwrap_or_default(),
                });
            }
        }
        Ok(summary)
    }

    /// Change the admission limit at runtime
    pub fn set_concurrency(&self, concurrency: usize) -> GridResult<()> {
        if concurrency == 0 {
            return Err(GridError::InvalidConfig(
                "test concurrency must be at least 1".to_string(),
            ));
        }
        self.send(Command::SetConcurrency(concurrency))?;
        self.shared.concurrency.store(concurrency, Ordering::SeqCst);
        Ok(())
    }

    pub fn concurrency(&self) -> usize {
        self.shared.concurrency.load(Ordering::SeqCst)
    }

    /// Sessions currently holding an admission slot, as of the last tick
    pub fn slots_in_use(&self) -> usize {
        self.shared.slots_in_use.load(Ordering::SeqCst)
    }

    /// Fatal error that halted the runner, if any
    pub fn error(&self) -> Option<GridError> {
        self.shared.fatal()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Ask the runner to stop after its current tick
    pub fn stop(&self) {
        self.shared.set_stopped();
    }

    /// Stop and wait for the runner task to exit
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.runner.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<SchedulerShared> {
        &self.shared
    }
}
