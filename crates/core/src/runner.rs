//! Service runner loop
//!
//! One tokio task owns every `RunningTest`. Each tick drains caller commands,
//! then runs the phases in fixed order: resource collection, render, open,
//! check, close. Completions are collected from the services' drainable
//! vectors; nothing else mutates test state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::check_task::{CheckTask, CheckTaskState};
use crate::config::SchedulerConfig;
use crate::connector::{ResourceFetcher, ServerConnector};
use crate::resource::{FrameData, ResourceCache};
use crate::running_test::{CloseIntent, RunningTest, TestState};
use crate::scheduler::SchedulerShared;
use crate::services::{
    CheckInput, CheckService, CloseService, OpenService, RenderInput, RenderService, ResourceCollectionService,
};
use crate::types::*;
use crate::{GridError, GridResult};

/// Caller requests, applied at the start of the next tick
#[derive(Debug)]
pub(crate) enum Command {
    Open {
        test_id: TestId,
        descriptor: TestDescriptor,
    },
    Check {
        test_id: TestId,
        step_id: StepId,
        settings: CheckSettings,
        output: AppOutput,
    },
    CheckDom {
        frame: FrameData,
        targets: Vec<(TestId, StepId, CheckSettings)>,
    },
    Close {
        test_id: TestId,
    },
    Abort {
        test_id: TestId,
    },
    SetConcurrency(usize),
}

pub(crate) struct ServiceRunner {
    config: SchedulerConfig,
    shared: Arc<SchedulerShared>,
    commands: mpsc::UnboundedReceiver<Command>,
    callers_gone: bool,

    collection: ResourceCollectionService,
    render: RenderService,
    open: OpenService,
    check: CheckService,
    close: CloseService,

    tests: HashMap<TestId, RunningTest>,
    /// Registration order; phases walk tests in this order
    order: Vec<TestId>,
    /// Steps whose completion may still arrive from a service
    step_owner: HashMap<StepId, TestId>,
    /// Crawl id -> the rendered steps waiting on it
    collections: HashMap<Uuid, Vec<(TestId, StepId)>>,
}

impl ServiceRunner {
    pub(crate) fn new(
        config: SchedulerConfig,
        shared: Arc<SchedulerShared>,
        commands: mpsc::UnboundedReceiver<Command>,
        connector: Arc<dyn ServerConnector>,
        fetcher: Arc<dyn ResourceFetcher>,
        cache: ResourceCache,
    ) -> Self {
        Self {
            collection: ResourceCollectionService::new(
                Arc::clone(&connector),
                fetcher,
                cache,
                config.crawler.clone(),
            ),
            render: RenderService::new(Arc::clone(&connector), config.render.clone()),
            open: OpenService::new(Arc::clone(&connector), config.test_concurrency, config.open_retry.clone()),
            check: CheckService::new(Arc::clone(&connector), config.check_concurrency),
            close: CloseService::new(connector, config.close_concurrency),
            config,
            shared,
            commands,
            callers_gone: false,
            tests: HashMap::new(),
            order: Vec::new(),
            step_owner: HashMap::new(),
            collections: HashMap::new(),
        }
    }

    /// Run until stopped, until a fatal error, or until every handle is dropped and no test is left
    pub(crate) async fn run(mut self) {
        info!("Service runner started");

        loop {
            if !self.shared.is_running() {
                break;
            }

            if let Err(e) = self.tick() {
                error!("Service runner halted: {}", e);
                self.shared.record_fatal(&e);
                break;
            }

            if self.callers_gone && self.tests.is_empty() {
                debug!("All scheduler handles dropped");
                break;
            }

            tokio::time::sleep(self.config.tick_interval()).await;
        }

        self.shared.set_stopped();
        info!("Service runner stopped with {} unfinished tests", self.tests.len());
    }

    /// One pass over every phase; an error here is fatal for the scheduler
    pub(crate) fn tick(&mut self) -> GridResult<()> {
        self.drain_commands()?;
        self.collection_phase()?;
        self.render_phase()?;
        self.open_phase()?;
        self.check_phase()?;
        self.close_phase()?;
        self.forget_finished();
        self.publish_states();
        Ok(())
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn drain_commands(&mut self) -> GridResult<()> {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.callers_gone = true;
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> GridResult<()> {
        match command {
            Command::Open { test_id, descriptor } => {
                let mut test = RunningTest::new(test_id, descriptor, self.config.parallel_steps_per_test);
                let info = test.prepare_for_open()?;
                debug!("Queueing open of test {} ({})", test_id, test.descriptor().test_name);
                self.open.add_input(test_id, info);
                self.tests.insert(test_id, test);
                self.order.push(test_id);
            }
            Command::Check {
                test_id,
                step_id,
                settings,
                output,
            } => {
                let task = CheckTask::with_output(test_id, step_id, settings, output);
                self.add_check(test_id, task);
            }
            Command::CheckDom { frame, targets } => {
                let mut accepted = Vec::with_capacity(targets.len());
                for (test_id, step_id, settings) in targets {
                    let task = CheckTask::for_render(test_id, step_id, settings);
                    if self.add_check(test_id, task) {
                        accepted.push((test_id, step_id));
                    }
                }
                if accepted.is_empty() {
                    debug!("No live test left for render of {}", frame.url);
                    return Ok(());
                }
                let id = Uuid::new_v4();
                debug!("Crawl {} of {} for {} steps", id, frame.url, accepted.len());
                self.collections.insert(id, accepted);
                self.collection.add_input(id, frame);
            }
            Command::Close { test_id } => {
                if let Some(test) = self.tests.get_mut(&test_id) {
                    test.issue_close();
                }
            }
            Command::Abort { test_id } => self.abort_test(test_id)?,
            Command::SetConcurrency(limit) => {
                info!("Test concurrency set to {}", limit);
                self.open.set_concurrency_limit(limit);
            }
        }
        Ok(())
    }

    /// Attach a step to its test; a step for a finished or closing test is dropped
    fn add_check(&mut self, test_id: TestId, task: CheckTask) -> bool {
        let step_id = task.step_id();
        let Some(test) = self.tests.get_mut(&test_id) else {
            warn!("Dropping step {}: test {} already finished", step_id, test_id);
            return false;
        };
        match test.add_check(task) {
            Ok(()) => {
                self.step_owner.insert(step_id, test_id);
                true
            }
            Err(e) => {
                warn!("Dropping step {} of test {}: {}", step_id, test_id, e);
                false
            }
        }
    }

    // ========================================================================
    // Phases
    // ========================================================================

    fn collection_phase(&mut self) -> GridResult<()> {
        self.collection.run();

        for (id, collected) in self.collection.get_succeeded_tasks() {
            let targets = self
                .collections
                .remove(&id)
                .ok_or_else(|| GridError::UnknownStep(format!("crawl {}", id)))?;
            for (test_id, step_id) in targets {
                let Some(test) = self.tests.get_mut(&test_id) else {
                    continue;
                };
                let browser = test.descriptor().browser.clone();
                let Some(task) = test.task_mut(step_id) else {
                    continue;
                };
                if task.state() != CheckTaskState::Pending {
                    continue;
                }
                let request = RenderRequest {
                    step_id,
                    url: collected.dom.url.clone(),
                    dom: collected.dom.clone(),
                    browser,
                    render_id: None,
                };
                task.set_render_request(request.clone());
                self.render.add_input(step_id, RenderInput { test_id, request });
            }
        }

        for (id, err) in self.collection.get_failed_tasks() {
            let targets = self
                .collections
                .remove(&id)
                .ok_or_else(|| GridError::UnknownStep(format!("crawl {}", id)))?;
            warn!("Crawl {} failed: {}", id, err);
            for (test_id, step_id) in targets {
                self.step_owner.remove(&step_id);
                self.fail_step(test_id, step_id, err.to_string());
            }
        }
        Ok(())
    }

    fn render_phase(&mut self) -> GridResult<()> {
        self.render.run();

        for (step_id, result) in self.render.get_succeeded_tasks() {
            let test_id = self.owner_of(step_id)?;
            let Some(task) = self.tests.get_mut(&test_id).and_then(|t| t.task_mut(step_id)) else {
                self.step_owner.remove(&step_id);
                continue;
            };
            debug!("Step {} rendered as {}", step_id, result.render_id);
            task.set_render_result(result);
        }

        for (step_id, err) in self.render.get_failed_tasks() {
            let test_id = self.owner_of(step_id)?;
            self.step_owner.remove(&step_id);
            self.fail_step(test_id, step_id, err.to_string());
        }
        Ok(())
    }

    fn open_phase(&mut self) -> GridResult<()> {
        // aborted while its open was in flight and then sent back to back-off
        let withdrawn: Vec<TestId> = self
            .order
            .iter()
            .copied()
            .filter(|id| {
                self.tests.get(id).is_some_and(|t| {
                    t.state() == TestState::Opening && t.close_intent() == CloseIntent::Abort
                }) && self.open.remove_pending(id)
            })
            .collect();
        for test_id in withdrawn {
            if let Some(test) = self.tests.get_mut(&test_id) {
                let dropped = test.abort_unopened()?;
                self.forget_steps(dropped);
            }
            self.finalize(test_id);
        }

        self.open.run();

        for (test_id, session) in self.open.get_succeeded_tasks() {
            let test = self
                .tests
                .get_mut(&test_id)
                .ok_or_else(|| GridError::UnknownTest(test_id.to_string()))?;
            info!("Test {} opened session {}", test_id, session.session_id);
            test.open_completed(session.clone())?;
            let woken = self.check.attach_session(test_id, session);
            if woken > 0 {
                debug!("Woke {} parked checks of test {}", woken, test_id);
            }
        }

        for (test_id, err) in self.open.get_failed_tasks() {
            let test = self
                .tests
                .get_mut(&test_id)
                .ok_or_else(|| GridError::UnknownTest(test_id.to_string()))?;
            warn!("Open of test {} failed: {}", test_id, err);
            let dropped = test.open_failed(err.to_string())?;
            self.forget_steps(dropped);
            self.discard_checks(test_id);
        }
        Ok(())
    }

    fn check_phase(&mut self) -> GridResult<()> {
        for (step_id, result) in self.check.get_succeeded_tasks() {
            let test_id = self.owner_of(step_id)?;
            self.step_owner.remove(&step_id);
            let Some(test) = self.tests.get_mut(&test_id) else {
                continue;
            };
            if test.task_mut(step_id).is_none() {
                debug!("Ignoring match of dropped step {}", step_id);
                continue;
            }
            test.check_completed(step_id, result)?;
        }

        for (step_id, err) in self.check.get_failed_tasks() {
            let test_id = self.owner_of(step_id)?;
            self.step_owner.remove(&step_id);
            self.fail_step(test_id, step_id, err.to_string());
        }

        for test_id in &self.order {
            let Some(test) = self.tests.get_mut(test_id) else {
                continue;
            };
            let session = test.session().cloned();
            for step_id in test.ready_steps() {
                let Some(task) = test.task_mut(step_id) else {
                    continue;
                };
                let payload = task.dispatch();
                self.check.add_input(
                    step_id,
                    CheckInput {
                        test_id: *test_id,
                        session: session.clone(),
                        settings: payload.settings,
                        output: payload.output,
                        render_id: payload.render_id,
                    },
                );
            }
        }
        self.check.run();
        Ok(())
    }

    fn close_phase(&mut self) -> GridResult<()> {
        for (test_id, results) in self.close.get_succeeded_tasks() {
            let test = self
                .tests
                .get_mut(&test_id)
                .ok_or_else(|| GridError::UnknownTest(test_id.to_string()))?;
            info!("Test {} closed: {}", test_id, results.status);
            test.close_completed(results)?;
            self.open.decrement_concurrency();
            self.finalize(test_id);
        }

        for (test_id, err) in self.close.get_failed_tasks() {
            let test = self
                .tests
                .get_mut(&test_id)
                .ok_or_else(|| GridError::UnknownTest(test_id.to_string()))?;
            warn!("Close of test {} failed: {}", test_id, err);
            test.close_failed(err.to_string())?;
            self.open.decrement_concurrency();
            self.finalize(test_id);
        }

        let mut never_opened = Vec::new();
        for test_id in &self.order {
            let Some(test) = self.tests.get_mut(test_id) else {
                continue;
            };
            if !test.is_ready_to_close() {
                continue;
            }
            match test.state() {
                TestState::OpenFailed => {
                    test.finalize_never_opened()?;
                    never_opened.push(*test_id);
                }
                _ => {
                    let (session, aborted) = test.prepare_stop_session()?;
                    debug!("Closing test {} (aborted: {})", test_id, aborted);
                    self.close.add_input(*test_id, session, aborted);
                }
            }
        }
        for test_id in never_opened {
            warn!("Test {} never opened", test_id);
            self.open.decrement_concurrency();
            self.finalize(test_id);
        }

        self.close.run();
        Ok(())
    }

    fn publish_states(&self) {
        for (test_id, test) in &self.tests {
            self.shared.publish_state(*test_id, test.state());
        }
        self.shared.set_slots_in_use(self.open.slots_in_use());
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn owner_of(&self, step_id: StepId) -> GridResult<TestId> {
        self.step_owner
            .get(&step_id)
            .copied()
            .ok_or_else(|| GridError::UnknownStep(step_id.to_string()))
    }

    fn abort_test(&mut self, test_id: TestId) -> GridResult<()> {
        let Some(test) = self.tests.get_mut(&test_id) else {
            debug!("Abort of finished test {} ignored", test_id);
            return Ok(());
        };

        let unopened = matches!(test.state(), TestState::Created | TestState::Opening)
            && self.open.remove_pending(&test_id);
        if unopened {
            info!("Test {} aborted before its open was sent", test_id);
            let dropped = test.abort_unopened()?;
            self.forget_steps(dropped);
            self.finalize(test_id);
            return Ok(());
        }

        if !test.is_active() {
            return Ok(());
        }
        info!("Aborting test {}", test_id);
        let dropped = test.issue_abort();
        self.forget_steps(dropped);
        self.discard_checks(test_id);
        Ok(())
    }

    /// A step failed: the test records the exception and drops its other steps
    fn fail_step(&mut self, test_id: TestId, step_id: StepId, reason: String) {
        let Some(test) = self.tests.get_mut(&test_id) else {
            return;
        };
        if !test.is_active() {
            debug!("Ignoring failure of step {} of inactive test {}", step_id, test_id);
            return;
        }
        warn!("Step {} of test {} failed: {}", step_id, test_id, reason);
        let dropped = test.check_failed(step_id, reason);
        self.forget_steps(dropped);
        self.discard_checks(test_id);
    }

    /// Stop tracking dropped steps, except those whose completion is still on its way
    fn forget_steps(&mut self, dropped: Vec<CheckTask>) {
        for task in dropped {
            let step_id = task.step_id();
            let outstanding = match task.state() {
                CheckTaskState::InFlight => true,
                CheckTaskState::RenderPending => !self.render.remove_pending(&step_id),
                _ => false,
            };
            if !outstanding {
                self.step_owner.remove(&step_id);
            }
        }
    }

    fn discard_checks(&mut self, test_id: TestId) {
        for step_id in self.check.discard(test_id) {
            self.step_owner.remove(&step_id);
        }
    }

    /// Drop discard markers of finished tests once none of their steps can still complete
    fn forget_finished(&mut self) {
        let busy: HashSet<TestId> = self.tests.keys().chain(self.step_owner.values()).copied().collect();
        let forgotten = self.check.forget_discarded(|test_id| busy.contains(test_id));
        if forgotten > 0 {
            trace!("Forgot {} finished tests", forgotten);
        }
    }

    /// Publish the result of a terminal test and stop tracking it
    fn finalize(&mut self, test_id: TestId) {
        let Some(test) = self.tests.remove(&test_id) else {
            return;
        };
        self.order.retain(|id| *id != test_id);
        self.discard_checks(test_id);
        debug!("Test {} finished as {}", test_id, test.state());
        self.shared.publish_result(test.to_container());
    }
}
