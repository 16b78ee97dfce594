//! Batched rendering with status polling

use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{BoundedService, ServiceOutcome, SlotRelease};
use crate::config::RenderConfig;
use crate::connector::ServerConnector;
use crate::types::{RenderRequest, RenderStatus, RenderStatusResults, StepId, TestId};
use crate::GridError;

pub struct RenderInput {
    pub test_id: TestId,
    pub request: RenderRequest,
}

type RenderOutcome = ServiceOutcome<RenderInput, RenderStatusResults>;

pub struct RenderService {
    inner: Arc<BoundedService<StepId, RenderInput, RenderStatusResults>>,
    connector: Arc<dyn ServerConnector>,
    config: RenderConfig,
}

impl RenderService {
    pub fn new(connector: Arc<dyn ServerConnector>, config: RenderConfig) -> Self {
        Self {
            inner: Arc::new(BoundedService::new("render", None, SlotRelease::OnCompletion)),
            connector,
            config,
        }
    }

    pub fn add_input(&self, step_id: StepId, input: RenderInput) {
        self.inner.add_input(step_id, input);
    }

    pub fn remove_pending(&self, step_id: &StepId) -> bool {
        self.inner.remove_pending(step_id).is_some()
    }

    /// Send everything queued as one batch; the batch is then polled until every render settles
    pub fn run(&self) -> usize {
        let batch = self.inner.take_ready(Instant::now());
        if batch.is_empty() {
            return 0;
        }
        let count = batch.len();
        let inner = Arc::clone(&self.inner);
        let connector = Arc::clone(&self.connector);
        let config = self.config.clone();
        tokio::spawn(async move {
            for (step_id, outcome) in render_batch(connector, config, batch).await {
                inner.settle(step_id, outcome);
            }
        });
        count
    }

    pub fn get_succeeded_tasks(&self) -> Vec<(StepId, RenderStatusResults)> {
        self.inner.get_succeeded_tasks()
    }

    pub fn get_failed_tasks(&self) -> Vec<(StepId, GridError)> {
        self.inner.get_failed_tasks()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight_len()
    }
}

fn fail_all(steps: impl IntoIterator<Item = StepId>, reason: &str) -> Vec<(StepId, RenderOutcome)> {
    steps
        .into_iter()
        .map(|step_id| {
            (
                step_id,
                ServiceOutcome::Failed(GridError::RenderFailed(reason.to_string())),
            )
        })
        .collect()
}

async fn render_batch(
    connector: Arc<dyn ServerConnector>,
    config: RenderConfig,
    batch: Vec<(StepId, RenderInput)>,
) -> Vec<(StepId, RenderOutcome)> {
    let steps: Vec<StepId> = batch.iter().map(|(step_id, _)| *step_id).collect();
    let requests: Vec<RenderRequest> = batch.into_iter().map(|(_, input)| input.request).collect();
    debug!("Sending {} render requests", requests.len());

    let renders = match connector.render(requests).await {
        Ok(renders) => renders,
        Err(e) => return fail_all(steps, &e.to_string()),
    };
    if renders.len() != steps.len() {
        let reason = format!("server answered {} renders for a batch of {}", renders.len(), steps.len());
        return fail_all(steps, &reason);
    }
    if let Some(bad) = renders
        .iter()
        .find(|r| !matches!(r.status, RenderStatus::Rendering | RenderStatus::Rendered))
    {
        return fail_all(
            steps,
            &format!("render {} has unexpected status {}", bad.render_id, bad.status),
        );
    }

    let mut pending: HashMap<String, StepId> = renders
        .into_iter()
        .zip(steps)
        .map(|(render, step_id)| (render.render_id, step_id))
        .collect();
    let mut outcomes = Vec::with_capacity(pending.len());
    let started = Instant::now();

    while !pending.is_empty() {
        if started.elapsed() >= config.timeout() {
            warn!("Render timeout, {} renders still pending", pending.len());
            outcomes.extend(pending.drain().map(|(render_id, step_id)| {
                (
                    step_id,
                    ServiceOutcome::Failed(GridError::RenderTimeout {
                        step_id: step_id.to_string(),
                        render_id,
                    }),
                )
            }));
            break;
        }

        tokio::time::sleep(config.poll_interval()).await;

        let ids: Vec<String> = pending.keys().cloned().collect();
        let statuses = match connector.render_status(ids.clone()).await {
            Ok(statuses) => statuses,
            Err(e) => {
                outcomes.extend(fail_all(pending.drain().map(|(_, step_id)| step_id), &e.to_string()));
                break;
            }
        };

        for (index, render_id) in ids.into_iter().enumerate() {
            let status = statuses.get(index).cloned().flatten();
            match status {
                Some(result) if result.status == RenderStatus::Rendering => {}
                Some(result) if result.status == RenderStatus::Rendered => {
                    if let Some(step_id) = pending.remove(&render_id) {
                        outcomes.push((step_id, ServiceOutcome::Done(result)));
                    }
                }
                Some(result) => {
                    if let Some(step_id) = pending.remove(&render_id) {
                        let reason = result
                            .error
                            .unwrap_or_else(|| format!("render {} failed", render_id));
                        outcomes.push((step_id, ServiceOutcome::Failed(GridError::RenderFailed(reason))));
                    }
                }
                None => {
                    if let Some(step_id) = pending.remove(&render_id) {
                        outcomes.push((
                            step_id,
                            ServiceOutcome::Failed(GridError::RenderFailed(format!(
                                "no status for render {}",
                                render_id
                            ))),
                        ));
                    }
                }
            }
        }
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{HashObject, RenderDom, Resource};
    use crate::simulated::{SimulatedConnector, SimulatedServerConfig};
    use crate::types::{
        BrowserInfo, MatchResult, MatchWindowData, RunningRender, SessionStartInfo, SessionStopInfo,
        StartSessionOutcome, TestResults,
    };
    use crate::GridResult;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn request(step_id: StepId) -> RenderRequest {
        RenderRequest {
            step_id,
            url: "https://site.test/".into(),
            dom: RenderDom {
                url: "https://site.test/".into(),
                cdt: serde_json::Value::Null,
                resources: BTreeMap::new(),
            },
            browser: BrowserInfo::default(),
            render_id: None,
        }
    }

    /// Answers every render batch with one render too few
    struct ShortRenders(SimulatedConnector);

    #[async_trait]
    impl ServerConnector for ShortRenders {
        async fn start_session(&self, info: SessionStartInfo) -> GridResult<StartSessionOutcome> {
            self.0.start_session(info).await
        }

        async fn upload_image(&self, image: Vec<u8>) -> GridResult<String> {
            self.0.upload_image(image).await
        }

        async fn match_window(&self, data: MatchWindowData) -> GridResult<MatchResult> {
            self.0.match_window(data).await
        }

        async fn stop_session(&self, info: SessionStopInfo) -> GridResult<TestResults> {
            self.0.stop_session(info).await
        }

        async fn render(&self, requests: Vec<RenderRequest>) -> GridResult<Vec<RunningRender>> {
            let mut renders = self.0.render(requests).await?;
            renders.pop();
            Ok(renders)
        }

        async fn render_status(&self, render_ids: Vec<String>) -> GridResult<Vec<Option<RenderStatusResults>>> {
            self.0.render_status(render_ids).await
        }

        async fn check_resource_status(&self, hashes: Vec<HashObject>) -> GridResult<Vec<bool>> {
            self.0.check_resource_status(hashes).await
        }

        async fn put_resource(&self, resource: Arc<Resource>) -> GridResult<()> {
            self.0.put_resource(resource).await
        }
    }

    fn fast_polling() -> RenderConfig {
        RenderConfig {
            poll_interval_ms: 1,
            ..Default::default()
        }
    }

    async fn idle(service: &RenderService) {
        for _ in 0..500 {
            if service.in_flight_len() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_batch_rendered_after_polling() {
        let connector = Arc::new(SimulatedConnector::new(SimulatedServerConfig {
            render_polls: 2,
            ..Default::default()
        }));
        let service = RenderService::new(connector.clone(), fast_polling());

        let steps = [StepId::new(), StepId::new(), StepId::new()];
        for step_id in steps {
            service.add_input(
                step_id,
                RenderInput {
                    test_id: TestId::new(),
                    request: request(step_id),
                },
            );
        }
        assert_eq!(service.run(), 3);
        idle(&service).await;

        let rendered = service.get_succeeded_tasks();
        assert_eq!(rendered.len(), 3);
        assert!(rendered.iter().all(|(_, r)| r.image_location.is_some()));
        assert_eq!(connector.stats().render_calls, 1);
    }

    #[tokio::test]
    async fn test_short_render_answer_fails_whole_batch() {
        let connector = Arc::new(ShortRenders(SimulatedConnector::new(SimulatedServerConfig::default())));
        let service = RenderService::new(connector, fast_polling());

        let steps = [StepId::new(), StepId::new()];
        for step_id in steps {
            service.add_input(
                step_id,
                RenderInput {
                    test_id: TestId::new(),
                    request: request(step_id),
                },
            );
        }
        service.run();
        idle(&service).await;

        assert!(service.get_succeeded_tasks().is_empty());
        let failed = service.get_failed_tasks();
        assert_eq!(failed.len(), 2);
        assert!(failed
            .iter()
            .all(|(_, e)| e.to_string().contains("server answered 1 renders for a batch of 2")));
    }

    #[tokio::test]
    async fn test_render_timeout() {
        let connector = Arc::new(SimulatedConnector::new(SimulatedServerConfig {
            render_polls: u32::MAX,
            ..Default::default()
        }));
        let service = RenderService::new(
            connector,
            RenderConfig {
                poll_interval_ms: 1,
                timeout_ms: 5,
            },
        );

        let step_id = StepId::new();
        service.add_input(
            step_id,
            RenderInput {
                test_id: TestId::new(),
                request: request(step_id),
            },
        );
        service.run();
        idle(&service).await;

        let failed = service.get_failed_tasks();
        assert_eq!(failed.len(), 1);
        assert!(matches!(failed[0].1, GridError::RenderTimeout { .. }));
    }
}
