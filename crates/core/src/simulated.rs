//! In-process comparison server and resource fetcher
//!
//! Used by the CLI's `run` command and by tests. The server keeps counters
//! of every call so tests can assert on admission and dispatch behavior.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::connector::{DownloadContext, ResourceFetcher, ServerConnector};
use crate::resource::{HashObject, Resource};
use crate::types::*;
use crate::{GridError, GridResult};

/// Behavior of the simulated server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedServerConfig {
    /// Sessions the server accepts at once; `None` is unlimited
    pub capacity: Option<usize>,
    /// Base latency of every call
    pub latency_ms: u64,
    /// Random extra latency, up to this many milliseconds
    pub jitter_ms: u64,
    /// Step names that come back as mismatches
    pub mismatch_steps: HashSet<String>,
    /// Test names whose session start errors out
    pub fail_open_tests: HashSet<String>,
    /// Step names whose match errors out
    pub fail_check_steps: HashSet<String>,
    /// Test names whose session stop errors out
    pub fail_close_tests: HashSet<String>,
    /// Status polls answered with `rendering` before a render completes
    pub render_polls: u32,
}

/// Call counters of a `SimulatedConnector`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectorStats {
    pub max_concurrent_sessions: usize,
    pub start_attempts: u64,
    pub concurrency_full_responses: u64,
    pub upload_calls: u64,
    pub match_calls: u64,
    pub stop_calls: u64,
    pub render_calls: u64,
    pub put_resource_calls: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectorEventKind {
    SessionStarted,
    ConcurrencyFull,
    Matched { step_id: StepId, name: String },
    SessionStopped { aborted: bool },
}

/// One observable server-side event, in arrival order
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorEvent {
    pub at: DateTime<Utc>,
    pub test_id: TestId,
    #[serde(flatten)]
    pub kind: ConnectorEventKind,
}

#[derive(Default)]
struct SessionRecord {
    test_id: TestId,
    test_name: String,
    steps: u32,
    matches: u32,
    mismatches: u32,
}

struct RenderJob {
    polls_left: u32,
}

#[derive(Default)]
struct ServerState {
    sessions: HashMap<String, SessionRecord>,
    max_concurrent: usize,
    renders: HashMap<String, RenderJob>,
    events: Vec<ConnectorEvent>,
}

pub struct SimulatedConnector {
    config: SimulatedServerConfig,
    state: Mutex<ServerState>,
    stored: DashMap<String, ()>,
    next_id: AtomicU64,
    start_attempts: AtomicU64,
    concurrency_full: AtomicU64,
    upload_calls: AtomicU64,
    match_calls: AtomicU64,
    stop_calls: AtomicU64,
    render_calls: AtomicU64,
    put_resource_calls: AtomicU64,
}

impl SimulatedConnector {
    pub fn new(config: SimulatedServerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ServerState::default()),
            stored: DashMap::new(),
            next_id: AtomicU64::new(1),
            start_attempts: AtomicU64::new(0),
            concurrency_full: AtomicU64::new(0),
            upload_calls: AtomicU64::new(0),
            match_calls: AtomicU64::new(0),
            stop_calls: AtomicU64::new(0),
            render_calls: AtomicU64::new(0),
            put_resource_calls: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> ConnectorStats {
        ConnectorStats {
            max_concurrent_sessions: self.state.lock().max_concurrent,
            start_attempts: self.start_attempts.load(Ordering::SeqCst),
            concurrency_full_responses: self.concurrency_full.load(Ordering::SeqCst),
            upload_calls: self.upload_calls.load(Ordering::SeqCst),
            match_calls: self.match_calls.load(Ordering::SeqCst),
            stop_calls: self.stop_calls.load(Ordering::SeqCst),
            render_calls: self.render_calls.load(Ordering::SeqCst),
            put_resource_calls: self.put_resource_calls.load(Ordering::SeqCst),
        }
    }

    pub fn events(&self) -> Vec<ConnectorEvent> {
        self.state.lock().events.clone()
    }

    /// Sessions started and not yet stopped
    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Mark a resource as already stored on the server
    pub fn seed_resource(&self, resource: &Resource) {
        self.stored.insert(resource.sha256().to_string(), ());
    }

    pub fn has_resource(&self, hash: &str) -> bool {
        self.stored.contains_key(hash)
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn delay(&self) {
        let mut millis = self.config.latency_ms;
        if self.config.jitter_ms > 0 {
            millis += rand::thread_rng().gen_range(0..=self.config.jitter_ms);
        }
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    fn record(state: &mut ServerState, test_id: TestId, kind: ConnectorEventKind) {
        state.events.push(ConnectorEvent {
            at: Utc::now(),
            test_id,
            kind,
        });
    }
}

#[async_trait]
impl ServerConnector for SimulatedConnector {
    async fn start_session(&self, info: SessionStartInfo) -> GridResult<StartSessionOutcome> {
        self.delay().await;
        self.start_attempts.fetch_add(1, Ordering::SeqCst);

        if self.config.fail_open_tests.contains(&info.test_name) {
            return Err(GridError::Connector(format!(
                "session start rejected for {}",
                info.test_name
            )));
        }

        let mut state = self.state.lock();
        if let Some(capacity) = self.config.capacity {
            if state.sessions.len() >= capacity {
                self.concurrency_full.fetch_add(1, Ordering::SeqCst);
                Self::record(&mut state, info.test_id, ConnectorEventKind::ConcurrencyFull);
                return Ok(StartSessionOutcome::ConcurrencyFull);
            }
        }

        let id = self.next_id("session");
        state.sessions.insert(
            id.clone(),
            SessionRecord {
                test_id: info.test_id,
                test_name: info.test_name.clone(),
                ..Default::default()
            },
        );
        state.max_concurrent = state.max_concurrent.max(state.sessions.len());
        Self::record(&mut state, info.test_id, ConnectorEventKind::SessionStarted);
        debug!("Simulated session {} started for {}", id, info.test_name);

        Ok(StartSessionOutcome::Started(RunningSession {
            url: format!("https://snapgrid.local/sessions/{}", id),
            session_id: id.clone(),
            id,
            is_new: false,
        }))
    }

    async fn upload_image(&self, image: Vec<u8>) -> GridResult<String> {
        self.delay().await;
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let hash = crate::resource::sha256_hex(&image);
        Ok(format!("https://snapgrid.local/images/{}.png", hash))
    }

    async fn match_window(&self, data: MatchWindowData) -> GridResult<MatchResult> {
        self.delay().await;
        self.match_calls.fetch_add(1, Ordering::SeqCst);

        let name = data.settings.name.clone();
        if self.config.fail_check_steps.contains(&name) {
            return Err(GridError::Connector(format!("match rejected for step {}", name)));
        }
        let as_expected = !self.config.mismatch_steps.contains(&name);

        let mut state = self.state.lock();
        let record = state
            .sessions
            .get_mut(&data.session.session_id)
            .ok_or_else(|| GridError::Connector(format!("no session {}", data.session.session_id)))?;
        record.steps += 1;
        if as_expected {
            record.matches += 1;
        } else {
            record.mismatches += 1;
        }
        let test_id = record.test_id;
        Self::record(
            &mut state,
            test_id,
            ConnectorEventKind::Matched {
                step_id: data.step_id,
                name,
            },
        );
        trace!("Matched step {} (as expected: {})", data.step_id, as_expected);

        Ok(MatchResult {
            as_expected,
            window_id: Some(self.next_id("window")),
        })
    }

    async fn stop_session(&self, info: SessionStopInfo) -> GridResult<TestResults> {
        self.delay().await;
        self.stop_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        let record = state
            .sessions
            .remove(&info.session.session_id)
            .ok_or_else(|| GridError::Connector(format!("no session {}", info.session.session_id)))?;
        Self::record(
            &mut state,
            record.test_id,
            ConnectorEventKind::SessionStopped { aborted: info.aborted },
        );

        if self.config.fail_close_tests.contains(&record.test_name) {
            return Err(GridError::Connector(format!(
                "session stop rejected for {}",
                record.test_name
            )));
        }

        let status = if record.mismatches > 0 {
            TestResultsStatus::Unresolved
        } else {
            TestResultsStatus::Passed
        };
        Ok(TestResults {
            name: record.test_name,
            status,
            steps: record.steps,
            matches: record.matches,
            mismatches: record.mismatches,
            missing: 0,
            url: info.session.url,
            is_new: false,
            is_aborted: info.aborted,
        })
    }

    async fn render(&self, requests: Vec<RenderRequest>) -> GridResult<Vec<RunningRender>> {
        self.delay().await;
        self.render_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        let mut running = Vec::with_capacity(requests.len());
        for request in requests {
            let render_id = request.render_id.unwrap_or_else(|| self.next_id("render"));
            state.renders.insert(
                render_id.clone(),
                RenderJob {
                    polls_left: self.config.render_polls,
                },
            );
            running.push(RunningRender {
                render_id,
                status: RenderStatus::Rendering,
            });
        }
        Ok(running)
    }

    async fn render_status(&self, render_ids: Vec<String>) -> GridResult<Vec<Option<RenderStatusResults>>> {
        self.delay().await;

        let mut state = self.state.lock();
        Ok(render_ids
            .into_iter()
            .map(|render_id| {
                let job = state.renders.get_mut(&render_id)?;
                let status = if job.polls_left == 0 {
                    RenderStatus::Rendered
                } else {
                    job.polls_left -= 1;
                    RenderStatus::Rendering
                };
                let rendered = status == RenderStatus::Rendered;
                Some(RenderStatusResults {
                    image_location: rendered.then(|| format!("https://snapgrid.local/renders/{}.png", render_id)),
                    dom_location: rendered.then(|| format!("https://snapgrid.local/renders/{}.json", render_id)),
                    render_id,
                    status,
                    error: None,
                })
            })
            .collect())
    }

    async fn check_resource_status(&self, hashes: Vec<HashObject>) -> GridResult<Vec<bool>> {
        self.delay().await;
        Ok(hashes.iter().map(|h| self.stored.contains_key(&h.hash)).collect())
    }

    async fn put_resource(&self, resource: Arc<Resource>) -> GridResult<()> {
        self.delay().await;
        self.put_resource_calls.fetch_add(1, Ordering::SeqCst);
        self.stored.insert(resource.sha256().to_string(), ());
        Ok(())
    }
}

// ============================================================================
// Fetcher
// ============================================================================

/// Fetcher serving a fixed URL map
#[derive(Default)]
pub struct StaticResourceFetcher {
    resources: HashMap<String, (String, Bytes)>,
    fetches: DashMap<String, AtomicU32>,
}

impl StaticResourceFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(
        mut self,
        url: impl Into<String>,
        content_type: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        self.resources
            .insert(url.into(), (content_type.into(), content.into()));
        self
    }

    /// Times `url` was requested, found or not
    pub fn fetch_count(&self, url: &str) -> u32 {
        self.fetches
            .get(url)
            .map_or(0, |count| count.load(Ordering::SeqCst))
    }

    pub fn total_fetches(&self) -> u32 {
        self.fetches
            .iter()
            .map(|entry| entry.value().load(Ordering::SeqCst))
            .sum()
    }
}

#[async_trait]
impl ResourceFetcher for StaticResourceFetcher {
    async fn download_resource(&self, url: &str, _context: &DownloadContext) -> GridResult<Resource> {
        self.fetches
            .entry(url.to_string())
            .or_insert_with(|| AtomicU32::new(0))
            .fetch_add(1, Ordering::SeqCst);

        let (content_type, content) = self.resources.get(url).ok_or_else(|| GridError::Download {
            url: url.to_string(),
            reason: "404 not found".to_string(),
        })?;
        Ok(Resource::new(url, content_type.clone(), content.clone()))
    }
}
