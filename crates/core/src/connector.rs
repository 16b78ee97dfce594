//! Interfaces to the remote comparison service and to resource downloads

use async_trait::async_trait;
use std::sync::Arc;

use crate::resource::{HashObject, Resource};
use crate::types::*;
use crate::GridResult;

/// Remote session server
///
/// Every call is independent; the scheduler never holds a lock across one.
#[async_trait]
pub trait ServerConnector: Send + Sync {
    /// Start a session, or report that the server is at capacity
    async fn start_session(&self, info: SessionStartInfo) -> GridResult<StartSessionOutcome>;

    /// Upload a screenshot and return its location
    async fn upload_image(&self, image: Vec<u8>) -> GridResult<String>;

    async fn match_window(&self, data: MatchWindowData) -> GridResult<MatchResult>;

    async fn stop_session(&self, info: SessionStopInfo) -> GridResult<TestResults>;

    /// Submit a batch of render jobs
    async fn render(&self, requests: Vec<RenderRequest>) -> GridResult<Vec<RunningRender>>;

    /// Status per render id; `None` when the server does not know the id
    async fn render_status(&self, render_ids: Vec<String>) -> GridResult<Vec<Option<RenderStatusResults>>>;

    /// For every hash, whether the server already stores it
    async fn check_resource_status(&self, hashes: Vec<HashObject>) -> GridResult<Vec<bool>>;

    async fn put_resource(&self, resource: Arc<Resource>) -> GridResult<()>;
}

/// Request metadata forwarded to the fetcher
#[derive(Debug, Clone, Default)]
pub struct DownloadContext {
    pub user_agent: Option<String>,
    /// Document that referenced the URL
    pub referer: Option<String>,
}

/// Downloads page resources for the crawler
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn download_resource(&self, url: &str, context: &DownloadContext) -> GridResult<Resource>;
}

/// Fetcher used when no fetcher was configured; every download fails
#[derive(Debug, Clone, Default)]
pub struct UnavailableFetcher;

#[async_trait]
impl ResourceFetcher for UnavailableFetcher {
    async fn download_resource(&self, url: &str, _context: &DownloadContext) -> GridResult<Resource> {
        Err(crate::GridError::Download {
            url: url.to_string(),
            reason: "no resource fetcher configured".to_string(),
        })
    }
}
