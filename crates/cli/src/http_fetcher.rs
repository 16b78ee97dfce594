//! Resource fetcher over HTTP

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, REFERER, USER_AGENT};
use snapgrid_core::{DownloadContext, GridError, GridResult, Resource, ResourceFetcher};
use std::time::Duration;
use tracing::debug;

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

fn download_error(url: &str, reason: impl ToString) -> GridError {
    GridError::Download {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn download_resource(&self, url: &str, context: &DownloadContext) -> GridResult<Resource> {
        let mut request = self.client.get(url);
        if let Some(agent) = &context.user_agent {
            request = request.header(USER_AGENT, agent);
        }
        if let Some(referer) = &context.referer {
            request = request.header(REFERER, referer);
        }

        let response = request.send().await.map_err(|e| download_error(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(download_error(url, status));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = response.bytes().await.map_err(|e| download_error(url, e))?;
        debug!("Fetched {} ({} bytes, {})", url, body.len(), content_type);

        Ok(Resource::new(url, content_type, body))
    }
}
