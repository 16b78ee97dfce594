//! Resource crawling and upload ahead of rendering
//!
//! Every queued frame tree gets its own `DomAnalyzer`, ticked once per `run()`.
//! A finished crawl asks the server which hashes it lacks and uploads those;
//! concurrent requests for the same hash share a single upload.

use dashmap::DashMap;
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BoundedService, ServiceOutcome, SlotRelease};
use crate::config::CrawlerConfig;
use crate::connector::{ResourceFetcher, ServerConnector};
use crate::crawler::DomAnalyzer;
use crate::resource::{CollectedDom, FrameData, Resource, ResourceCache};
use crate::{GridError, GridResult};

pub struct CollectionInput {
    pub frame: FrameData,
}

type UploadCell = Arc<OnceCell<Result<(), String>>>;

pub struct ResourceCollectionService {
    inner: Arc<BoundedService<Uuid, CollectionInput, CollectedDom>>,
    connector: Arc<dyn ServerConnector>,
    fetcher: Arc<dyn ResourceFetcher>,
    cache: ResourceCache,
    config: CrawlerConfig,
    analyzers: Mutex<Vec<(Uuid, DomAnalyzer)>>,
    uploads: Arc<DashMap<String, UploadCell>>,
}

impl ResourceCollectionService {
    pub fn new(
        connector: Arc<dyn ServerConnector>,
        fetcher: Arc<dyn ResourceFetcher>,
        cache: ResourceCache,
        config: CrawlerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BoundedService::new("resource-collection", None, SlotRelease::OnCompletion)),
            connector,
            fetcher,
            cache,
            config,
            analyzers: Mutex::new(Vec::new()),
            uploads: Arc::new(DashMap::new()),
        }
    }

    pub fn add_input(&self, id: Uuid, frame: FrameData) {
        self.inner.add_input(id, CollectionInput { frame });
    }

    /// Start analyzers for new inputs, tick the running ones and upload finished crawls
    pub fn run(&self) -> usize {
        let mut analyzers = self.analyzers.lock();
        for (id, input) in self.inner.take_ready(Instant::now()) {
            debug!("Collecting resources of {} for {}", input.frame.url, id);
            let analyzer = DomAnalyzer::new(
                input.frame,
                Arc::clone(&self.cache),
                Arc::clone(&self.fetcher),
                self.config.clone(),
            );
            analyzers.push((id, analyzer));
        }

        let mut finished = Vec::new();
        let mut running = Vec::with_capacity(analyzers.len());
        for (id, mut analyzer) in analyzers.drain(..) {
            if analyzer.run() {
                finished.push((id, analyzer));
            } else {
                running.push((id, analyzer));
            }
        }
        *analyzers = running;
        drop(analyzers);

        let count = finished.len();
        for (id, analyzer) in finished {
            let stats = analyzer.stats().clone();
            let collected = match analyzer.into_output() {
                Ok(collected) => collected,
                Err(e) => {
                    self.inner.settle(id, ServiceOutcome::Failed(e));
                    continue;
                }
            };
            info!(
                "Crawl {} done: {} resources, {} downloads, {} cache hits",
                id,
                collected.resources.len(),
                stats.downloads_started,
                stats.cache_hits
            );

            let inner = Arc::clone(&self.inner);
            let connector = Arc::clone(&self.connector);
            let uploads = Arc::clone(&self.uploads);
            tokio::spawn(async move {
                let outcome = match upload_missing(connector, uploads, &collected).await {
                    Ok(()) => ServiceOutcome::Done(collected),
                    Err(e) => ServiceOutcome::Failed(e),
                };
                inner.settle(id, outcome);
            });
        }
        count
    }

    pub fn get_succeeded_tasks(&self) -> Vec<(Uuid, CollectedDom)> {
        self.inner.get_succeeded_tasks()
    }

    pub fn get_failed_tasks(&self) -> Vec<(Uuid, GridError)> {
        self.inner.get_failed_tasks()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight_len()
    }

    pub fn active_crawls(&self) -> usize {
        self.analyzers.lock().len()
    }
}

async fn upload_missing(
    connector: Arc<dyn ServerConnector>,
    uploads: Arc<DashMap<String, UploadCell>>,
    collected: &CollectedDom,
) -> GridResult<()> {
    let candidates: Vec<Arc<Resource>> = collected
        .resources
        .values()
        .filter(|resource| {
            !uploads
                .get(resource.sha256())
                .is_some_and(|cell| matches!(cell.get(), Some(Ok(()))))
        })
        .cloned()
        .collect();
    if candidates.is_empty() {
        return Ok(());
    }

    let hashes = candidates.iter().map(|r| r.hash_object()).collect();
    let present = connector.check_resource_status(hashes).await?;
    let missing: Vec<Arc<Resource>> = candidates
        .into_iter()
        .zip(present.into_iter().chain(std::iter::repeat(false)))
        .filter(|(_, present)| !present)
        .map(|(resource, _)| resource)
        .collect();
    debug!("Uploading {} missing resources", missing.len());

    try_join_all(missing.into_iter().map(|resource| {
        let connector = Arc::clone(&connector);
        let uploads = Arc::clone(&uploads);
        async move { upload_once(connector, uploads, resource).await }
    }))
    .await?;
    Ok(())
}

async fn upload_once(
    connector: Arc<dyn ServerConnector>,
    uploads: Arc<DashMap<String, UploadCell>>,
    resource: Arc<Resource>,
) -> GridResult<()> {
    let hash = resource.sha256().to_string();
    let cell = Arc::clone(uploads.entry(hash.clone()).or_default().value());
    let result = cell
        .get_or_init(|| async {
            connector
                .put_resource(Arc::clone(&resource))
                .await
                .map_err(|e| e.to_string())
        })
        .await
        .clone();

    result.map_err(|reason| {
        uploads.remove(&hash);
        GridError::UploadFailed(format!("{}: {}", resource.url(), reason))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::new_resource_cache;
    use crate::simulated::{SimulatedConnector, SimulatedServerConfig, StaticResourceFetcher};
    use std::time::Duration;

    fn fetcher() -> Arc<StaticResourceFetcher> {
        Arc::new(
            StaticResourceFetcher::new()
                .with_resource("https://site.test/a.css", "text/css", "p { color: red }")
                .with_resource("https://site.test/b.png", "image/png", vec![9u8, 9, 9]),
        )
    }

    async fn drive(service: &ResourceCollectionService) {
        for _ in 0..500 {
            service.run();
            if service.active_crawls() == 0 && service.in_flight_len() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_same_hash_uploaded_once() {
        let connector = Arc::new(SimulatedConnector::new(SimulatedServerConfig::default()));
        let service = ResourceCollectionService::new(
            connector.clone(),
            fetcher(),
            new_resource_cache(),
            CrawlerConfig::default(),
        );

        let frame = FrameData::new("https://site.test/").with_resources(["a.css", "b.png"]);
        service.add_input(Uuid::new_v4(), frame.clone());
        service.add_input(Uuid::new_v4(), frame);
        drive(&service).await;

        let collected = service.get_succeeded_tasks();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].1.dom.resources.len(), 2);
        assert_eq!(connector.stats().put_resource_calls, 2);
    }

    #[tokio::test]
    async fn test_resources_already_on_server_are_skipped() {
        let connector = Arc::new(SimulatedConnector::new(SimulatedServerConfig::default()));
        connector.seed_resource(&Resource::new("https://site.test/a.css", "text/css", "p { color: red }"));
        let service = ResourceCollectionService::new(
            connector.clone(),
            fetcher(),
            new_resource_cache(),
            CrawlerConfig::default(),
        );

        service.add_input(
            Uuid::new_v4(),
            FrameData::new("https://site.test/").with_resources(["a.css", "b.png"]),
        );
        drive(&service).await;

        assert_eq!(service.get_succeeded_tasks().len(), 1);
        assert_eq!(connector.stats().put_resource_calls, 1);
    }
}
