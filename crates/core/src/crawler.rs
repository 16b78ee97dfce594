//! Resource dependency crawler
//!
//! Resolves every external resource a page (and its nested frames) needs:
//!
//! ```text
//!   to_download --(fetch, bounded)--> finished --> cache + owner map --> to_parse
//!        ^                                                                  |
//!        +------------------------- references ----------------------------+
//! ```
//!
//! Each frame owns a map keyed by URL. A URL already present in the owner's map
//! is never queued again, which is what makes reference cycles converge.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::CrawlerConfig;
use crate::connector::{DownloadContext, ResourceFetcher};
use crate::resource::{resolve_reference, CollectedDom, FrameData, RenderDom, Resource, ResourceCache};
use crate::GridResult;

type OwnerId = usize;

/// Counters for one crawl
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlStats {
    pub downloads_started: usize,
    pub downloads_failed: usize,
    pub parses: usize,
    pub parse_failures: usize,
    pub cache_hits: usize,
}

struct FrameNode {
    url: String,
    cdt: serde_json::Value,
    resources: BTreeMap<String, Arc<Resource>>,
    children: Vec<OwnerId>,
}

/// One crawl over a frame tree
pub struct DomAnalyzer {
    frames: Vec<FrameNode>,
    cache: ResourceCache,
    fetcher: Arc<dyn ResourceFetcher>,
    config: CrawlerConfig,
    user_agent: Option<String>,
    to_download: VecDeque<(OwnerId, String)>,
    to_parse: VecDeque<(OwnerId, Arc<Resource>)>,
    in_flight: HashMap<String, Vec<OwnerId>>,
    failed: HashSet<String>,
    finished: Arc<Mutex<Vec<(String, GridResult<Resource>)>>>,
    stats: CrawlStats,
}

impl DomAnalyzer {
    pub fn new(
        frame: FrameData,
        cache: ResourceCache,
        fetcher: Arc<dyn ResourceFetcher>,
        config: CrawlerConfig,
    ) -> Self {
        let user_agent = frame.user_agent.clone().or_else(|| config.user_agent.clone());
        let mut analyzer = Self {
            frames: Vec::new(),
            cache,
            fetcher,
            config,
            user_agent,
            to_download: VecDeque::new(),
            to_parse: VecDeque::new(),
            in_flight: HashMap::new(),
            failed: HashSet::new(),
            finished: Arc::new(Mutex::new(Vec::new())),
            stats: CrawlStats::default(),
        };
        analyzer.add_frame(frame);
        analyzer
    }

    /// Flatten a frame subtree; parents always get a lower id than their children
    fn add_frame(&mut self, frame: FrameData) -> OwnerId {
        let owner = self.frames.len();
        self.frames.push(FrameNode {
            url: frame.url.clone(),
            cdt: frame.cdt,
            resources: BTreeMap::new(),
            children: Vec::new(),
        });

        let base = Url::parse(&frame.url).ok();
        for raw in frame.resource_urls {
            let resolved = match &base {
                Some(base) => resolve_reference(base, &raw),
                None => Url::parse(&raw).ok().and_then(|u| resolve_reference(&u, u.as_str())),
            };
            match resolved {
                Some(url) => self.to_download.push_back((owner, url)),
                None => trace!("Skipping resource reference {}", raw),
            }
        }

        for blob in frame.blobs {
            let resource = Arc::new(Resource::new(blob.url.clone(), blob.content_type, blob.content));
            self.frames[owner].resources.insert(blob.url, Arc::clone(&resource));
            self.to_parse.push_back((owner, resource));
        }

        for child in frame.frames {
            let child_id = self.add_frame(child);
            self.frames[owner].children.push(child_id);
        }
        owner
    }

    /// Advance the crawl by one tick; returns true once nothing is left to do
    pub fn run(&mut self) -> bool {
        self.drain_downloads();
        self.parse_batch();
        self.schedule_downloads();
        self.is_done()
    }

    pub fn is_done(&self) -> bool {
        self.to_download.is_empty() && self.to_parse.is_empty() && self.in_flight.is_empty()
    }

    fn drain_downloads(&mut self) {
        let finished = std::mem::take(&mut *self.finished.lock());
        for (url, result) in finished {
            let owners = self.in_flight.remove(&url).unwrap_or_default();
            match result {
                Ok(resource) => {
                    let resource = Arc::new(resource);
                    self.cache.insert(url.clone(), Arc::clone(&resource));
                    for owner in owners {
                        self.frames[owner].resources.insert(url.clone(), Arc::clone(&resource));
                        self.to_parse.push_back((owner, Arc::clone(&resource)));
                    }
                }
                Err(e) => {
                    warn!("Dropping resource {}: {}", url, e);
                    self.stats.downloads_failed += 1;
                    self.failed.insert(url);
                }
            }
        }
    }

    fn parse_batch(&mut self) {
        let budget = self.config.max_parses_per_tick.min(self.to_parse.len());
        let batch: Vec<_> = self.to_parse.drain(..budget).collect();
        for (owner, resource) in batch {
            self.stats.parses += 1;
            match resource.references() {
                Ok(references) => {
                    for url in references {
                        if !self.frames[owner].resources.contains_key(&url) {
                            self.to_download.push_back((owner, url));
                        }
                    }
                }
                Err(e) => {
                    warn!("Dropping resource {}: {}", resource.url(), e);
                    self.stats.parse_failures += 1;
                    self.frames[owner].resources.remove(resource.url());
                }
            }
        }
    }

    fn schedule_downloads(&mut self) {
        let mut deferred = VecDeque::new();
        while let Some((owner, url)) = self.to_download.pop_front() {
            if self.frames[owner].resources.contains_key(&url) || self.failed.contains(&url) {
                continue;
            }

            let cached = self.cache.get(&url).map(|entry| Arc::clone(entry.value()));
            if let Some(resource) = cached {
                self.stats.cache_hits += 1;
                self.frames[owner].resources.insert(url, Arc::clone(&resource));
                self.to_parse.push_back((owner, resource));
                continue;
            }

            if let Some(owners) = self.in_flight.get_mut(&url) {
                if !owners.contains(&owner) {
                    owners.push(owner);
                }
                continue;
            }

            if self.in_flight.len() >= self.config.max_concurrent_downloads {
                deferred.push_back((owner, url));
                continue;
            }

            self.start_download(owner, url);
        }
        self.to_download = deferred;
    }

    fn start_download(&mut self, owner: OwnerId, url: String) {
        debug!("Downloading {}", url);
        self.stats.downloads_started += 1;
        self.in_flight.insert(url.clone(), vec![owner]);

        let fetcher = Arc::clone(&self.fetcher);
        let finished = Arc::clone(&self.finished);
        let context = DownloadContext {
            user_agent: self.user_agent.clone(),
            referer: Some(self.frames[owner].url.clone()),
        };
        tokio::spawn(async move {
            let result = fetcher.download_resource(&url, &context).await;
            finished.lock().push((url, result));
        });
    }

    pub fn stats(&self) -> &CrawlStats {
        &self.stats
    }

    pub fn pending_download_len(&self) -> usize {
        self.to_download.len()
    }

    pub fn pending_parse_len(&self) -> usize {
        self.to_parse.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Tick until done, sleeping between ticks
    pub async fn crawl(mut self, tick: Duration) -> GridResult<CollectedDom> {
        while !self.run() {
            tokio::time::sleep(tick).await;
        }
        self.into_output()
    }

    /// Build the render DOM bottom-up; child frames become resources of their parent
    pub fn into_output(self) -> GridResult<CollectedDom> {
        let mut all_resources: BTreeMap<String, Arc<Resource>> = BTreeMap::new();
        let mut built: Vec<Option<RenderDom>> = vec![None; self.frames.len()];

        for (owner, frame) in self.frames.into_iter().enumerate().rev() {
            let mut resources: BTreeMap<String, Arc<Resource>> = frame.resources;
            for child in frame.children {
                if let Some(child_dom) = built[child].take() {
                    let child_resource = Arc::new(child_dom.as_resource()?);
                    resources.insert(child_dom.url.clone(), child_resource);
                }
            }

            let dom = RenderDom {
                url: frame.url,
                cdt: frame.cdt,
                resources: resources
                    .iter()
                    .map(|(url, resource)| (url.clone(), resource.hash_object()))
                    .collect(),
            };
            all_resources.extend(resources);
            built[owner] = Some(dom);
        }

        let dom = built
            .into_iter()
            .next()
            .flatten()
            .unwrap_or_else(|| RenderDom {
                url: String::new(),
                cdt: serde_json::Value::Null,
                resources: BTreeMap::new(),
            });
        Ok(CollectedDom {
            dom,
            resources: all_resources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{new_resource_cache, BlobData};
    use crate::simulated::StaticResourceFetcher;

    fn fetcher() -> StaticResourceFetcher {
        StaticResourceFetcher::new()
            .with_resource("https://site.test/a.css", "text/css", "body { background: url(b.png) }")
            .with_resource("https://site.test/b.png", "image/png", vec![1u8, 2, 3])
            .with_resource("https://site.test/c.css", "text/css", "@import 'a.css';")
    }

    async fn crawl(analyzer: DomAnalyzer) -> CollectedDom {
        analyzer.crawl(Duration::from_millis(1)).await.unwrap()
    }

    #[tokio::test]
    async fn test_crawl_follows_references() {
        let fetcher = Arc::new(fetcher());
        let frame = FrameData::new("https://site.test/index.html").with_resources(["c.css"]);
        let analyzer = DomAnalyzer::new(frame, new_resource_cache(), fetcher.clone(), CrawlerConfig::default());

        let collected = crawl(analyzer).await;
        let urls: Vec<&str> = collected.dom.resources.keys().map(String::as_str).collect();
        assert_eq!(
            urls,
            vec![
                "https://site.test/a.css",
                "https://site.test/b.png",
                "https://site.test/c.css",
            ]
        );
        assert_eq!(fetcher.total_fetches(), 3);
    }

    #[tokio::test]
    async fn test_parse_cap_spreads_work_over_ticks() {
        let fetcher = Arc::new(fetcher());
        let mut frame = FrameData::new("https://site.test/index.html");
        for i in 0..5 {
            frame = frame.with_blob(BlobData {
                url: format!("blob:https://site.test/{}", i),
                content_type: "text/plain".into(),
                content: vec![b'x'],
            });
        }
        let config = CrawlerConfig {
            max_parses_per_tick: 2,
            ..Default::default()
        };
        let mut analyzer = DomAnalyzer::new(frame, new_resource_cache(), fetcher, config);

        assert!(!analyzer.run());
        assert_eq!(analyzer.pending_parse_len(), 3);
        assert!(!analyzer.run());
        assert_eq!(analyzer.pending_parse_len(), 1);
        assert!(analyzer.run());
        assert_eq!(analyzer.stats().parses, 5);
    }

    #[tokio::test]
    async fn test_download_cap() {
        let mut fetcher = StaticResourceFetcher::new();
        let mut urls = Vec::new();
        for i in 0..10 {
            let url = format!("https://site.test/{}.png", i);
            fetcher = fetcher.with_resource(&url, "image/png", vec![i as u8]);
            urls.push(url);
        }
        let config = CrawlerConfig {
            max_concurrent_downloads: 3,
            ..Default::default()
        };
        let frame = FrameData::new("https://site.test/").with_resources(urls);
        let mut analyzer = DomAnalyzer::new(frame, new_resource_cache(), Arc::new(fetcher), config);

        analyzer.run();
        assert_eq!(analyzer.in_flight_len(), 3);
        assert_eq!(analyzer.pending_download_len(), 7);

        while !analyzer.run() {
            assert!(analyzer.in_flight_len() <= 3);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(analyzer.into_output().unwrap().resources.len(), 10);
    }

    #[tokio::test]
    async fn test_parse_failure_drops_resource() {
        let fetcher = StaticResourceFetcher::new()
            .with_resource("https://site.test/bad.css", "text/css", vec![0xffu8, 0xfe])
            .with_resource("https://site.test/ok.png", "image/png", vec![1u8]);
        let frame = FrameData::new("https://site.test/").with_resources(["bad.css", "ok.png"]);
        let analyzer = DomAnalyzer::new(frame, new_resource_cache(), Arc::new(fetcher), CrawlerConfig::default());

        let collected = crawl(analyzer).await;
        assert_eq!(
            collected.dom.resources.keys().collect::<Vec<_>>(),
            vec!["https://site.test/ok.png"]
        );
    }
}
