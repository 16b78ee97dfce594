//! Crawl Command

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::Serialize;
use snapgrid_core::{
    new_resource_cache, CrawlerConfig, DomAnalyzer, FrameData, ResourceFetcher, StaticResourceFetcher,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::http_fetcher::HttpFetcher;
use crate::output::{print_list, print_success, OutputFormat, TableDisplay};
use crate::suite::SiteResource;

#[derive(Args)]
pub struct CrawlArgs {
    /// Resource URLs to crawl
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Serve resources from a JSON site map (url -> {content_type, content}) instead of HTTP
    #[arg(long)]
    pub site_map: Option<PathBuf>,

    /// Per-request timeout for live downloads, in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// User agent sent with every download
    #[arg(long)]
    pub user_agent: Option<String>,
}

#[derive(Serialize)]
pub struct ResourceDisplay {
    pub url: String,
    pub content_type: String,
    pub size: usize,
    pub sha256: String,
}

impl TableDisplay for ResourceDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["URL", "Type", "Size", "SHA256"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.url.clone(),
            self.content_type.clone(),
            format!("{}B", self.size),
            self.sha256.chars().take(12).collect::<String>(),
        ]
    }
}

fn fetcher(args: &CrawlArgs) -> Result<Arc<dyn ResourceFetcher>> {
    let Some(path) = &args.site_map else {
        return Ok(Arc::new(HttpFetcher::new(Duration::from_secs(args.timeout))?));
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading site map {}", path.display()))?;
    let site: BTreeMap<String, SiteResource> = serde_json::from_str(&content)
        .with_context(|| format!("parsing site map {}", path.display()))?;
    let fetcher = site.into_iter().fold(StaticResourceFetcher::new(), |fetcher, (url, resource)| {
        fetcher.with_resource(url, resource.content_type, resource.content)
    });
    Ok(Arc::new(fetcher))
}

pub async fn execute(args: CrawlArgs, mut config: CrawlerConfig, format: OutputFormat) -> Result<()> {
    if args.user_agent.is_some() {
        config.user_agent = args.user_agent.clone();
    }
    let fetcher = fetcher(&args)?;
    let cache = new_resource_cache();

    let mut rows = BTreeMap::new();
    for url in &args.urls {
        let frame = FrameData::new(url.clone()).with_resources([url.clone()]);
        let mut analyzer = DomAnalyzer::new(frame, Arc::clone(&cache), Arc::clone(&fetcher), config.clone());
        while !analyzer.run() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stats = analyzer.stats().clone();
        let collected = analyzer.into_output()?;
        info!(
            "Crawled {}: {} resources, {} downloads ({} failed), {} cache hits",
            url,
            collected.resources.len(),
            stats.downloads_started,
            stats.downloads_failed,
            stats.cache_hits
        );
        for (resource_url, resource) in collected.resources {
            rows.entry(resource_url.clone()).or_insert_with(|| ResourceDisplay {
                url: resource_url,
                content_type: resource.content_type().to_string(),
                size: resource.len(),
                sha256: resource.sha256().to_string(),
            });
        }
    }

    if rows.is_empty() {
        bail!("no resource could be downloaded");
    }
    let rows: Vec<ResourceDisplay> = rows.into_values().collect();
    print_list(&rows, format);
    if matches!(format, OutputFormat::Table) {
        print_success(&format!("Collected {} resources", rows.len()));
    }
    Ok(())
}
