//! Page resources, frame snapshots and the shared resource cache

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

use crate::{GridError, GridResult};

/// Content type of a serialized child frame
pub const RENDER_DOM_CONTENT_TYPE: &str = "x-snapgrid/render-dom+json";

static CSS_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).expect("valid regex"));
static CSS_IMPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"@import\s+['"]([^'"]+)['"]"#).expect("valid regex"));
static SVG_HREF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:xlink:)?href\s*=\s*['"]([^'"]+)['"]"#).expect("valid regex"));

/// Compute SHA-256 hash of data
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Cache of fetched resources keyed by absolute URL
pub type ResourceCache = Arc<DashMap<String, Arc<Resource>>>;

pub fn new_resource_cache() -> ResourceCache {
    Arc::new(DashMap::new())
}

/// A downloaded (or inline) page resource
#[derive(Debug, Clone)]
pub struct Resource {
    url: String,
    content_type: String,
    content: Bytes,
    sha256: String,
}

impl Resource {
    pub fn new(url: impl Into<String>, content_type: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        Self {
            url: url.into(),
            content_type: content_type.into(),
            sha256: sha256_hex(&content),
            content,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn hash_object(&self) -> HashObject {
        HashObject {
            hash_format: "sha256".to_string(),
            hash: self.sha256.clone(),
            content_type: self.content_type.clone(),
        }
    }

    fn mime(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    pub fn is_css(&self) -> bool {
        self.mime() == "text/css"
    }

    pub fn is_svg(&self) -> bool {
        self.mime() == "image/svg+xml"
    }

    /// Absolute http(s) URLs this resource references, in discovery order.
    ///
    /// Only stylesheets and SVG documents are parsed; everything else has no references.
    pub fn references(&self) -> GridResult<Vec<String>> {
        let patterns: &[&Lazy<Regex>] = if self.is_css() {
            &[&CSS_URL, &CSS_IMPORT]
        } else if self.is_svg() {
            &[&SVG_HREF]
        } else {
            return Ok(Vec::new());
        };

        let text = std::str::from_utf8(&self.content).map_err(|e| GridError::Parse {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        let base = Url::parse(&self.url).map_err(|e| GridError::Parse {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;

        let mut found = Vec::new();
        for pattern in patterns {
            for captures in pattern.captures_iter(text) {
                let Some(raw) = captures.get(1) else { continue };
                if let Some(resolved) = resolve_reference(&base, raw.as_str()) {
                    if !found.contains(&resolved) {
                        found.push(resolved);
                    }
                }
            }
        }
        Ok(found)
    }
}

/// Resolve a reference against its document, dropping fragments and non-http(s) targets
pub fn resolve_reference(base: &Url, reference: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() || reference.starts_with('#') || reference.starts_with("data:") {
        return None;
    }
    let mut resolved = base.join(reference).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

/// Hash reference to a resource, as sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashObject {
    pub hash_format: String,
    pub hash: String,
    pub content_type: String,
}

/// Inline resource captured with the page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobData {
    pub url: String,
    pub content_type: String,
    #[serde(default)]
    pub content: Vec<u8>,
}

/// Snapshot of one document and its nested frames
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameData {
    pub url: String,
    /// Serialized DOM, opaque to the crawler
    #[serde(default)]
    pub cdt: serde_json::Value,
    #[serde(default)]
    pub resource_urls: Vec<String>,
    #[serde(default)]
    pub blobs: Vec<BlobData>,
    #[serde(default)]
    pub frames: Vec<FrameData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl FrameData {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_resources<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_urls.extend(urls.into_iter().map(Into::into));
        self
    }

    pub fn with_frame(mut self, frame: FrameData) -> Self {
        self.frames.push(frame);
        self
    }

    pub fn with_blob(mut self, blob: BlobData) -> Self {
        self.blobs.push(blob);
        self
    }
}

/// A document ready to be rendered: its DOM plus hashes of everything it needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderDom {
    pub url: String,
    pub cdt: serde_json::Value,
    pub resources: BTreeMap<String, HashObject>,
}

impl RenderDom {
    /// Serialize into a resource so a parent document can reference it
    pub fn as_resource(&self) -> GridResult<Resource> {
        let json = serde_json::to_vec(self)?;
        Ok(Resource::new(self.url.clone(), RENDER_DOM_CONTENT_TYPE, json))
    }
}

/// Crawl output: the root document and every resource any frame needs
#[derive(Debug, Clone)]
pub struct CollectedDom {
    pub dom: RenderDom,
    pub resources: BTreeMap<String, Arc<Resource>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let resource = Resource::new("https://a.test/x", "text/plain", "hello");
        assert_eq!(resource.sha256(), sha256_hex(b"hello"));
        assert_eq!(resource.hash_object().hash_format, "sha256");
    }

    #[test]
    fn test_css_references() {
        let css = r#"
            @import "theme.css";
            body { background: url('img/bg.png#frag'); }
            .logo { background-image: url( "https://cdn.test/logo.svg" ); }
            .inline { background: url(data:image/png;base64,AAAA); }
            .again { background: url(img/bg.png); }
        "#;
        let resource = Resource::new("https://site.test/styles/main.css", "text/css; charset=utf-8", css);
        let refs = resource.references().unwrap();

        assert_eq!(
            refs,
            vec![
                "https://site.test/styles/img/bg.png".to_string(),
                "https://cdn.test/logo.svg".to_string(),
                "https://site.test/styles/theme.css".to_string(),
            ]
        );
    }

    #[test]
    fn test_svg_references() {
        let svg = r##"<svg><use xlink:href="sprite.svg#icon"/><image href="/pic.png"/><a href="#local"/></svg>"##;
        let resource = Resource::new("https://site.test/img/a.svg", "image/svg+xml", svg);
        let refs = resource.references().unwrap();
        assert_eq!(
            refs,
            vec![
                "https://site.test/img/sprite.svg".to_string(),
                "https://site.test/pic.png".to_string(),
            ]
        );
    }

    #[test]
    fn test_other_types_have_no_references() {
        let resource = Resource::new("https://site.test/a.png", "image/png", vec![0u8, 159, 146, 150]);
        assert!(resource.references().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_parse_error() {
        let resource = Resource::new("https://site.test/a.css", "text/css", vec![0u8, 159, 146, 150]);
        assert!(matches!(resource.references(), Err(GridError::Parse { .. })));
    }

    #[test]
    fn test_render_dom_as_resource() {
        let dom = RenderDom {
            url: "https://site.test/frame.html".into(),
            cdt: serde_json::json!([{"nodeType": 9}]),
            resources: BTreeMap::new(),
        };
        let resource = dom.as_resource().unwrap();
        assert_eq!(resource.content_type(), RENDER_DOM_CONTENT_TYPE);
        let back: RenderDom = serde_json::from_slice(resource.content()).unwrap();
        assert_eq!(back, dom);
    }
}
