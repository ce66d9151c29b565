use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod diagnostics;

pub use diagnostics::{
    AggregationOutcome, DiscoveryReport, FetchOutcome, RunDiagnostics, SkipReason, SkippedLink,
    SolveStage, StepStatus,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("render failed: {0}")]
    Render(String),
    #[error("aggregation failed: {0}")]
    Aggregate(String),
    #[error("llm failed: {0}")]
    Llm(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("not supported: {0}")]
    NotSupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Hard cap on a stored resource body, in characters.
pub const MAX_RESOURCE_CHARS: usize = 12_000;
/// Bodies shorter than this that contain `<script` are treated as unrendered JS stubs.
pub const JS_STUB_MAX_CHARS: usize = 600;
/// Per-resource GET timeout.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 15_000;
/// Post-navigation settle delay before content is read.
pub const DEFAULT_SETTLE_MS: u64 = 3_000;
/// How much of the page markup goes into the prompt.
pub const MARKUP_PREFIX_CHARS: usize = 5_000;

/// Longest prefix of `s` holding at most `max_chars` characters.
///
/// Never splits a multi-byte character.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    /// Timeout for the whole request (connect + body).
    pub timeout_ms: Option<u64>,
    /// Hard cap on bytes read from the response body.
    pub max_bytes: Option<u64>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: None,
            max_bytes: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub timings_ms: BTreeMap<String, u128>,
}

impl FetchResponse {
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).to_string()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait::async_trait]
pub trait FetchBackend: Send + Sync {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse>;
}

/// One rendered page. Produced once per render call and never mutated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageSnapshot {
    pub url: String,
    pub visible_text: String,
    pub raw_markup: String,
}

impl PageSnapshot {
    /// The degraded snapshot used when rendering fails.
    pub fn blank(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    pub fn is_blank(&self) -> bool {
        self.visible_text.is_empty() && self.raw_markup.is_empty()
    }
}

#[async_trait::async_trait]
pub trait PageRenderer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn render(&self, url: &str) -> Result<PageSnapshot>;
}

/// How long a renderer lets script-driven content populate before reading the page.
pub trait SettleWait: Send + Sync {
    fn settle_delay(&self) -> Duration;
}

/// Fixed post-navigation delay; no readiness probing.
#[derive(Debug, Clone, Copy)]
pub struct FixedSettle(pub Duration);

impl Default for FixedSettle {
    fn default() -> Self {
        Self(Duration::from_millis(DEFAULT_SETTLE_MS))
    }
}

impl SettleWait for FixedSettle {
    fn settle_delay(&self) -> Duration {
        self.0
    }
}

/// Zero-delay stand-in for tests and static pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSettle;

impl SettleWait for NoSettle {
    fn settle_delay(&self) -> Duration {
        Duration::ZERO
    }
}

/// Source of raw (unresolved) link strings found in a scan buffer.
pub trait LinkExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    /// Raw candidates in extraction order. May contain repeats.
    fn candidate_links(&self, buffer: &str) -> Vec<String>;
}

#[async_trait::async_trait]
pub trait AnswerGenerator: Send + Sync {
    fn name(&self) -> &str;
    /// Returns the service's free-form reply, uninterpreted.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOrigin {
    StaticFetch,
    RenderedFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRecord {
    pub url: String,
    pub body: String,
    pub origin: ResourceOrigin,
}

impl ResourceRecord {
    /// Builds a record, truncating `body` to [`MAX_RESOURCE_CHARS`].
    pub fn new(url: impl Into<String>, body: &str, origin: ResourceOrigin) -> Self {
        Self {
            url: url.into(),
            body: truncate_chars(body, MAX_RESOURCE_CHARS).to_string(),
            origin,
        }
    }
}

/// Resources keyed by resolved URL, in discovery order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSet {
    records: Vec<ResourceRecord>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `record` unless its URL is already present (first insertion wins).
    pub fn insert(&mut self, record: ResourceRecord) -> bool {
        if self.contains(&record.url) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn contains(&self, url: &str) -> bool {
        self.records.iter().any(|r| r.url == url)
    }

    pub fn get(&self, url: &str) -> Option<&ResourceRecord> {
        self.records.iter().find(|r| r.url == url)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResourceRecord> {
        self.records.iter()
    }

    pub fn urls(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.url.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<'a> IntoIterator for &'a ResourceSet {
    type Item = &'a ResourceRecord;
    type IntoIter = std::slice::Iter<'a, ResourceRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Everything handed to the answer service for one quiz page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptContext {
    pub page: PageSnapshot,
    pub resources: ResourceSet,
    pub cutoff: Option<i64>,
    pub numeric_result: Option<f64>,
    /// URL of the resource `numeric_result` was computed from.
    pub numeric_source: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn resource_record_caps_body() {
        let big = "é".repeat(MAX_RESOURCE_CHARS + 50);
        let r = ResourceRecord::new("https://a.test/x", &big, ResourceOrigin::StaticFetch);
        assert_eq!(r.body.chars().count(), MAX_RESOURCE_CHARS);
    }

    #[test]
    fn resource_set_keeps_first_insertion_order() {
        let mut set = ResourceSet::new();
        assert!(set.insert(ResourceRecord::new("b", "1", ResourceOrigin::StaticFetch)));
        assert!(set.insert(ResourceRecord::new("a", "2", ResourceOrigin::StaticFetch)));
        assert!(!set.insert(ResourceRecord::new("b", "3", ResourceOrigin::RenderedFallback)));
        assert_eq!(set.urls(), vec!["b", "a"]);
        assert_eq!(set.get("b").map(|r| r.body.as_str()), Some("1"));
    }

    #[test]
    fn settle_waits() {
        assert_eq!(FixedSettle::default().settle_delay(), Duration::from_secs(3));
        assert_eq!(NoSettle.settle_delay(), Duration::ZERO);
    }

    #[test]
    fn fetch_response_success_range() {
        let mut r = FetchResponse {
            url: "u".to_string(),
            final_url: "u".to_string(),
            status: 204,
            content_type: None,
            bytes: b"ok".to_vec(),
            truncated: false,
            timings_ms: BTreeMap::new(),
        };
        assert!(r.is_success());
        r.status = 404;
        assert!(!r.is_success());
        assert_eq!(r.text_lossy(), "ok");
    }
}
