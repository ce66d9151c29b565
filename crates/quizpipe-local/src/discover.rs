//! Secondary-resource discovery for a rendered quiz page.
//!
//! Candidates come from a [`LinkExtractor`], are filtered and resolved by
//! [`plan_fetches`], then fetched one after another. A fetched body that looks like
//! an unrendered JS shell is replaced by a real render of the same URL.

use crate::links::{self, HeuristicLinkExtractor};
use quizpipe_core::{
    truncate_chars, DiscoveryReport, FetchBackend, FetchOutcome, FetchRequest, LinkExtractor,
    PageRenderer, ResourceOrigin, ResourceRecord, ResourceSet, SkipReason, SkippedLink,
    StepStatus, DEFAULT_FETCH_TIMEOUT_MS, JS_STUB_MAX_CHARS, MAX_RESOURCE_CHARS,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Default cap on bytes read per resource. Far above what is kept, so the
/// JS-stub length test still sees real sizes.
pub const DEFAULT_MAX_FETCH_BYTES: u64 = 2_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFetch {
    pub raw: String,
    pub url: String,
}

/// Filter, dedup and resolve raw candidates, keeping first-appearance order.
///
/// Pure: the same inputs always give the same plan.
pub fn plan_fetches(base_url: &str, candidates: &[String]) -> (Vec<PlannedFetch>, Vec<SkippedLink>) {
    let mut planned = Vec::new();
    let mut skipped = Vec::new();
    let mut seen_raw = BTreeSet::<&str>::new();
    let mut seen_url = BTreeSet::<String>::new();

    for raw in candidates {
        let skip = |reason: SkipReason, resolved: Option<String>| SkippedLink {
            raw: raw.clone(),
            reason,
            resolved,
        };
        if let Some(reason) = links::raw_skip_reason(raw) {
            skipped.push(skip(reason, None));
            continue;
        }
        if !seen_raw.insert(raw.as_str()) {
            skipped.push(skip(SkipReason::Duplicate, None));
            continue;
        }
        let Some(url) = links::resolve_link(base_url, raw) else {
            skipped.push(skip(SkipReason::Unresolvable, None));
            continue;
        };
        if links::is_submit_url(&url) {
            skipped.push(skip(SkipReason::SubmitLink, Some(url)));
            continue;
        }
        // Two spellings of the same target ("/a" and "http://host/a") are fetched once.
        if !seen_url.insert(url.clone()) {
            skipped.push(skip(SkipReason::Duplicate, Some(url)));
            continue;
        }
        planned.push(PlannedFetch {
            raw: raw.clone(),
            url,
        });
    }
    (planned, skipped)
}

/// A small body that still carries a `<script` tag: the real content needs a browser.
pub fn looks_like_js_stub(body: &str) -> bool {
    body.contains("<script") && body.chars().count() < JS_STUB_MAX_CHARS
}

#[derive(Clone)]
pub struct ResourceDiscoverer {
    fetcher: Arc<dyn FetchBackend>,
    renderer: Arc<dyn PageRenderer>,
    extractor: Arc<dyn LinkExtractor>,
    fetch_timeout_ms: u64,
    max_fetch_bytes: u64,
}

impl ResourceDiscoverer {
    pub fn new(fetcher: Arc<dyn FetchBackend>, renderer: Arc<dyn PageRenderer>) -> Self {
        Self {
            fetcher,
            renderer,
            extractor: Arc::new(HeuristicLinkExtractor),
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_fetch_bytes: DEFAULT_MAX_FETCH_BYTES,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn LinkExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_fetch_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.fetch_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_fetch_bytes(mut self, max_bytes: u64) -> Self {
        self.max_fetch_bytes = max_bytes;
        self
    }

    pub fn renderer(&self) -> &Arc<dyn PageRenderer> {
        &self.renderer
    }

    /// Find, fetch and snapshot every resource referenced by a page.
    ///
    /// Never fails as a whole: each skipped link and failed fetch is recorded in the
    /// report and discovery moves on.
    pub async fn discover(
        &self,
        base_url: &str,
        markup: &str,
        visible_text: &str,
    ) -> (ResourceSet, DiscoveryReport) {
        let mut buffer = String::with_capacity(markup.len() + visible_text.len());
        buffer.push_str(markup);
        buffer.push_str(visible_text);

        let candidates = self.extractor.candidate_links(&buffer);
        let (planned, skipped) = plan_fetches(base_url, &candidates);
        tracing::info!(
            base_url,
            extractor = self.extractor.name(),
            candidates = candidates.len(),
            planned = planned.len(),
            skipped = skipped.len(),
            "discovered resource links"
        );

        let mut report = DiscoveryReport {
            extractor: self.extractor.name().to_string(),
            candidates: candidates.len(),
            skipped,
            fetches: Vec::with_capacity(planned.len()),
        };
        let mut resources = ResourceSet::new();
        for p in planned {
            let (outcome, record) = self.fetch_one(&p.url).await;
            if let Some(record) = record {
                resources.insert(record);
            }
            report.fetches.push(outcome);
        }
        (resources, report)
    }

    async fn fetch_one(&self, url: &str) -> (FetchOutcome, Option<ResourceRecord>) {
        let failed = |status: StepStatus, http_status: Option<u16>| FetchOutcome {
            url: url.to_string(),
            status,
            http_status,
            origin: None,
            fallback_render: None,
            body_chars: 0,
            truncated: false,
        };

        tracing::info!(url, "fetching resource");
        let req = FetchRequest {
            url: url.to_string(),
            timeout_ms: Some(self.fetch_timeout_ms),
            max_bytes: Some(self.max_fetch_bytes),
        };
        let resp = match self.fetcher.fetch(&req).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(url, error = %e, "resource fetch failed");
                return (failed(StepStatus::failed(e), None), None);
            }
        };
        if !resp.is_success() {
            tracing::warn!(url, status = resp.status, "resource fetch returned non-success status");
            return (
                failed(
                    StepStatus::failed(format!("HTTP {}", resp.status)),
                    Some(resp.status),
                ),
                None,
            );
        }

        let mut body = resp.text_lossy();
        let mut origin = ResourceOrigin::StaticFetch;
        let mut fallback_render = None;
        if looks_like_js_stub(&body) {
            tracing::info!(url, "body looks like a JS stub; rendering instead");
            origin = ResourceOrigin::RenderedFallback;
            match self.renderer.render(url).await {
                Ok(snapshot) => {
                    body = snapshot.visible_text;
                    fallback_render = Some(StepStatus::Ok);
                }
                Err(e) => {
                    tracing::warn!(url, error = %e, "fallback render failed");
                    body = String::new();
                    fallback_render = Some(StepStatus::failed(e));
                }
            }
        }

        let body_chars = body.chars().count();
        let record = ResourceRecord::new(url, &body, origin);
        tracing::debug!(
            url,
            chars = body_chars,
            preview = truncate_chars(&record.body, 200),
            "stored resource"
        );
        let outcome = FetchOutcome {
            url: url.to_string(),
            status: StepStatus::Ok,
            http_status: Some(resp.status),
            origin: Some(origin),
            fallback_render,
            body_chars: record.body.chars().count(),
            truncated: resp.truncated || body_chars > MAX_RESOURCE_CHARS,
        };
        (outcome, Some(record))
    }
}
