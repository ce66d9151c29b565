use quizpipe_core::{LinkExtractor, SkipReason};
use regex::Regex;
use std::sync::OnceLock;

/// Link shapes the heuristic extractor looks for, in the order their matches are emitted.
const HEURISTIC_PATTERNS: [&str; 4] = [
    // Any href target.
    r#"(?i)href=["']([^"']+)"#,
    // An href that follows a "CSV" mention.
    r#"(?i)\bCSV[^"']+href=["']([^"']+)"#,
    // "download…" followed by a bare token.
    r#"(?i)\bdownload[^ ]+\s+([^\s"'<>]+)"#,
    // "Scrape…" followed by a bare token.
    r#"(?i)\bScrape[^ ]+\s+([^\s"'<>]+)"#,
];

fn heuristic_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        HEURISTIC_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("heuristic link regex is valid"))
            .collect()
    })
}

/// Regex-based extractor that works on markup and plain text alike.
///
/// Matches from each pattern are concatenated pattern by pattern, so a link hit by
/// several patterns shows up several times; callers dedup.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicLinkExtractor;

impl LinkExtractor for HeuristicLinkExtractor {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn candidate_links(&self, buffer: &str) -> Vec<String> {
        let mut out = Vec::new();
        for re in heuristic_patterns() {
            out.extend(
                re.captures_iter(buffer)
                    .filter_map(|c| c.get(1))
                    .map(|m| m.as_str().to_string()),
            );
        }
        out
    }
}

/// Structured alternative: `<a href>` targets in document order.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnchorLinkExtractor;

impl LinkExtractor for AnchorLinkExtractor {
    fn name(&self) -> &'static str {
        "anchors"
    }

    fn candidate_links(&self, buffer: &str) -> Vec<String> {
        let doc = html_scraper::Html::parse_document(buffer);
        let sel = match html_scraper::Selector::parse("a[href]") {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        doc.select(&sel)
            .filter_map(|el| el.value().attr("href"))
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Why a raw link is dropped before resolution, if it is.
pub fn raw_skip_reason(raw: &str) -> Option<SkipReason> {
    if raw.starts_with('#') {
        return Some(SkipReason::Fragment);
    }
    let is_js = raw
        .get(..10)
        .is_some_and(|p| p.eq_ignore_ascii_case("javascript"));
    if is_js {
        return Some(SkipReason::JavascriptScheme);
    }
    None
}

/// Resolve a raw link against the page it was found on.
///
/// - `/path` → `scheme://authority` of `base` + `/path` (verbatim, no normalization)
/// - `http…` → used as-is
/// - anything else → RFC 3986 reference resolution against `base`
pub fn resolve_link(base: &str, raw: &str) -> Option<String> {
    if raw.trim().is_empty() {
        return None;
    }
    if raw.starts_with('/') {
        let b = url::Url::parse(base).ok()?;
        return Some(format!("{}://{}{}", b.scheme(), b.authority(), raw));
    }
    if raw.starts_with("http") {
        return Some(raw.to_string());
    }
    let b = url::Url::parse(base).ok()?;
    b.join(raw).ok().map(|u| u.to_string())
}

/// Links that could re-trigger a quiz submission are never fetched.
pub fn is_submit_url(resolved: &str) -> bool {
    resolved.to_lowercase().contains("submit")
}
