//! One quiz page in, one prompt (and optionally one raw answer) out.

use crate::discover::ResourceDiscoverer;
use crate::numeric::try_sum_numeric_cells;
use quizpipe_core::{
    truncate_chars, AggregationOutcome, AnswerGenerator, PageRenderer, PageSnapshot,
    PromptContext, ResourceSet, RunDiagnostics, SolveStage, StepStatus, MARKUP_PREFIX_CHARS,
};
use regex::Regex;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};

const PROMPT_HEADER: &str = "Extract the exact quiz answer.";

const RULESET: &str = r#"RULESET:
1. If a short “secret code” or token is present in the fetched resources, output exactly that.
2. If a precomputed numeric sum is included, that sum IS the answer.
3. Only return a JSON object like:
   {"submit_url": "/submit", "answer": VALUE}
4. Nothing except the JSON."#;

/// How many leading body characters are checked for a digit.
const DIGIT_PROBE_CHARS: usize = 80;

fn cutoff_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)cutoff[: ]+(\d+)").expect("cutoff regex is valid"))
}

/// First `cutoff: N` in the visible text.
///
/// Digits too large for `i64` are treated as no cutoff at all.
pub fn extract_cutoff(visible_text: &str) -> Option<i64> {
    let caps = cutoff_re().captures(visible_text)?;
    let digits = caps.get(1)?.as_str();
    match digits.parse::<i64>() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(digits, error = %e, "cutoff does not fit in i64; ignoring");
            None
        }
    }
}

/// A resource is aggregated when its URL names a CSV or its body starts out numeric.
pub fn qualifies_for_aggregation(url: &str, body: &str) -> bool {
    url.contains(".csv")
        || truncate_chars(body, DIGIT_PROBE_CHARS)
            .chars()
            .any(char::is_numeric)
}

/// Aggregate every qualifying resource in order. The last one decides the result.
///
/// Returns `(numeric_result, source_url, per_resource_outcomes)`. A fault on a later
/// resource clears an earlier result instead of falling back to it.
pub fn select_numeric_result(
    resources: &ResourceSet,
    cutoff: Option<i64>,
) -> (Option<f64>, Option<String>, Vec<AggregationOutcome>) {
    let threshold = cutoff.map(|c| c as f64);
    let mut result = None;
    let mut source = None;
    let mut outcomes = Vec::new();
    for r in resources {
        if !qualifies_for_aggregation(&r.url, &r.body) {
            continue;
        }
        match try_sum_numeric_cells(&r.body, threshold) {
            Ok(sum) => {
                tracing::info!(url = %r.url, sum, "aggregated resource");
                result = Some(sum);
                source = Some(r.url.clone());
                outcomes.push(AggregationOutcome {
                    url: r.url.clone(),
                    status: StepStatus::Ok,
                    sum: Some(sum),
                });
            }
            Err(e) => {
                tracing::warn!(url = %r.url, error = %e, "numeric aggregation failed");
                result = None;
                source = None;
                outcomes.push(AggregationOutcome {
                    url: r.url.clone(),
                    status: StepStatus::failed(e),
                    sum: None,
                });
            }
        }
    }
    (result, source, outcomes)
}

/// Whole sums keep a trailing `.0` (`30.0`), others print shortest round-trip form.
fn format_sum(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e16 {
        format!("{v:.1}")
    } else {
        v.to_string()
    }
}

/// Resource dump plus the numeric line; empty when there is nothing to add.
pub fn build_appendix(
    resources: &ResourceSet,
    cutoff: Option<i64>,
    numeric_result: Option<f64>,
) -> String {
    let mut out = String::new();
    if !resources.is_empty() {
        out.push_str("\n\n### RESOURCE DUMP\n");
        for r in resources {
            let _ = write!(out, "\n[{}]\n{}\n", r.url, r.body);
        }
    }
    if let Some(sum) = numeric_result {
        let cutoff = cutoff.map_or_else(|| "None".to_string(), |c| c.to_string());
        let sum = format_sum(sum);
        let _ = write!(out, "\n\n### NUMERIC RESULT\nSUM > cutoff({cutoff}) = {sum}");
    }
    out
}

pub fn build_prompt(ctx: &PromptContext) -> String {
    let appendix = build_appendix(&ctx.resources, ctx.cutoff, ctx.numeric_result);
    format!(
        "\n{PROMPT_HEADER}\n\n--- PAGE TEXT ---\n{}\n\n--- HTML (snippet) ---\n{}\n\n{appendix}\n\n{RULESET}\n",
        ctx.page.visible_text,
        truncate_chars(&ctx.page.raw_markup, MARKUP_PREFIX_CHARS),
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct SolveReport {
    pub context: PromptContext,
    pub prompt: String,
    /// The generator's reply, verbatim. `None` when not dispatched or dispatch failed.
    pub answer_raw: Option<String>,
    pub diagnostics: RunDiagnostics,
}

#[derive(Clone)]
pub struct QuizSolver {
    renderer: Arc<dyn PageRenderer>,
    discoverer: ResourceDiscoverer,
    generator: Option<Arc<dyn AnswerGenerator>>,
}

impl QuizSolver {
    pub fn new(renderer: Arc<dyn PageRenderer>, discoverer: ResourceDiscoverer) -> Self {
        Self {
            renderer,
            discoverer,
            generator: None,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn AnswerGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Render, discover, aggregate and build the prompt. Never dispatches.
    pub async fn prepare(&self, url: &str) -> SolveReport {
        let mut diag = RunDiagnostics::default();

        diag.advance(SolveStage::Rendering);
        tracing::info!(url, renderer = self.renderer.name(), "rendering quiz page");
        let page = match self.renderer.render(url).await {
            Ok(p) => {
                diag.render = StepStatus::Ok;
                p
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "render failed; continuing with an empty page");
                diag.render = StepStatus::failed(e);
                PageSnapshot::blank(url)
            }
        };
        let cutoff = extract_cutoff(&page.visible_text);
        diag.cutoff = cutoff;

        diag.advance(SolveStage::Discovering);
        let (resources, discovery) = self
            .discoverer
            .discover(url, &page.raw_markup, &page.visible_text)
            .await;
        diag.discovery = discovery;

        diag.advance(SolveStage::Aggregating);
        let (numeric_result, numeric_source, aggregations) =
            select_numeric_result(&resources, cutoff);
        diag.aggregations = aggregations;

        let context = PromptContext {
            page,
            resources,
            cutoff,
            numeric_result,
            numeric_source,
        };
        let prompt = build_prompt(&context);
        diag.advance(SolveStage::PromptReady);
        tracing::info!(
            url,
            resources = context.resources.len(),
            ?cutoff,
            ?numeric_result,
            prompt_chars = prompt.chars().count(),
            "prompt ready"
        );

        SolveReport {
            context,
            prompt,
            answer_raw: None,
            diagnostics: diag,
        }
    }

    /// [`prepare`](Self::prepare), then one call to the answer generator.
    pub async fn solve(&self, url: &str) -> SolveReport {
        let mut report = self.prepare(url).await;
        let Some(generator) = &self.generator else {
            report.diagnostics.dispatch = StepStatus::failed("no answer generator configured");
            return report;
        };
        match generator.generate(&report.prompt).await {
            Ok(answer) => {
                report.answer_raw = Some(answer);
                report.diagnostics.dispatch = StepStatus::Ok;
                report.diagnostics.advance(SolveStage::Dispatched);
            }
            Err(e) => {
                tracing::warn!(url, generator = generator.name(), error = %e, "answer generation failed");
                report.diagnostics.dispatch = StepStatus::failed(e);
            }
        }
        report
    }
}
