//! Per-run outcome record.
//!
//! Every pipeline step degrades instead of aborting; this is where the
//! degradation becomes visible to callers without scraping logs.

use crate::ResourceOrigin;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum SolveStage {
    #[default]
    Idle,
    Rendering,
    Discovering,
    Aggregating,
    PromptReady,
    Dispatched,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed {
        error: String,
    },
    #[default]
    Skipped,
}

impl StepStatus {
    pub fn failed(error: impl ToString) -> Self {
        Self::Failed {
            error: error.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Fragment,
    JavascriptScheme,
    Duplicate,
    Unresolvable,
    SubmitLink,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedLink {
    pub raw: String,
    pub reason: SkipReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchOutcome {
    pub url: String,
    #[serde(flatten)]
    pub status: StepStatus,
    pub http_status: Option<u16>,
    pub origin: Option<ResourceOrigin>,
    /// Set only when the fetched body looked like a JS stub.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_render: Option<StepStatus>,
    pub body_chars: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub extractor: String,
    pub candidates: usize,
    pub skipped: Vec<SkippedLink>,
    pub fetches: Vec<FetchOutcome>,
}

impl DiscoveryReport {
    pub fn fallback_render_count(&self) -> usize {
        self.fetches
            .iter()
            .filter(|f| f.fallback_render.is_some())
            .count()
    }

    pub fn failed_fetch_count(&self) -> usize {
        self.fetches.iter().filter(|f| f.status.is_failed()).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregationOutcome {
    pub url: String,
    #[serde(flatten)]
    pub status: StepStatus,
    pub sum: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunDiagnostics {
    pub stage: SolveStage,
    pub render: StepStatus,
    pub cutoff: Option<i64>,
    pub discovery: DiscoveryReport,
    pub aggregations: Vec<AggregationOutcome>,
    pub dispatch: StepStatus,
}

impl RunDiagnostics {
    pub fn advance(&mut self, stage: SolveStage) {
        debug_assert!(stage >= self.stage, "stages only move forward");
        self.stage = stage;
    }
}
