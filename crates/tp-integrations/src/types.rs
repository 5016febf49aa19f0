use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

/// Request to open a PR/MR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePrRequest {
    pub repo_url: String,
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// A freshly created PR/MR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedPr {
    pub url: String,
    pub number: u64,
}

/// The subset of PR/MR state the orchestrator cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestView {
    pub number: u64,
    pub title: String,
    pub state: PrState,
    pub mergeable: Option<bool>,
    pub base_ref: String,
    pub head_ref: String,
    pub html_url: String,
}
