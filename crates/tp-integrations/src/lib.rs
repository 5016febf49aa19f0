//! Forge integrations for taskpilot: a uniform PR/MR surface over GitHub
//! and GitLab, selected per repository URL.

pub mod forge;
pub mod github;
pub mod gitlab;
pub mod types;

pub use forge::{forge_kind_for_url, pr_number_from_url, ForgeAdapter, ForgeError, ForgeKind, ForgeRouter};
pub use types::{CreatePrRequest, CreatedPr, PrState, PullRequestView};
