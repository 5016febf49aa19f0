use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    // --- Inception ---
    Draft,
    Backlog,

    // --- Spec / planning ---
    Refining,
    PendingApproval,
    Planning,
    PlanReview,
    Approved,

    // --- Execution ---
    Coding,
    InProgress,

    // --- Review loop ---
    AwaitingReview,
    Review,
    ChangesRequested,
    MergeConflicts,

    // --- PR ---
    PrCreated,

    // --- Terminal ---
    Done,
    Failed,
    Canceled,
}

/// Coarse grouping of statuses used for routing and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusGroup {
    Inception,
    Spec,
    Execution,
    ReviewLoop,
    Pr,
    Terminal,
}

impl TaskStatus {
    pub fn group(&self) -> StatusGroup {
        match self {
            TaskStatus::Draft | TaskStatus::Backlog => StatusGroup::Inception,
            TaskStatus::Refining
            | TaskStatus::PendingApproval
            | TaskStatus::Planning
            | TaskStatus::PlanReview
            | TaskStatus::Approved => StatusGroup::Spec,
            TaskStatus::Coding | TaskStatus::InProgress => StatusGroup::Execution,
            TaskStatus::AwaitingReview
            | TaskStatus::Review
            | TaskStatus::ChangesRequested
            | TaskStatus::MergeConflicts => StatusGroup::ReviewLoop,
            TaskStatus::PrCreated => StatusGroup::Pr,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled => StatusGroup::Terminal,
        }
    }

    /// Terminal statuses are sinks: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// Statuses in which a PR exists and may still change.
    pub fn is_pr_active(&self) -> bool {
        matches!(self, TaskStatus::PrCreated | TaskStatus::ChangesRequested)
    }

    /// Returns `true` when a transition from `self` to `target` is permitted.
    ///
    /// The supervisor enforces the per-operation entry tables on top of this;
    /// this only encodes the hard rule that terminal statuses are sinks.
    pub fn can_transition_to(&self, _target: &TaskStatus) -> bool {
        !self.is_terminal()
    }

    /// Statuses from which a fresh (non-resume) agent run may start.
    pub fn allows_first_start(&self) -> bool {
        matches!(
            self,
            TaskStatus::Draft
                | TaskStatus::Backlog
                | TaskStatus::Failed
                | TaskStatus::Planning
                | TaskStatus::Coding
                | TaskStatus::PlanReview
        )
    }

    /// Statuses from which a resume run may start.
    pub fn allows_resume(&self) -> bool {
        matches!(self, TaskStatus::ChangesRequested | TaskStatus::Planning)
    }

    /// All statuses the store schema permits, in declaration order.
    pub fn all() -> &'static [TaskStatus] {
        &[
            TaskStatus::Draft,
            TaskStatus::Backlog,
            TaskStatus::Refining,
            TaskStatus::PendingApproval,
            TaskStatus::Planning,
            TaskStatus::PlanReview,
            TaskStatus::Approved,
            TaskStatus::Coding,
            TaskStatus::InProgress,
            TaskStatus::AwaitingReview,
            TaskStatus::Review,
            TaskStatus::ChangesRequested,
            TaskStatus::MergeConflicts,
            TaskStatus::PrCreated,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Canceled,
        ]
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

// ---------------------------------------------------------------------------
// AgentKind
// ---------------------------------------------------------------------------

/// Which coding-CLI backend executes a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    ClaudeCode,
    Codex,
    Copilot,
    Gemini,
    Openrouter,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::ClaudeCode => "claude-code",
            AgentKind::Codex => "codex",
            AgentKind::Copilot => "copilot",
            AgentKind::Gemini => "gemini",
            AgentKind::Openrouter => "openrouter",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub repository_id: Option<Uuid>,
    pub repo_url: String,
    pub target_branch: String,
    pub title: String,
    pub description: Option<String>,
    /// Ordered relative paths the user attached as context.
    pub context_files: Vec<String>,
    /// Advisory only. The agent is forbidden from executing it.
    pub build_command: Option<String>,
    pub agent_kind: AgentKind,
    pub agent_model: Option<String>,
    pub generated_spec: Option<String>,
    pub final_spec: Option<String>,
    pub spec_approved_at: Option<DateTime<Utc>>,
    pub was_spec_edited: bool,
    pub branch_name: String,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
    /// Serialized [`ChangesData`] snapshot taken at review time. Read as a
    /// fallback when the worktree no longer exists.
    pub changes_data: Option<String>,
    pub conflict_files: Vec<String>,
    /// Plan text extracted from a completed plan-only run.
    pub plan: Option<String>,
    /// Feedback stored by `request_changes`, consumed by the next resume run.
    pub pending_feedback: Option<String>,
    pub error: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        title: impl Into<String>,
        repo_url: impl Into<String>,
        target_branch: impl Into<String>,
        agent_kind: AgentKind,
    ) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            repository_id: None,
            repo_url: repo_url.into(),
            target_branch: target_branch.into(),
            title: title.into(),
            description: None,
            context_files: Vec::new(),
            build_command: None,
            agent_kind,
            agent_model: None,
            generated_spec: None,
            final_spec: None,
            spec_approved_at: None,
            was_spec_edited: false,
            branch_name: feature_branch_name(&id),
            pr_url: None,
            pr_number: None,
            changes_data: None,
            conflict_files: Vec::new(),
            plan: None,
            pending_feedback: None,
            error: None,
            status: TaskStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    /// The repo is on the local filesystem rather than a forge.
    pub fn is_local_repo(&self) -> bool {
        self.repo_url.starts_with("file://")
    }
}

/// The feature branch every task commits into.
pub fn feature_branch_name(task_id: &Uuid) -> String {
    format!("feature/task-{task_id}")
}

// ---------------------------------------------------------------------------
// Task ID validation
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("invalid task id: {0:?}")]
pub struct InvalidTaskId(pub String);

/// Validate a task ID string against the canonical lowercase 8-4-4-4-12 hex
/// form before it is used to compose any filesystem path.
pub fn validate_task_id(raw: &str) -> Result<Uuid, InvalidTaskId> {
    let bytes = raw.as_bytes();
    if bytes.len() != 36 {
        return Err(InvalidTaskId(raw.to_string()));
    }
    for (i, b) in bytes.iter().enumerate() {
        let ok = match i {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit() && !b.is_ascii_uppercase(),
        };
        if !ok {
            return Err(InvalidTaskId(raw.to_string()));
        }
    }
    Uuid::parse_str(raw).map_err(|_| InvalidTaskId(raw.to_string()))
}

// ---------------------------------------------------------------------------
// Changed files and diff snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeStatus {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub status: FileChangeStatus,
    pub additions: u64,
    pub deletions: u64,
    /// Present only when the content is UTF-8, NUL-free, and within the
    /// configured size limit on both sides.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
}

/// Snapshot of a task's diff taken at review time, persisted to the task so
/// readers survive worktree removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesData {
    pub files: Vec<ChangedFile>,
    pub diff: String,
    pub captured_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Agent log entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogEntry {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl AgentLogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

// ---------------------------------------------------------------------------
// Chat and tool activity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: ChatRole,
    pub content: String,
    pub ts: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            ts: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolActivity {
    pub id: Uuid,
    pub name: String,
    pub summary: String,
    pub status: ToolStatus,
    pub ts: DateTime<Utc>,
}

impl ToolActivity {
    pub fn new(name: impl Into<String>, summary: impl Into<String>, status: ToolStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            summary: summary.into(),
            status,
            ts: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// PR comments
// ---------------------------------------------------------------------------

/// A PR/MR comment as surfaced by the forge adapter and the PR watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrComment {
    pub id: u64,
    pub body: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// True for inline review comments (anchored to a file/line), false for
    /// conversation comments.
    pub is_review_comment: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub id: Uuid,
    pub pattern: String,
    pub learned_from_task_id: Option<Uuid>,
}

/// A known remote repository. Identified by URL (unique). The active-task
/// count is a projection computed by the store on read, not a stored column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: Uuid,
    pub url: String,
    pub name: String,
    pub default_branch: String,
    /// Opaque to the orchestrator; produced by external stack detection.
    pub detected_stack: Option<serde_json::Value>,
    pub conventions: Option<String>,
    pub learned_patterns: Vec<LearnedPattern>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            name: name.into(),
            default_branch: "main".to_string(),
            detected_stack: None,
            conventions: None,
            learned_patterns: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_sinks() {
        for s in [TaskStatus::Done, TaskStatus::Failed, TaskStatus::Canceled] {
            assert!(s.is_terminal());
            assert!(!s.can_transition_to(&TaskStatus::Backlog));
        }
        assert!(TaskStatus::Coding.can_transition_to(&TaskStatus::AwaitingReview));
    }

    #[test]
    fn pr_active_statuses() {
        assert!(TaskStatus::PrCreated.is_pr_active());
        assert!(TaskStatus::ChangesRequested.is_pr_active());
        assert!(!TaskStatus::AwaitingReview.is_pr_active());
        assert!(!TaskStatus::Done.is_pr_active());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::AwaitingReview).unwrap();
        assert_eq!(json, "\"awaiting_review\"");
        let back: TaskStatus = serde_json::from_str("\"merge_conflicts\"").unwrap();
        assert_eq!(back, TaskStatus::MergeConflicts);
    }

    #[test]
    fn agent_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&AgentKind::ClaudeCode).unwrap();
        assert_eq!(json, "\"claude-code\"");
        assert_eq!(AgentKind::Openrouter.as_str(), "openrouter");
    }

    #[test]
    fn new_task_has_feature_branch() {
        let task = Task::new("t", "https://github.com/o/r", "main", AgentKind::ClaudeCode);
        assert_eq!(task.branch_name, format!("feature/task-{}", task.id));
        assert_eq!(task.status, TaskStatus::Draft);
    }

    #[test]
    fn validate_task_id_accepts_canonical_v4() {
        let id = Uuid::new_v4();
        let parsed = validate_task_id(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn validate_task_id_rejects_traversal_attempts() {
        assert!(validate_task_id("../../etc/passwd").is_err());
        assert!(validate_task_id("").is_err());
        assert!(validate_task_id("not-a-uuid-at-all-but-36-chars-long!").is_err());
        // Uppercase is not the canonical form.
        let upper = Uuid::new_v4().to_string().to_uppercase();
        assert!(validate_task_id(&upper).is_err());
    }

    #[test]
    fn local_repo_detection() {
        let mut task = Task::new("t", "file:///srv/repo", "main", AgentKind::Codex);
        assert!(task.is_local_repo());
        task.repo_url = "https://gitlab.com/g/p".into();
        assert!(!task.is_local_repo());
    }
}
