//! The agent supervisor: owns the task lifecycle state machine, the per-run
//! timeout timers, and the review → PR pipeline. It is the only writer of
//! task status; every transition is mirrored as a `status` event on the bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use tp_bridge::event_bus::EventBus;
use tp_bridge::protocol::{ErrorCode, TaskEvent};
use tp_core::buffers::TaskBuffers;
use tp_core::secrets::{SecretStore, AI_API_KEY, GITHUB_TOKEN, GITLAB_TOKEN};
use tp_core::task_store::{TaskPatch, TaskStore, TaskStoreError};
use tp_core::types::{AgentLogEntry, ChangesData, ChatMessage, ChatRole, Task, TaskStatus};
use tp_core::worktree_manager::{
    GitCredential, MergeOutcome, WorktreeError, WorktreeManager,
};
use tp_integrations::forge::{forge_kind_for_url, ForgeAdapter, ForgeError, ForgeKind};
use tp_integrations::types::CreatePrRequest;
use tp_session::process_registry::ProcessRegistry;

use crate::runner::{AgentControl, AgentRunner, RunnerItem, RunnerOptions};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
    #[error("agent already running for task {0}")]
    AlreadyRunning(Uuid),
    #[error("no agent running for task {0}")]
    NotRunning(Uuid),
    #[error("cannot {operation} while task is {status}")]
    InvalidStatus {
        operation: &'static str,
        status: TaskStatus,
    },
    #[error("task {0} has no stored plan to approve")]
    NoPlan(Uuid),
    #[error("task {0} has no worktree on disk")]
    NoWorktree(Uuid),
    #[error(transparent)]
    Store(#[from] TaskStoreError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Forge(#[from] ForgeError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

// ---------------------------------------------------------------------------
// Config / options / outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub default_timeout_ms: u64,
    pub warning_threshold_ms: u64,
    pub extension_ms: u64,
    pub silence_warning_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10 * 60 * 1000,
            warning_threshold_ms: 5 * 60 * 1000,
            extension_ms: 5 * 60 * 1000,
            silence_warning_ms: 30 * 1000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub is_resume: bool,
    pub plan_only: bool,
    pub approved_plan: Option<String>,
}

/// Outcome of [`AgentSupervisor::approve_and_create_pr`].
#[derive(Debug, Clone)]
pub enum ApproveOutcome {
    PrCreated { url: String, number: u64 },
    MergeConflicts(Vec<String>),
}

// ---------------------------------------------------------------------------
// ActiveAgent bookkeeping
// ---------------------------------------------------------------------------

struct ActiveAgent {
    control: AgentControl,
    started_at: DateTime<Utc>,
    warning_sent: Arc<AtomicBool>,
    warning_timer: tokio::task::JoinHandle<()>,
    deadline_timer: tokio::task::JoinHandle<()>,
}

impl ActiveAgent {
    fn disarm(&self) {
        self.warning_timer.abort();
        self.deadline_timer.abort();
    }
}

/// Context the item pump needs after the runner finishes.
#[derive(Clone)]
struct RunContext {
    is_resume: bool,
    plan_only: bool,
    target_branch: String,
    branch_name: String,
    credential: Option<GitCredential>,
}

// ---------------------------------------------------------------------------
// AgentSupervisor
// ---------------------------------------------------------------------------

pub struct AgentSupervisor {
    store: Arc<TaskStore>,
    bus: EventBus,
    buffers: Arc<TaskBuffers>,
    registry: Arc<ProcessRegistry>,
    worktrees: Arc<WorktreeManager>,
    forge: Arc<dyn ForgeAdapter>,
    secrets: Arc<dyn SecretStore>,
    runner: AgentRunner,
    active: DashMap<Uuid, ActiveAgent>,
    config: SupervisorConfig,
}

impl AgentSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TaskStore>,
        bus: EventBus,
        buffers: Arc<TaskBuffers>,
        registry: Arc<ProcessRegistry>,
        worktrees: Arc<WorktreeManager>,
        forge: Arc<dyn ForgeAdapter>,
        secrets: Arc<dyn SecretStore>,
        runner: AgentRunner,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            buffers,
            registry,
            worktrees,
            forge,
            secrets,
            runner,
            active: DashMap::new(),
            config,
        })
    }

    pub fn has_active_agent(&self, task_id: Uuid) -> bool {
        self.active.contains_key(&task_id)
    }

    pub fn active_agent_count(&self) -> usize {
        self.active.len()
    }

    // -----------------------------------------------------------------------
    // start / approve plan
    // -----------------------------------------------------------------------

    /// Start an agent run for a task: prepare the worktree, spawn the CLI,
    /// arm the timers, and pump runner items onto the bus.
    pub async fn start_agent(self: &Arc<Self>, task_id: Uuid, opts: StartOptions) -> Result<()> {
        let task = self.get_task(task_id).await?;

        let status_ok = if opts.approved_plan.is_some() {
            task.status == TaskStatus::PlanReview
        } else if opts.is_resume {
            task.status.allows_resume()
        } else {
            task.status.allows_first_start()
        };
        if !status_ok {
            return Err(SupervisorError::InvalidStatus {
                operation: "start agent",
                status: task.status,
            });
        }

        if self.active.contains_key(&task_id) {
            return Err(SupervisorError::AlreadyRunning(task_id));
        }

        let credential = self.git_credential_for(&task.repo_url).await;
        let setup = self
            .worktrees
            .setup_worktree(task_id, &task.repo_url, &task.target_branch, credential.as_ref())
            .await?;

        let repository = self.store.repository_by_url(&task.repo_url).await?;

        let review_feedback = if opts.is_resume {
            let feedback = task.pending_feedback.clone();
            if feedback.is_some() {
                self.store
                    .update_task(
                        task_id,
                        TaskPatch {
                            pending_feedback: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            feedback
        } else {
            None
        };

        let ai_key = self.secrets.get(AI_API_KEY).await;

        let context = RunContext {
            is_resume: opts.is_resume,
            plan_only: opts.plan_only,
            target_branch: task.target_branch.clone(),
            branch_name: task.branch_name.clone(),
            credential,
        };

        let running = self.runner.spawn_run(RunnerOptions {
            task: task.clone(),
            repository,
            worktree_path: setup.path,
            is_resume: opts.is_resume,
            review_feedback,
            is_empty_repo: setup.is_empty_repo,
            plan_only: opts.plan_only,
            approved_plan: opts.approved_plan,
            credential: ai_key,
            silence_warning_ms: self.config.silence_warning_ms,
        });

        let warning_sent = Arc::new(AtomicBool::new(false));
        let (warning_timer, deadline_timer) =
            self.arm_timers(task_id, self.config.default_timeout_ms, Arc::clone(&warning_sent));

        self.active.insert(
            task_id,
            ActiveAgent {
                control: running.control.clone(),
                started_at: Utc::now(),
                warning_sent,
                warning_timer,
                deadline_timer,
            },
        );

        info!(task_id = %task_id, resume = opts.is_resume, "agent started");

        let supervisor = Arc::clone(self);
        let items = running.items;
        let outcome = running.outcome;
        tokio::spawn(async move {
            supervisor.pump(task_id, items, outcome, context).await;
        });

        Ok(())
    }

    /// Approve a stored plan and launch the implementation run.
    pub async fn approve_plan(self: &Arc<Self>, task_id: Uuid) -> Result<()> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::PlanReview {
            return Err(SupervisorError::InvalidStatus {
                operation: "approve plan",
                status: task.status,
            });
        }
        let plan = task.plan.clone().ok_or(SupervisorError::NoPlan(task_id))?;
        self.start_agent(
            task_id,
            StartOptions {
                approved_plan: Some(plan),
                ..Default::default()
            },
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Review / PR pipeline
    // -----------------------------------------------------------------------

    /// Merge the target branch, push the feature branch, and open the PR.
    /// A failed merge persists the conflicting files and stops short of the
    /// push.
    pub async fn approve_and_create_pr(self: &Arc<Self>, task_id: Uuid) -> Result<ApproveOutcome> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::AwaitingReview {
            return Err(SupervisorError::InvalidStatus {
                operation: "approve and create PR",
                status: task.status,
            });
        }
        let path = self
            .worktrees
            .existing_worktree_path(task_id)?
            .ok_or(SupervisorError::NoWorktree(task_id))?;

        // Pick up anything the agent left uncommitted.
        if let Err(e) = self
            .worktrees
            .commit_changes(&path, &format!("Task: {}", task.title))
            .await
        {
            warn!(task_id = %task_id, error = %e, "pre-push commit failed");
        }

        // The worktree's own origin is authoritative; a file:// task's stored
        // URL never reaches the forge.
        let origin = self.worktrees.origin_url(&path).await?;

        self.worktrees
            .fetch_in_worktree(&path, &task.target_branch)
            .await?;
        let merge_ref = format!("origin/{}", task.target_branch);
        match self.worktrees.merge_branch(&path, &merge_ref).await? {
            MergeOutcome::Conflicts(files) => {
                warn!(task_id = %task_id, conflicts = ?files, "target merge conflicted");
                self.store
                    .update_task(
                        task_id,
                        TaskPatch {
                            status: Some(TaskStatus::MergeConflicts),
                            conflict_files: Some(files.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.bus.publish(
                    task_id,
                    TaskEvent::Status {
                        new: TaskStatus::MergeConflicts,
                    },
                );
                return Ok(ApproveOutcome::MergeConflicts(files));
            }
            MergeOutcome::Merged | MergeOutcome::UpToDate => {}
        }

        self.set_status(task_id, TaskStatus::Approved).await?;

        let credential = self.git_credential_for(&origin).await;
        if let Err(e) = self
            .worktrees
            .push_branch(&path, &task.branch_name, credential.as_ref())
            .await
        {
            error!(task_id = %task_id, error = %e, "push failed");
            self.set_status(task_id, TaskStatus::AwaitingReview).await?;
            self.bus.publish(
                task_id,
                TaskEvent::Error {
                    msg: format!("push failed: {e}"),
                    code: None,
                },
            );
            return Err(e.into());
        }

        let request = CreatePrRequest {
            repo_url: origin,
            head: task.branch_name.clone(),
            base: task.target_branch.clone(),
            title: task.title.clone(),
            body: task
                .description
                .clone()
                .unwrap_or_else(|| format!("Automated changes for task: {}", task.title)),
        };
        let created = match self.forge.create_pr(&request).await {
            Ok(created) => created,
            Err(e) => {
                // Auth failures are not retried; hand the task back to the
                // user so they can fix the token and try again.
                self.set_status(task_id, TaskStatus::AwaitingReview).await?;
                let (msg, code) = if e.is_auth() {
                    (
                        "forge token missing or invalid — configure it in settings".to_string(),
                        Some(ErrorCode::ForgeAuth),
                    )
                } else {
                    (format!("PR creation failed: {e}"), None)
                };
                self.bus.publish(task_id, TaskEvent::Error { msg, code });
                return Err(e.into());
            }
        };

        self.store
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::PrCreated),
                    pr_url: Some(Some(created.url.clone())),
                    pr_number: Some(Some(created.number)),
                    conflict_files: Some(Vec::new()),
                    error: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.bus.publish(
            task_id,
            TaskEvent::Status {
                new: TaskStatus::PrCreated,
            },
        );
        info!(task_id = %task_id, url = %created.url, "pull request created");

        Ok(ApproveOutcome::PrCreated {
            url: created.url,
            number: created.number,
        })
    }

    /// Store reviewer feedback and park the task until the next resume run.
    pub async fn request_changes(self: &Arc<Self>, task_id: Uuid, feedback: String) -> Result<()> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::PrCreated {
            return Err(SupervisorError::InvalidStatus {
                operation: "request changes",
                status: task.status,
            });
        }
        self.store
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::ChangesRequested),
                    pending_feedback: Some(Some(feedback)),
                    ..Default::default()
                },
            )
            .await?;
        self.bus.publish(
            task_id,
            TaskEvent::Status {
                new: TaskStatus::ChangesRequested,
            },
        );
        Ok(())
    }

    /// The PR merged: finish the task and dispose of its worktree.
    pub async fn mark_pr_merged(self: &Arc<Self>, task_id: Uuid) -> Result<()> {
        let task = self.get_task(task_id).await?;
        if !task.status.is_pr_active() {
            return Err(SupervisorError::InvalidStatus {
                operation: "mark PR merged",
                status: task.status,
            });
        }
        self.set_status(task_id, TaskStatus::Done).await?;
        self.bus.publish(
            task_id,
            TaskEvent::Complete {
                pr_url: task.pr_url.clone(),
                summary: None,
            },
        );
        self.buffers.mark_terminal(task_id);
        if let Err(e) = self.worktrees.cleanup_worktree(task_id, true).await {
            warn!(task_id = %task_id, error = %e, "worktree cleanup after merge failed");
        }
        info!(task_id = %task_id, "task done, PR merged");
        Ok(())
    }

    /// The PR was closed without merging: cancel the task.
    pub async fn mark_pr_closed(self: &Arc<Self>, task_id: Uuid) -> Result<()> {
        let task = self.get_task(task_id).await?;
        let allowed = task.status.is_pr_active() || task.status == TaskStatus::Review;
        if !allowed {
            return Err(SupervisorError::InvalidStatus {
                operation: "mark PR closed",
                status: task.status,
            });
        }
        self.set_status(task_id, TaskStatus::Canceled).await?;
        self.bus.publish(
            task_id,
            TaskEvent::Error {
                msg: "PR was closed without merging".to_string(),
                code: Some(ErrorCode::Cancelled),
            },
        );
        self.buffers.mark_terminal(task_id);
        if let Err(e) = self.worktrees.cleanup_worktree(task_id, true).await {
            warn!(task_id = %task_id, error = %e, "worktree cleanup after close failed");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Feedback / cancellation / timeout
    // -----------------------------------------------------------------------

    /// Record a user message and forward it to the running agent's stdin.
    pub async fn send_feedback(&self, task_id: Uuid, msg: String) -> Result<()> {
        let agent = self
            .active
            .get(&task_id)
            .ok_or(SupervisorError::NotRunning(task_id))?;
        let chat = ChatMessage::new(ChatRole::User, msg.clone());
        self.buffers.push_chat(task_id, chat.clone());
        self.bus
            .publish(task_id, TaskEvent::ChatMessage { message: chat });
        agent.control.send_feedback(msg);
        Ok(())
    }

    /// Cancel a running agent: timers disarmed, process tree killed, and the
    /// terminal event emitted before this returns.
    pub async fn cancel_agent(self: &Arc<Self>, task_id: Uuid) -> Result<()> {
        let (_, agent) = self
            .active
            .remove(&task_id)
            .ok_or(SupervisorError::NotRunning(task_id))?;
        agent.disarm();
        self.registry.kill_task(task_id).await;
        agent.control.cancel();

        self.set_status(task_id, TaskStatus::Canceled).await?;
        self.store
            .update_task(
                task_id,
                TaskPatch {
                    error: Some(Some("canceled by user".to_string())),
                    ..Default::default()
                },
            )
            .await?;
        self.bus.publish(
            task_id,
            TaskEvent::Error {
                msg: "agent run canceled".to_string(),
                code: Some(ErrorCode::Cancelled),
            },
        );
        self.buffers.mark_terminal(task_id);
        info!(task_id = %task_id, "agent canceled");
        Ok(())
    }

    /// Rebase both timers to `now + extension` and clear the warning flag.
    pub fn extend_timeout(self: &Arc<Self>, task_id: Uuid) -> Result<DateTime<Utc>> {
        let mut agent = self
            .active
            .get_mut(&task_id)
            .ok_or(SupervisorError::NotRunning(task_id))?;
        agent.disarm();
        agent.warning_sent.store(false, Ordering::SeqCst);
        let (warning_timer, deadline_timer) = self.arm_timers(
            task_id,
            self.config.extension_ms,
            Arc::clone(&agent.warning_sent),
        );
        agent.warning_timer = warning_timer;
        agent.deadline_timer = deadline_timer;
        let expires_at = Utc::now() + chrono::Duration::milliseconds(self.config.extension_ms as i64);
        info!(task_id = %task_id, %expires_at, "timeout extended");
        Ok(expires_at)
    }

    /// Cancel every active agent and close all topics. Called at shutdown.
    pub async fn shutdown(self: &Arc<Self>) {
        let ids: Vec<Uuid> = self.active.iter().map(|e| *e.key()).collect();
        for task_id in ids {
            if let Err(e) = self.cancel_agent(task_id).await {
                warn!(task_id = %task_id, error = %e, "cancel during shutdown failed");
            }
        }
        self.bus.close_all();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(SupervisorError::TaskNotFound(task_id))
    }

    async fn git_credential_for(&self, url: &str) -> Option<GitCredential> {
        match forge_kind_for_url(url) {
            ForgeKind::GitHub => self.secrets.get(GITHUB_TOKEN).await.map(|token| GitCredential {
                username: "x-access-token".to_string(),
                token,
            }),
            ForgeKind::GitLab => self.secrets.get(GITLAB_TOKEN).await.map(|token| GitCredential {
                username: "oauth2".to_string(),
                token,
            }),
        }
    }

    /// Write a status transition and mirror it on the bus. Terminal statuses
    /// are sinks: a write against one is refused.
    async fn set_status(&self, task_id: Uuid, new: TaskStatus) -> Result<()> {
        let task = self.get_task(task_id).await?;
        if !task.status.can_transition_to(&new) {
            warn!(
                task_id = %task_id,
                from = %task.status,
                to = %new,
                "refusing transition out of terminal status"
            );
            return Ok(());
        }
        self.store
            .update_task(task_id, TaskPatch::status(new))
            .await?;
        self.bus.publish(task_id, TaskEvent::Status { new });
        Ok(())
    }

    fn arm_timers(
        self: &Arc<Self>,
        task_id: Uuid,
        timeout_ms: u64,
        warning_sent: Arc<AtomicBool>,
    ) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let warning_in = timeout_ms.saturating_sub(self.config.warning_threshold_ms);
        let expires_at = Utc::now() + chrono::Duration::milliseconds(timeout_ms as i64);

        let bus = self.bus.clone();
        let warning_flag = Arc::clone(&warning_sent);
        let warning_timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(warning_in)).await;
            if !warning_flag.swap(true, Ordering::SeqCst) {
                bus.publish(
                    task_id,
                    TaskEvent::TimeoutWarning {
                        msg: "the agent is approaching its time limit; extend it to keep \
                              the run alive"
                            .to_string(),
                        expires_at,
                    },
                );
            }
        });

        let supervisor = Arc::clone(self);
        let deadline_timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            supervisor.handle_timeout(task_id).await;
        });

        (warning_timer, deadline_timer)
    }

    async fn handle_timeout(self: &Arc<Self>, task_id: Uuid) {
        let Some((_, agent)) = self.active.remove(&task_id) else {
            return;
        };
        warn!(
            task_id = %task_id,
            started_at = %agent.started_at,
            "agent run deadline elapsed"
        );
        agent.warning_timer.abort();
        self.registry.kill_task(task_id).await;
        agent.control.cancel();

        if let Err(e) = self.set_status(task_id, TaskStatus::Failed).await {
            error!(task_id = %task_id, error = %e, "status write after timeout failed");
        }
        let _ = self
            .store
            .update_task(
                task_id,
                TaskPatch {
                    error: Some(Some("agent run timed out".to_string())),
                    ..Default::default()
                },
            )
            .await;
        self.bus.publish(
            task_id,
            TaskEvent::Error {
                msg: "agent run timed out".to_string(),
                code: Some(ErrorCode::Timeout),
            },
        );
        self.buffers.mark_terminal(task_id);
    }

    /// Demultiplex runner items onto the bus, buffers, and store, then apply
    /// the post-run bookkeeping once the channel closes.
    async fn pump(
        self: Arc<Self>,
        task_id: Uuid,
        items: flume::Receiver<RunnerItem>,
        outcome: tokio::task::JoinHandle<crate::runner::AgentRunResult>,
        context: RunContext,
    ) {
        let mut assistant_texts: Vec<String> = Vec::new();

        while let Ok(item) = items.recv_async().await {
            match item {
                RunnerItem::Log { level, msg, data } => {
                    let mut entry = AgentLogEntry::new(level, msg.clone());
                    if let Some(data) = data.clone() {
                        entry = entry.with_data(data);
                    }
                    self.buffers.push_log(task_id, entry.clone());
                    if let Err(e) = self.store.append_task_log(task_id, &entry).await {
                        warn!(task_id = %task_id, error = %e, "task log write failed");
                    }
                    self.bus
                        .publish(task_id, TaskEvent::Log { level, msg, data });
                }
                RunnerItem::Chat(message) => {
                    if message.role == ChatRole::Assistant {
                        assistant_texts.push(message.content.clone());
                    }
                    self.buffers.push_chat(task_id, message.clone());
                    self.bus
                        .publish(task_id, TaskEvent::ChatMessage { message });
                }
                RunnerItem::Tool(activity) => {
                    self.buffers.push_tool(task_id, activity.clone());
                    self.bus
                        .publish(task_id, TaskEvent::ToolActivity { activity });
                }
                RunnerItem::Status(new) => {
                    if let Err(e) = self.set_status(task_id, new).await {
                        warn!(task_id = %task_id, error = %e, "status write failed");
                    }
                }
            }
        }

        let result = match outcome.await {
            Ok(result) => result,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "runner task panicked");
                return;
            }
        };

        if let Some((_, agent)) = self.active.remove(&task_id) {
            agent.disarm();
        }

        if result.cancelled {
            // The cancel/timeout path already transitioned and emitted.
            return;
        }

        if result.success {
            self.finish_successful_run(task_id, &context, &assistant_texts, &result)
                .await;
        } else {
            if let Err(e) = self
                .store
                .update_task(
                    task_id,
                    TaskPatch {
                        error: Some(result.error.clone()),
                        ..Default::default()
                    },
                )
                .await
            {
                warn!(task_id = %task_id, error = %e, "error write failed");
            }
            self.bus.publish(
                task_id,
                TaskEvent::Error {
                    msg: result
                        .error
                        .clone()
                        .unwrap_or_else(|| "agent run failed".to_string()),
                    code: Some(ErrorCode::Failed),
                },
            );
            self.buffers.mark_terminal(task_id);
        }
    }

    async fn finish_successful_run(
        self: &Arc<Self>,
        task_id: Uuid,
        context: &RunContext,
        assistant_texts: &[String],
        result: &crate::runner::AgentRunResult,
    ) {
        let worktree = match self.worktrees.existing_worktree_path(task_id) {
            Ok(Some(path)) => Some(path),
            _ => None,
        };

        if let Some(path) = worktree.as_deref() {
            let task_title = self
                .store
                .get_task(task_id)
                .await
                .ok()
                .flatten()
                .map(|t| t.title)
                .unwrap_or_else(|| task_id.to_string());

            if let Err(e) = self
                .worktrees
                .commit_changes(path, &format!("Task: {task_title}"))
                .await
            {
                warn!(task_id = %task_id, error = %e, "commit after run failed");
            }

            // Snapshot the diff before anything can remove the worktree.
            match self.snapshot_changes(task_id, path, &context.target_branch).await {
                Ok(()) => {}
                Err(e) => warn!(task_id = %task_id, error = %e, "diff snapshot failed"),
            }

            if context.is_resume && !context.plan_only {
                if let Err(e) = self
                    .worktrees
                    .push_branch(path, &context.branch_name, context.credential.as_ref())
                    .await
                {
                    warn!(task_id = %task_id, error = %e, "auto-push after resume failed");
                    self.bus.publish(
                        task_id,
                        TaskEvent::Error {
                            msg: format!("push failed: {e}"),
                            code: None,
                        },
                    );
                }
            }
        }

        if context.plan_only {
            // The plan is the concatenated assistant output; the summary is
            // the fallback when the agent produced no chat text.
            let plan = if assistant_texts.is_empty() {
                result.summary.clone().unwrap_or_default()
            } else {
                assistant_texts.join("\n\n")
            };
            if let Err(e) = self
                .store
                .update_task(
                    task_id,
                    TaskPatch {
                        plan: Some(Some(plan)),
                        ..Default::default()
                    },
                )
                .await
            {
                warn!(task_id = %task_id, error = %e, "plan write failed");
            }
        } else {
            self.bus.publish(
                task_id,
                TaskEvent::AwaitingReview {
                    msg: result
                        .summary
                        .clone()
                        .unwrap_or_else(|| "agent run complete; review the changes".to_string()),
                },
            );
        }
    }

    /// Serialize `{files, diff}` into the task's `changes_data` column.
    async fn snapshot_changes(
        &self,
        task_id: Uuid,
        worktree: &std::path::Path,
        target_branch: &str,
    ) -> Result<()> {
        let files = self.worktrees.changed_files(worktree, target_branch).await?;
        let diff = self.worktrees.diff(worktree, target_branch).await?;
        let data = ChangesData {
            files,
            diff,
            captured_at: Utc::now(),
        };
        let serialized = serde_json::to_string(&data)
            .map_err(|e| TaskStoreError::Serde(e))?;
        self.store
            .update_task(
                task_id,
                TaskPatch {
                    changes_data: Some(Some(serialized)),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// The diff for a completed task: live worktree first, stored snapshot
    /// as the fallback once the worktree is gone.
    pub async fn task_changes(&self, task_id: Uuid) -> Result<Option<ChangesData>> {
        let task = self.get_task(task_id).await?;
        if let Ok(Some(path)) = self.worktrees.existing_worktree_path(task_id) {
            let files = self.worktrees.changed_files(&path, &task.target_branch).await;
            let diff = self.worktrees.diff(&path, &task.target_branch).await;
            if let (Ok(files), Ok(diff)) = (files, diff) {
                return Ok(Some(ChangesData {
                    files,
                    diff,
                    captured_at: Utc::now(),
                }));
            }
        }
        Ok(task
            .changes_data
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
