//! The CLI runner: spawns a coding-CLI child for a task, streams its
//! structured output, and relays everything through one outbound channel of
//! tagged items. The supervisor demultiplexes those items onto the event
//! bus and the store; the runner itself never touches either.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tp_core::types::{
    AgentKind, ChatMessage, LogLevel, Repository, Task, TaskStatus, ToolActivity,
};
use tp_session::cli_adapter::{adapter_for, CommandSpec};
use tp_session::process_registry::ProcessRegistry;

use crate::parser::{parser_for, truncate, ParsedEvent};
use crate::prompts::{build_prompt, PromptInputs};

/// Fallback summaries are capped at 2 KiB.
const SUMMARY_FALLBACK_CAP: usize = 2048;
/// How many trailing non-empty stdout lines feed the fallback summary.
const SUMMARY_TAIL_LINES: usize = 5;

// ---------------------------------------------------------------------------
// Options / items / result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub task: Task,
    pub repository: Option<Repository>,
    pub worktree_path: PathBuf,
    pub is_resume: bool,
    pub review_feedback: Option<String>,
    pub is_empty_repo: bool,
    pub plan_only: bool,
    pub approved_plan: Option<String>,
    /// Credential injected into the backend's environment variable, unless
    /// that variable is already set in the ambient environment.
    pub credential: Option<String>,
    pub silence_warning_ms: u64,
}

/// One tagged item on the runner's outbound channel.
#[derive(Debug, Clone)]
pub enum RunnerItem {
    Log {
        level: LogLevel,
        msg: String,
        data: Option<serde_json::Value>,
    },
    Status(TaskStatus),
    Chat(ChatMessage),
    Tool(ToolActivity),
}

/// Final outcome of a run, resolved after the outbound channel closes.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub success: bool,
    pub cancelled: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub summary: Option<String>,
}

// ---------------------------------------------------------------------------
// Control handle
// ---------------------------------------------------------------------------

/// Clonable handle for feedback injection and cancellation.
#[derive(Clone)]
pub struct AgentControl {
    feedback_tx: flume::Sender<String>,
    cancel_notify: Arc<Notify>,
    cancel_requested: Arc<AtomicBool>,
}

impl AgentControl {
    /// Queue a feedback message for the child's stdin. Returns `false` when
    /// the run is already finished.
    pub fn send_feedback(&self, msg: impl Into<String>) -> bool {
        self.feedback_tx.send(msg.into()).is_ok()
    }

    /// Request cancellation. The driver kills the process tree and resolves
    /// the run with a cancelled result.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_one();
    }
}

/// A run in flight: the item stream, its control handle, and the final
/// outcome (resolved after `items` closes).
pub struct RunningAgent {
    pub items: flume::Receiver<RunnerItem>,
    pub control: AgentControl,
    pub outcome: tokio::task::JoinHandle<AgentRunResult>,
}

// ---------------------------------------------------------------------------
// Spawner seam
// ---------------------------------------------------------------------------

/// Abstraction over the actual child spawn so tests can substitute a
/// scripted process.
pub trait AgentSpawner: Send + Sync {
    fn spawn(
        &self,
        task_id: Uuid,
        spec: &CommandSpec,
        workdir: &Path,
        env: &[(String, String)],
    ) -> std::io::Result<Child>;
}

/// Production spawner: builds the command from the adapter's spec and tracks
/// it in the process registry.
pub struct RegistrySpawner {
    registry: Arc<ProcessRegistry>,
}

impl RegistrySpawner {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self { registry }
    }
}

impl AgentSpawner for RegistrySpawner {
    fn spawn(
        &self,
        task_id: Uuid,
        spec: &CommandSpec,
        workdir: &Path,
        env: &[(String, String)],
    ) -> std::io::Result<Child> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(workdir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }
        self.registry.spawn(task_id, &mut cmd)
    }
}

/// Inject the credential only when the ambient environment does not already
/// carry the variable.
fn credential_env(var: &str, credential: Option<&str>) -> Vec<(String, String)> {
    match credential {
        Some(value) if std::env::var(var).is_err() => vec![(var.to_string(), value.to_string())],
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// AgentRunner
// ---------------------------------------------------------------------------

pub struct AgentRunner {
    spawner: Arc<dyn AgentSpawner>,
    registry: Arc<ProcessRegistry>,
}

impl AgentRunner {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self {
            spawner: Arc::new(RegistrySpawner::new(Arc::clone(&registry))),
            registry,
        }
    }

    /// Replace the spawner (testing).
    pub fn with_spawner(mut self, spawner: Arc<dyn AgentSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Start a run. Infallible: spawn failures surface as a failed result on
    /// the returned handle.
    pub fn spawn_run(&self, opts: RunnerOptions) -> RunningAgent {
        let (item_tx, item_rx) = flume::unbounded();
        let (feedback_tx, feedback_rx) = flume::unbounded();
        let cancel_notify = Arc::new(Notify::new());
        let cancel_requested = Arc::new(AtomicBool::new(false));

        let control = AgentControl {
            feedback_tx,
            cancel_notify: Arc::clone(&cancel_notify),
            cancel_requested: Arc::clone(&cancel_requested),
        };

        let driver = Driver {
            spawner: Arc::clone(&self.spawner),
            registry: Arc::clone(&self.registry),
            items: item_tx,
            feedback_rx,
            cancel_notify,
            cancel_requested,
        };
        let outcome = tokio::spawn(driver.run(opts));

        RunningAgent {
            items: item_rx,
            control,
            outcome,
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct Driver {
    spawner: Arc<dyn AgentSpawner>,
    registry: Arc<ProcessRegistry>,
    items: flume::Sender<RunnerItem>,
    feedback_rx: flume::Receiver<String>,
    cancel_notify: Arc<Notify>,
    cancel_requested: Arc<AtomicBool>,
}

impl Driver {
    fn emit(&self, item: RunnerItem) {
        let _ = self.items.send(item);
    }

    fn emit_log(&self, level: LogLevel, msg: impl Into<String>) {
        self.emit(RunnerItem::Log {
            level,
            msg: msg.into(),
            data: None,
        });
    }

    async fn run(self, opts: RunnerOptions) -> AgentRunResult {
        let task_id = opts.task.id;
        let kind: AgentKind = opts.task.agent_kind;

        // The agent starts in a planning state; an approved-plan run goes
        // straight to coding.
        if opts.approved_plan.is_some() {
            self.emit(RunnerItem::Status(TaskStatus::Coding));
        } else {
            self.emit(RunnerItem::Status(TaskStatus::Planning));
        }

        let inputs = PromptInputs {
            task: &opts.task,
            repository: opts.repository.as_ref(),
            is_resume: opts.is_resume,
            review_feedback: opts.review_feedback.as_deref(),
            is_empty_repo: opts.is_empty_repo,
            plan_only: opts.plan_only,
            approved_plan: opts.approved_plan.as_deref(),
        };
        let prompt = build_prompt(&inputs);
        let adapter = adapter_for(kind);
        let spec = adapter.command_spec(&prompt, opts.task.agent_model.as_deref());
        let env = credential_env(spec.credential_env_var, opts.credential.as_deref());

        info!(
            task_id = %task_id,
            agent = %kind,
            program = %spec.program,
            "starting agent run"
        );

        let mut child = match self
            .spawner
            .spawn(task_id, &spec, &opts.worktree_path, &env)
        {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("failed to spawn {}: {e}", spec.program);
                self.emit_log(LogLevel::Error, msg.clone());
                self.emit(RunnerItem::Status(TaskStatus::Failed));
                return AgentRunResult {
                    success: false,
                    cancelled: false,
                    exit_code: None,
                    error: Some(msg),
                    summary: None,
                };
            }
        };
        let pid = child.id();

        let mut stdin = child.stdin.take();
        if let (Some(stdin), Some(prompt_text)) = (stdin.as_mut(), spec.stdin_prompt.as_deref()) {
            if let Err(e) = stdin.write_all(format!("{prompt_text}\n").as_bytes()).await {
                warn!(task_id = %task_id, error = %e, "failed to write prompt to stdin");
            }
            let _ = stdin.flush().await;
        }

        let mut stdout_lines = child
            .stdout
            .take()
            .map(|s| BufReader::new(s).lines())
            .expect("child stdout is piped");
        let mut stderr_lines = child
            .stderr
            .take()
            .map(|s| BufReader::new(s).lines())
            .expect("child stderr is piped");

        let mut parser = parser_for(kind);
        let mut first_output = false;
        let mut silence_warned = false;
        let mut stderr_open = true;
        let mut feedback_open = true;
        let mut cancelled = false;
        let mut queued_feedback: Vec<String> = Vec::new();
        let mut result_text: Option<String> = None;
        let mut tail: VecDeque<String> = VecDeque::with_capacity(SUMMARY_TAIL_LINES);

        let silence = tokio::time::sleep(Duration::from_millis(opts.silence_warning_ms.max(1)));
        tokio::pin!(silence);

        loop {
            tokio::select! {
                _ = self.cancel_notify.notified() => {
                    info!(task_id = %task_id, "cancellation requested, killing process tree");
                    self.registry.kill_task(task_id).await;
                    cancelled = true;
                    break;
                }

                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if !first_output {
                                first_output = true;
                                self.emit(RunnerItem::Status(TaskStatus::InProgress));
                                // The child is reading now; flush queued feedback.
                                if let Some(stdin) = stdin.as_mut() {
                                    for msg in queued_feedback.drain(..) {
                                        let _ = stdin.write_all(format!("{msg}\n").as_bytes()).await;
                                    }
                                    let _ = stdin.flush().await;
                                }
                            }
                            if !line.trim().is_empty() {
                                if tail.len() == SUMMARY_TAIL_LINES {
                                    tail.pop_front();
                                }
                                tail.push_back(line.clone());
                            }
                            for event in parser.parse_line(&line) {
                                self.relay(event, &mut result_text);
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }

                line = stderr_lines.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => {
                            if !line.trim().is_empty() {
                                self.emit_log(LogLevel::Warn, truncate(line.trim(), 1000));
                            }
                        }
                        Ok(None) | Err(_) => stderr_open = false,
                    }
                }

                msg = self.feedback_rx.recv_async(), if feedback_open => {
                    match msg {
                        Ok(msg) => {
                            if first_output {
                                if let Some(stdin) = stdin.as_mut() {
                                    debug!(task_id = %task_id, "forwarding feedback to agent stdin");
                                    let _ = stdin.write_all(format!("{msg}\n").as_bytes()).await;
                                    let _ = stdin.flush().await;
                                }
                            } else {
                                // The child has not produced output yet, so it
                                // is probably not reading either. Queue until
                                // it wakes.
                                queued_feedback.push(msg);
                            }
                        }
                        Err(_) => feedback_open = false,
                    }
                }

                _ = &mut silence, if !first_output && !silence_warned => {
                    silence_warned = true;
                    self.emit_log(
                        LogLevel::Warn,
                        format!(
                            "no output from the agent after {} s — it may be \
                             authenticating, stuck, or waiting for input",
                            opts.silence_warning_ms / 1000
                        ),
                    );
                }
            }
        }

        // Catch trailing stderr (auth failures often land there just before
        // a non-zero exit).
        while let Ok(Ok(Some(line))) = tokio::time::timeout(
            Duration::from_millis(200),
            stderr_lines.next_line(),
        )
        .await
        {
            if !line.trim().is_empty() {
                self.emit_log(LogLevel::Warn, truncate(line.trim(), 1000));
            }
        }

        let exit = child.wait().await;
        if let Some(pid) = pid {
            self.registry.untrack(task_id, pid);
        }

        if cancelled || self.cancel_requested.load(Ordering::SeqCst) {
            info!(task_id = %task_id, "agent run cancelled");
            return AgentRunResult {
                success: false,
                cancelled: true,
                exit_code: exit.ok().and_then(|s| s.code()),
                error: None,
                summary: None,
            };
        }

        match exit {
            Ok(status) if status.success() => {
                let summary = extract_summary(result_text, &tail);
                let final_status = if opts.plan_only {
                    TaskStatus::PlanReview
                } else {
                    TaskStatus::AwaitingReview
                };
                self.emit(RunnerItem::Status(final_status));
                info!(task_id = %task_id, "agent run completed");
                AgentRunResult {
                    success: true,
                    cancelled: false,
                    exit_code: Some(0),
                    error: None,
                    summary,
                }
            }
            Ok(status) => {
                let code = status.code();
                let msg = match code {
                    Some(code) => format!("agent exited with code {code}"),
                    None => "agent terminated by signal".to_string(),
                };
                self.emit_log(LogLevel::Error, msg.clone());
                self.emit(RunnerItem::Status(TaskStatus::Failed));
                AgentRunResult {
                    success: false,
                    cancelled: false,
                    exit_code: code,
                    error: Some(msg),
                    summary: None,
                }
            }
            Err(e) => {
                let msg = format!("failed to reap agent process: {e}");
                self.emit_log(LogLevel::Error, msg.clone());
                self.emit(RunnerItem::Status(TaskStatus::Failed));
                AgentRunResult {
                    success: false,
                    cancelled: false,
                    exit_code: None,
                    error: Some(msg),
                    summary: None,
                }
            }
        }
    }

    /// Map a parsed event onto the outbound channel.
    fn relay(&self, event: ParsedEvent, result_text: &mut Option<String>) {
        match event {
            ParsedEvent::Log {
                level,
                message,
                data,
            } => self.emit(RunnerItem::Log {
                level,
                msg: message,
                data,
            }),
            ParsedEvent::Chat { role, text } => {
                self.emit(RunnerItem::Chat(ChatMessage::new(role, text)));
            }
            ParsedEvent::Tool {
                name,
                summary,
                status,
            } => {
                self.emit(RunnerItem::Tool(ToolActivity::new(name, summary, status)));
            }
            ParsedEvent::Result { text } => {
                if !text.is_empty() {
                    *result_text = Some(text);
                }
            }
        }
    }
}

/// Prefer the backend's structured result; fall back to the last few
/// non-empty stdout lines.
fn extract_summary(result_text: Option<String>, tail: &VecDeque<String>) -> Option<String> {
    if let Some(text) = result_text {
        return Some(truncate(&text, SUMMARY_FALLBACK_CAP));
    }
    if tail.is_empty() {
        return None;
    }
    let joined = tail.iter().cloned().collect::<Vec<_>>().join("\n");
    Some(truncate(&joined, SUMMARY_FALLBACK_CAP))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Spawner that runs a shell script in place of the real CLI binary, so
    /// the whole stream/feedback/cancel path is exercised against a live
    /// child process.
    struct ScriptSpawner {
        script: String,
        registry: Arc<ProcessRegistry>,
    }

    impl ScriptSpawner {
        fn new(script: &str, registry: Arc<ProcessRegistry>) -> Self {
            Self {
                script: script.to_string(),
                registry,
            }
        }
    }

    impl AgentSpawner for ScriptSpawner {
        fn spawn(
            &self,
            task_id: Uuid,
            _spec: &CommandSpec,
            workdir: &Path,
            _env: &[(String, String)],
        ) -> std::io::Result<Child> {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c")
                .arg(&self.script)
                .current_dir(workdir)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true);
            self.registry.spawn(task_id, &mut cmd)
        }
    }

    /// Spawner that always fails, for the spawn-error path.
    struct FailSpawner;

    impl AgentSpawner for FailSpawner {
        fn spawn(
            &self,
            _task_id: Uuid,
            _spec: &CommandSpec,
            _workdir: &Path,
            _env: &[(String, String)],
        ) -> std::io::Result<Child> {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such binary",
            ))
        }
    }

    fn make_opts(workdir: &Path) -> RunnerOptions {
        RunnerOptions {
            task: Task::new(
                "Test run",
                "https://github.com/o/r",
                "main",
                AgentKind::ClaudeCode,
            ),
            repository: None,
            worktree_path: workdir.to_path_buf(),
            is_resume: false,
            review_feedback: None,
            is_empty_repo: false,
            plan_only: false,
            approved_plan: None,
            credential: None,
            silence_warning_ms: 30_000,
        }
    }

    fn runner_with_script(script: &str) -> AgentRunner {
        let registry = Arc::new(ProcessRegistry::new());
        AgentRunner::new(Arc::clone(&registry))
            .with_spawner(Arc::new(ScriptSpawner::new(script, registry)))
    }

    fn drain_items(rx: &flume::Receiver<RunnerItem>) -> Vec<RunnerItem> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn statuses(items: &[RunnerItem]) -> Vec<TaskStatus> {
        items
            .iter()
            .filter_map(|i| match i {
                RunnerItem::Status(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn happy_path_emits_lifecycle_statuses() {
        let tmp = tempfile::tempdir().unwrap();
        let script = r#"
            echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Working on it."}]}}'
            echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"write_file","input":{"path":"src/api.rs"}}]}}'
            echo '{"type":"result","subtype":"success","result":"All done."}'
        "#;
        let runner = runner_with_script(script);
        let running = runner.spawn_run(make_opts(tmp.path()));

        let result = running.outcome.await.unwrap();
        assert!(result.success);
        assert!(!result.cancelled);
        assert_eq!(result.summary.as_deref(), Some("All done."));

        let items = drain_items(&running.items);
        assert_eq!(
            statuses(&items),
            vec![
                TaskStatus::Planning,
                TaskStatus::InProgress,
                TaskStatus::AwaitingReview
            ]
        );
        assert!(items.iter().any(|i| matches!(i, RunnerItem::Chat(_))));
        assert!(items.iter().any(|i| matches!(i, RunnerItem::Tool(_))));
    }

    #[tokio::test]
    async fn plan_only_run_lands_in_plan_review() {
        let tmp = tempfile::tempdir().unwrap();
        let script = r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"1. add module"}]}}'"#;
        let runner = runner_with_script(script);
        let mut opts = make_opts(tmp.path());
        opts.plan_only = true;
        let running = runner.spawn_run(opts);

        let result = running.outcome.await.unwrap();
        assert!(result.success);
        let items = drain_items(&running.items);
        assert_eq!(*statuses(&items).last().unwrap(), TaskStatus::PlanReview);
    }

    #[tokio::test]
    async fn approved_plan_run_starts_in_coding() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with_script("echo done");
        let mut opts = make_opts(tmp.path());
        opts.approved_plan = Some("1. do it".into());
        let running = runner.spawn_run(opts);

        running.outcome.await.unwrap();
        let items = drain_items(&running.items);
        assert_eq!(statuses(&items)[0], TaskStatus::Coding);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with_script("echo starting; exit 3");
        let running = runner.spawn_run(make_opts(tmp.path()));

        let result = running.outcome.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.error.as_deref().unwrap().contains("code 3"));

        let items = drain_items(&running.items);
        assert_eq!(*statuses(&items).last().unwrap(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn spawn_error_fails_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(ProcessRegistry::new());
        let runner = AgentRunner::new(registry).with_spawner(Arc::new(FailSpawner));
        let running = runner.spawn_run(make_opts(tmp.path()));

        let result = running.outcome.await.unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("no such binary"));

        let items = drain_items(&running.items);
        assert_eq!(*statuses(&items).last().unwrap(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_terminates_within_bounded_time() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with_script("echo started; sleep 30");
        let running = runner.spawn_run(make_opts(tmp.path()));

        // Let it produce first output, then cancel.
        tokio::time::sleep(Duration::from_millis(200)).await;
        running.control.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), running.outcome)
            .await
            .expect("cancel did not resolve in time")
            .unwrap();
        assert!(result.cancelled);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn silence_warning_fires_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with_script("sleep 0.4; echo one; echo two");
        let mut opts = make_opts(tmp.path());
        opts.silence_warning_ms = 50;
        let running = runner.spawn_run(opts);

        running.outcome.await.unwrap();
        let items = drain_items(&running.items);
        let warnings: Vec<_> = items
            .iter()
            .filter(|i| matches!(i, RunnerItem::Log { msg, .. } if msg.contains("no output")))
            .collect();
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn feedback_reaches_child_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        // The child announces itself, then echoes whatever feedback arrives.
        let runner = runner_with_script(r#"echo ready; read fb; echo "fb:$fb""#);
        let running = runner.spawn_run(make_opts(tmp.path()));

        assert!(running.control.send_feedback("keep going"));

        let result = running.outcome.await.unwrap();
        assert!(result.success);
        let items = drain_items(&running.items);
        let echoed = items.iter().any(|i| match i {
            RunnerItem::Log { msg, .. } => msg.contains("fb:keep going"),
            RunnerItem::Chat(m) => m.content.contains("fb:keep going"),
            _ => false,
        });
        assert!(echoed, "feedback was not echoed back: {items:?}");
    }

    #[tokio::test]
    async fn summary_falls_back_to_trailing_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with_script("echo l1; echo l2; echo l3; echo l4; echo l5; echo l6");
        let running = runner.spawn_run(make_opts(tmp.path()));

        let result = running.outcome.await.unwrap();
        let summary = result.summary.unwrap();
        assert!(!summary.contains("l1"), "only the last lines survive");
        assert!(summary.contains("l2") && summary.contains("l6"));
    }

    #[tokio::test]
    async fn stderr_lines_surface_as_warnings() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with_script("echo out; echo 'token expired' 1>&2");
        let running = runner.spawn_run(make_opts(tmp.path()));

        running.outcome.await.unwrap();
        let items = drain_items(&running.items);
        assert!(items.iter().any(|i| matches!(
            i,
            RunnerItem::Log { level: LogLevel::Warn, msg, .. } if msg.contains("token expired")
        )));
    }

    #[test]
    fn credential_env_respects_ambient() {
        let pairs = credential_env("TP_TEST_SURELY_UNSET_VAR", Some("secret"));
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1, "secret");

        std::env::set_var("TP_TEST_AMBIENT_VAR", "already-there");
        let pairs = credential_env("TP_TEST_AMBIENT_VAR", Some("secret"));
        assert!(pairs.is_empty());
        std::env::remove_var("TP_TEST_AMBIENT_VAR");

        assert!(credential_env("ANY", None).is_empty());
    }
}
