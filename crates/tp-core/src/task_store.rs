//! Durable task / repository store backed by SQLite.
//!
//! The store is the single source of truth for task records and their
//! `status` column. Everything else observes status transitions through bus
//! events emitted by the supervisor, never by polling this store.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::{
    AgentKind, AgentLogEntry, LearnedPattern, LogLevel, Repository, Task, TaskStatus,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TaskStoreError>;

// ---------------------------------------------------------------------------
// helpers — enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn json_to_sql<T: serde::Serialize>(val: &T) -> String {
    serde_json::to_string(val).expect("serialize json column")
}

fn json_from_sql<T: serde::de::DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Column whitelists — the only columns export/import will touch
// ---------------------------------------------------------------------------

pub const TASK_COLUMNS: &[&str] = &[
    "id",
    "repository_id",
    "repo_url",
    "target_branch",
    "title",
    "description",
    "context_files",
    "build_command",
    "agent_kind",
    "agent_model",
    "generated_spec",
    "final_spec",
    "spec_approved_at",
    "was_spec_edited",
    "branch_name",
    "pr_url",
    "pr_number",
    "changes_data",
    "conflict_files",
    "plan",
    "pending_feedback",
    "error",
    "status",
    "created_at",
    "updated_at",
];

pub const TASK_LOG_COLUMNS: &[&str] = &["task_id", "ts", "level", "message", "data"];

pub const REPOSITORY_COLUMNS: &[&str] = &[
    "id",
    "url",
    "name",
    "default_branch",
    "detected_stack",
    "conventions",
    "learned_patterns",
    "created_at",
    "updated_at",
];

// ---------------------------------------------------------------------------
// TaskPatch
// ---------------------------------------------------------------------------

/// Partial update applied by [`TaskStore::update_task`].
///
/// `None` leaves the column untouched; for nullable columns the inner
/// `Option` distinguishes "set to NULL" from "no change".
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub repository_id: Option<Option<Uuid>>,
    pub agent_model: Option<Option<String>>,
    pub generated_spec: Option<Option<String>>,
    pub final_spec: Option<Option<String>>,
    pub spec_approved_at: Option<Option<DateTime<Utc>>>,
    pub was_spec_edited: Option<bool>,
    pub pr_url: Option<Option<String>>,
    pub pr_number: Option<Option<u64>>,
    pub changes_data: Option<Option<String>>,
    pub conflict_files: Option<Vec<String>>,
    pub plan: Option<Option<String>>,
    pub pending_feedback: Option<Option<String>>,
    pub error: Option<Option<String>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    fn apply(self, task: &mut Task) {
        if let Some(v) = self.status {
            task.status = v;
        }
        if let Some(v) = self.title {
            task.title = v;
        }
        if let Some(v) = self.description {
            task.description = v;
        }
        if let Some(v) = self.repository_id {
            task.repository_id = v;
        }
        if let Some(v) = self.agent_model {
            task.agent_model = v;
        }
        if let Some(v) = self.generated_spec {
            task.generated_spec = v;
        }
        if let Some(v) = self.final_spec {
            task.final_spec = v;
        }
        if let Some(v) = self.spec_approved_at {
            task.spec_approved_at = v;
        }
        if let Some(v) = self.was_spec_edited {
            task.was_spec_edited = v;
        }
        if let Some(v) = self.pr_url {
            task.pr_url = v;
        }
        if let Some(v) = self.pr_number {
            task.pr_number = v;
        }
        if let Some(v) = self.changes_data {
            task.changes_data = v;
        }
        if let Some(v) = self.conflict_files {
            task.conflict_files = v;
        }
        if let Some(v) = self.plan {
            task.plan = v;
        }
        if let Some(v) = self.pending_feedback {
            task.pending_feedback = v;
        }
        if let Some(v) = self.error {
            task.error = v;
        }
        task.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Export payload
// ---------------------------------------------------------------------------

/// Bulk export of the store, restricted to the column whitelists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreExport {
    pub tasks: Vec<serde_json::Map<String, serde_json::Value>>,
    pub task_logs: Vec<serde_json::Map<String, serde_json::Value>>,
    pub repositories: Vec<serde_json::Map<String, serde_json::Value>>,
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Async SQLite-backed store for tasks, task logs, and repositories.
pub struct TaskStore {
    conn: Connection,
}

impl TaskStore {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS tasks (
                        id               TEXT PRIMARY KEY,
                        repository_id    TEXT,
                        repo_url         TEXT NOT NULL,
                        target_branch    TEXT NOT NULL,
                        title            TEXT NOT NULL,
                        description      TEXT,
                        context_files    TEXT NOT NULL DEFAULT '[]',
                        build_command    TEXT,
                        agent_kind       TEXT NOT NULL,
                        agent_model      TEXT,
                        generated_spec   TEXT,
                        final_spec       TEXT,
                        spec_approved_at TEXT,
                        was_spec_edited  INTEGER NOT NULL DEFAULT 0,
                        branch_name      TEXT NOT NULL,
                        pr_url           TEXT,
                        pr_number        INTEGER,
                        changes_data     TEXT,
                        conflict_files   TEXT NOT NULL DEFAULT '[]',
                        plan             TEXT,
                        pending_feedback TEXT,
                        error            TEXT,
                        status           TEXT NOT NULL CHECK (status IN (
                            'draft','backlog','refining','pending_approval',
                            'planning','plan_review','approved','coding',
                            'in_progress','awaiting_review','review',
                            'changes_requested','merge_conflicts','pr_created',
                            'done','failed','canceled')),
                        created_at       TEXT NOT NULL,
                        updated_at       TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_status   ON tasks(status);
                    CREATE INDEX IF NOT EXISTS idx_tasks_repo_url ON tasks(repo_url);

                    CREATE TABLE IF NOT EXISTS task_logs (
                        id      INTEGER PRIMARY KEY AUTOINCREMENT,
                        task_id TEXT NOT NULL,
                        ts      TEXT NOT NULL,
                        level   TEXT NOT NULL,
                        message TEXT NOT NULL,
                        data    TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id);

                    CREATE TABLE IF NOT EXISTS repositories (
                        id               TEXT PRIMARY KEY,
                        url              TEXT NOT NULL UNIQUE,
                        name             TEXT NOT NULL,
                        default_branch   TEXT NOT NULL,
                        detected_stack   TEXT,
                        conventions      TEXT,
                        learned_patterns TEXT NOT NULL DEFAULT '[]',
                        created_at       TEXT NOT NULL,
                        updated_at       TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn create_task(&self, task: &Task) -> Result<()> {
        let task = task.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (
                        id, repository_id, repo_url, target_branch, title,
                        description, context_files, build_command, agent_kind,
                        agent_model, generated_spec, final_spec, spec_approved_at,
                        was_spec_edited, branch_name, pr_url, pr_number,
                        changes_data, conflict_files, plan, pending_feedback,
                        error, status, created_at, updated_at
                    ) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                        ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25
                    )",
                    params![
                        task.id.to_string(),
                        task.repository_id.map(|id| id.to_string()),
                        task.repo_url,
                        task.target_branch,
                        task.title,
                        task.description,
                        json_to_sql(&task.context_files),
                        task.build_command,
                        enum_to_sql(&task.agent_kind),
                        task.agent_model,
                        task.generated_spec,
                        task.final_spec,
                        task.spec_approved_at.map(|t| t.to_rfc3339()),
                        task.was_spec_edited,
                        task.branch_name,
                        task.pr_url,
                        task.pr_number,
                        task.changes_data,
                        json_to_sql(&task.conflict_files),
                        task.plan,
                        task.pending_feedback,
                        task.error,
                        enum_to_sql(&task.status),
                        task.created_at.to_rfc3339(),
                        task.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;
                let tasks = stmt
                    .query_map(params![id.to_string()], task_from_row)?
                    .collect::<rusqlite::Result<Vec<Task>>>()?;
                Ok(tasks)
            })
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Apply a patch to a task and return the merged record.
    pub async fn update_task(&self, id: Uuid, patch: TaskPatch) -> Result<Task> {
        let task = self
            .get_task(id)
            .await?
            .ok_or(TaskStoreError::TaskNotFound(id))?;
        let mut merged = task;
        patch.apply(&mut merged);
        let write = merged.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET
                        repository_id = ?2, title = ?3, description = ?4,
                        agent_model = ?5, generated_spec = ?6, final_spec = ?7,
                        spec_approved_at = ?8, was_spec_edited = ?9, pr_url = ?10,
                        pr_number = ?11, changes_data = ?12, conflict_files = ?13,
                        plan = ?14, pending_feedback = ?15, error = ?16,
                        status = ?17, updated_at = ?18
                     WHERE id = ?1",
                    params![
                        write.id.to_string(),
                        write.repository_id.map(|id| id.to_string()),
                        write.title,
                        write.description,
                        write.agent_model,
                        write.generated_spec,
                        write.final_spec,
                        write.spec_approved_at.map(|t| t.to_rfc3339()),
                        write.was_spec_edited,
                        write.pr_url,
                        write.pr_number,
                        write.changes_data,
                        json_to_sql(&write.conflict_files),
                        write.plan,
                        write.pending_feedback,
                        write.error,
                        enum_to_sql(&write.status),
                        write.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(merged)
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let tasks = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at")?;
                let tasks = stmt
                    .query_map([], task_from_row)?
                    .collect::<rusqlite::Result<Vec<Task>>>()?;
                Ok(tasks)
            })
            .await?;
        Ok(tasks)
    }

    pub async fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.tasks_in_statuses(&[status]).await
    }

    pub async fn tasks_in_statuses(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let wanted: Vec<String> = statuses.iter().map(enum_to_sql).collect();
        let tasks = self
            .conn
            .call(move |conn| {
                let placeholders = wanted
                    .iter()
                    .enumerate()
                    .map(|(i, _)| format!("?{}", i + 1))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "SELECT * FROM tasks WHERE status IN ({placeholders}) ORDER BY created_at"
                );
                let mut stmt = conn.prepare(&sql)?;
                let tasks = stmt
                    .query_map(rusqlite::params_from_iter(wanted.iter()), task_from_row)?
                    .collect::<rusqlite::Result<Vec<Task>>>()?;
                Ok(tasks)
            })
            .await?;
        Ok(tasks)
    }

    pub async fn tasks_by_repository(&self, repo_url: &str) -> Result<Vec<Task>> {
        let url = repo_url.to_string();
        let tasks = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT * FROM tasks WHERE repo_url = ?1 ORDER BY created_at")?;
                let tasks = stmt
                    .query_map(params![url], task_from_row)?
                    .collect::<rusqlite::Result<Vec<Task>>>()?;
                Ok(tasks)
            })
            .await?;
        Ok(tasks)
    }

    // -----------------------------------------------------------------------
    // Task logs
    // -----------------------------------------------------------------------

    pub async fn append_task_log(&self, task_id: Uuid, entry: &AgentLogEntry) -> Result<()> {
        let entry = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO task_logs (task_id, ts, level, message, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        task_id.to_string(),
                        entry.ts.to_rfc3339(),
                        enum_to_sql(&entry.level),
                        entry.message,
                        entry.data.map(|d| d.to_string()),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn task_logs(&self, task_id: Uuid) -> Result<Vec<AgentLogEntry>> {
        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT ts, level, message, data FROM task_logs
                     WHERE task_id = ?1 ORDER BY id",
                )?;
                let entries = stmt
                    .query_map(params![task_id.to_string()], |row| {
                        let ts: String = row.get(0)?;
                        let level: String = row.get(1)?;
                        let data: Option<String> = row.get(3)?;
                        Ok(AgentLogEntry {
                            ts: parse_ts(&ts),
                            level: enum_from_sql::<LogLevel>(&level),
                            message: row.get(2)?,
                            data: data.and_then(|d| serde_json::from_str(&d).ok()),
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<AgentLogEntry>>>()?;
                Ok(entries)
            })
            .await?;
        Ok(entries)
    }

    // -----------------------------------------------------------------------
    // Repositories
    // -----------------------------------------------------------------------

    pub async fn upsert_repository(&self, repo: &Repository) -> Result<()> {
        let repo = repo.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO repositories (
                        id, url, name, default_branch, detected_stack,
                        conventions, learned_patterns, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    ON CONFLICT(url) DO UPDATE SET
                        name = excluded.name,
                        default_branch = excluded.default_branch,
                        detected_stack = excluded.detected_stack,
                        conventions = excluded.conventions,
                        learned_patterns = excluded.learned_patterns,
                        updated_at = excluded.updated_at",
                    params![
                        repo.id.to_string(),
                        repo.url,
                        repo.name,
                        repo.default_branch,
                        repo.detected_stack.map(|v| v.to_string()),
                        repo.conventions,
                        json_to_sql(&repo.learned_patterns),
                        repo.created_at.to_rfc3339(),
                        repo.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn repository_by_url(&self, url: &str) -> Result<Option<Repository>> {
        let url = url.to_string();
        let repos = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM repositories WHERE url = ?1")?;
                let repos = stmt
                    .query_map(params![url], repository_from_row)?
                    .collect::<rusqlite::Result<Vec<Repository>>>()?;
                Ok(repos)
            })
            .await?;
        Ok(repos.into_iter().next())
    }

    /// Count of tasks for a repository that are not in a terminal status.
    pub async fn active_task_count(&self, repo_url: &str) -> Result<u64> {
        let url = repo_url.to_string();
        let count = self
            .conn
            .call(move |conn| {
                let count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM tasks
                     WHERE repo_url = ?1
                       AND status NOT IN ('done', 'failed', 'canceled')",
                    params![url],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Export / import
    // -----------------------------------------------------------------------

    /// Dump tasks, task logs, and repositories as whitelisted column maps.
    pub async fn export(&self) -> Result<StoreExport> {
        let export = self
            .conn
            .call(|conn| {
                let tasks = export_table(conn, "tasks", TASK_COLUMNS)?;
                let task_logs = export_table(conn, "task_logs", TASK_LOG_COLUMNS)?;
                let repositories = export_table(conn, "repositories", REPOSITORY_COLUMNS)?;
                Ok(StoreExport {
                    tasks,
                    task_logs,
                    repositories,
                })
            })
            .await?;
        Ok(export)
    }

    /// Import rows previously produced by [`export`]. Keys outside the
    /// column whitelist are ignored, never interpolated into SQL.
    pub async fn import(&self, export: StoreExport) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                import_table(&tx, "tasks", TASK_COLUMNS, &export.tasks)?;
                import_table(&tx, "task_logs", TASK_LOG_COLUMNS, &export.task_logs)?;
                import_table(&tx, "repositories", REPOSITORY_COLUMNS, &export.repositories)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_uuid(raw: &str) -> Uuid {
    Uuid::parse_str(raw).unwrap_or_default()
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get("id")?;
    let repository_id: Option<String> = row.get("repository_id")?;
    let context_files: Option<String> = row.get("context_files")?;
    let conflict_files: Option<String> = row.get("conflict_files")?;
    let agent_kind: String = row.get("agent_kind")?;
    let status: String = row.get("status")?;
    let spec_approved_at: Option<String> = row.get("spec_approved_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Task {
        id: parse_uuid(&id),
        repository_id: repository_id.map(|s| parse_uuid(&s)),
        repo_url: row.get("repo_url")?,
        target_branch: row.get("target_branch")?,
        title: row.get("title")?,
        description: row.get("description")?,
        context_files: json_from_sql(context_files),
        build_command: row.get("build_command")?,
        agent_kind: enum_from_sql::<AgentKind>(&agent_kind),
        agent_model: row.get("agent_model")?,
        generated_spec: row.get("generated_spec")?,
        final_spec: row.get("final_spec")?,
        spec_approved_at: spec_approved_at.map(|s| parse_ts(&s)),
        was_spec_edited: row.get("was_spec_edited")?,
        branch_name: row.get("branch_name")?,
        pr_url: row.get("pr_url")?,
        pr_number: row.get("pr_number")?,
        changes_data: row.get("changes_data")?,
        conflict_files: json_from_sql(conflict_files),
        plan: row.get("plan")?,
        pending_feedback: row.get("pending_feedback")?,
        error: row.get("error")?,
        status: enum_from_sql::<TaskStatus>(&status),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn repository_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
    let id: String = row.get("id")?;
    let detected_stack: Option<String> = row.get("detected_stack")?;
    let learned_patterns: Option<String> = row.get("learned_patterns")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Repository {
        id: parse_uuid(&id),
        url: row.get("url")?,
        name: row.get("name")?,
        default_branch: row.get("default_branch")?,
        detected_stack: detected_stack.and_then(|s| serde_json::from_str(&s).ok()),
        conventions: row.get("conventions")?,
        learned_patterns: json_from_sql::<Vec<LearnedPattern>>(learned_patterns),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

// ---------------------------------------------------------------------------
// Export / import helpers
// ---------------------------------------------------------------------------

fn sql_value_to_json(value: rusqlite::types::ValueRef<'_>) -> serde_json::Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => serde_json::Value::from(
            b.iter().map(|byte| format!("{byte:02x}")).collect::<String>(),
        ),
    }
}

fn export_table(
    conn: &rusqlite::Connection,
    table: &str,
    columns: &[&str],
) -> rusqlite::Result<Vec<serde_json::Map<String, serde_json::Value>>> {
    let sql = format!("SELECT {} FROM {table}", columns.join(", "));
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = serde_json::Map::new();
        for (i, col) in columns.iter().enumerate() {
            map.insert(col.to_string(), sql_value_to_json(row.get_ref(i)?));
        }
        out.push(map);
    }
    Ok(out)
}

fn json_value_to_sql(value: &serde_json::Value) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

fn import_table(
    conn: &rusqlite::Connection,
    table: &str,
    columns: &[&str],
    rows: &[serde_json::Map<String, serde_json::Value>],
) -> rusqlite::Result<()> {
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT OR REPLACE INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    for row in rows {
        let values: Vec<rusqlite::types::Value> = columns
            .iter()
            .map(|col| {
                row.get(*col)
                    .map(json_value_to_sql)
                    .unwrap_or(rusqlite::types::Value::Null)
            })
            .collect();
        stmt.execute(rusqlite::params_from_iter(values))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task() -> Task {
        Task::new(
            "Implement widget",
            "https://github.com/o/r",
            "main",
            AgentKind::ClaudeCode,
        )
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let store = TaskStore::new_in_memory().await.unwrap();
        let task = make_task();
        store.create_task(&task).await.unwrap();

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.title, "Implement widget");
        assert_eq!(loaded.status, TaskStatus::Draft);
        assert_eq!(loaded.branch_name, task.branch_name);
    }

    #[tokio::test]
    async fn update_merges_and_bumps_updated_at() {
        let store = TaskStore::new_in_memory().await.unwrap();
        let task = make_task();
        store.create_task(&task).await.unwrap();

        let merged = store
            .update_task(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::Coding),
                    pr_number: Some(Some(42)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(merged.status, TaskStatus::Coding);
        assert_eq!(merged.pr_number, Some(42));
        assert!(merged.updated_at >= task.updated_at);

        // Untouched columns survive.
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, task.title);
        assert_eq!(loaded.repo_url, task.repo_url);
    }

    #[tokio::test]
    async fn update_unknown_task_is_not_found() {
        let store = TaskStore::new_in_memory().await.unwrap();
        let err = store
            .update_task(Uuid::new_v4(), TaskPatch::status(TaskStatus::Coding))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskStoreError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn query_by_status_and_repository() {
        let store = TaskStore::new_in_memory().await.unwrap();
        let mut a = make_task();
        a.status = TaskStatus::PrCreated;
        let mut b = make_task();
        b.repo_url = "https://gitlab.com/g/p".into();
        b.status = TaskStatus::ChangesRequested;
        store.create_task(&a).await.unwrap();
        store.create_task(&b).await.unwrap();

        let pr_active = store
            .tasks_in_statuses(&[TaskStatus::PrCreated, TaskStatus::ChangesRequested])
            .await
            .unwrap();
        assert_eq!(pr_active.len(), 2);

        let by_repo = store
            .tasks_by_repository("https://gitlab.com/g/p")
            .await
            .unwrap();
        assert_eq!(by_repo.len(), 1);
        assert_eq!(by_repo[0].id, b.id);
    }

    #[tokio::test]
    async fn task_logs_round_trip() {
        let store = TaskStore::new_in_memory().await.unwrap();
        let task = make_task();
        store.create_task(&task).await.unwrap();

        let entry = AgentLogEntry::new(LogLevel::Warn, "slow output")
            .with_data(serde_json::json!({"elapsed_ms": 30000}));
        store.append_task_log(task.id, &entry).await.unwrap();

        let logs = store.task_logs(task.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Warn);
        assert_eq!(logs[0].message, "slow output");
        assert_eq!(logs[0].data.as_ref().unwrap()["elapsed_ms"], 30000);
    }

    #[tokio::test]
    async fn repository_upsert_and_active_count() {
        let store = TaskStore::new_in_memory().await.unwrap();
        let repo = Repository::new("https://github.com/o/r", "r");
        store.upsert_repository(&repo).await.unwrap();

        let mut again = repo.clone();
        again.default_branch = "develop".into();
        store.upsert_repository(&again).await.unwrap();

        let loaded = store
            .repository_by_url("https://github.com/o/r")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.default_branch, "develop");

        let mut live = make_task();
        live.status = TaskStatus::Coding;
        let mut finished = make_task();
        finished.status = TaskStatus::Done;
        store.create_task(&live).await.unwrap();
        store.create_task(&finished).await.unwrap();

        let count = store
            .active_task_count("https://github.com/o/r")
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn export_import_round_trip() {
        let source = TaskStore::new_in_memory().await.unwrap();
        let task = make_task();
        source.create_task(&task).await.unwrap();
        source
            .append_task_log(task.id, &AgentLogEntry::new(LogLevel::Info, "hello"))
            .await
            .unwrap();
        source
            .upsert_repository(&Repository::new("https://github.com/o/r", "r"))
            .await
            .unwrap();

        let export = source.export().await.unwrap();
        assert_eq!(export.tasks.len(), 1);
        assert_eq!(export.task_logs.len(), 1);
        assert_eq!(export.repositories.len(), 1);

        let target = TaskStore::new_in_memory().await.unwrap();
        target.import(export.clone()).await.unwrap();

        let back = target.export().await.unwrap();
        assert_eq!(back.tasks, export.tasks);
        assert_eq!(back.repositories, export.repositories);

        let loaded = target.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, task.title);
        assert_eq!(loaded.status, task.status);
    }

    #[tokio::test]
    async fn import_ignores_unexpected_columns() {
        let source = TaskStore::new_in_memory().await.unwrap();
        let task = make_task();
        source.create_task(&task).await.unwrap();
        let mut export = source.export().await.unwrap();

        // Inject a column outside the whitelist; it must not reach the SQL.
        export.tasks[0].insert(
            "evil); DROP TABLE tasks; --".to_string(),
            serde_json::Value::from("x"),
        );

        let target = TaskStore::new_in_memory().await.unwrap();
        target.import(export).await.unwrap();
        assert!(target.get_task(task.id).await.unwrap().is_some());
    }
}
