//! Tracked subprocess spawning with process-tree termination.
//!
//! Every spawn is tagged with a task ID. The registry can terminate the
//! whole tree rooted at any tracked PID (children and grandchildren
//! included), and can sweep processes whose working directory sits under a
//! given path — the unstick step worktree cleanup relies on when open
//! handles block directory removal.

use std::collections::HashSet;
use std::path::Path;

use dashmap::DashMap;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ProcessRegistry
// ---------------------------------------------------------------------------

/// Registry mapping task IDs to the PIDs spawned on their behalf.
#[derive(Default)]
pub struct ProcessRegistry {
    tags: DashMap<Uuid, HashSet<u32>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a command tagged with `task_id`. On unix the child is placed in
    /// its own process group so the whole tree can be signalled at once.
    pub fn spawn(&self, task_id: Uuid, cmd: &mut Command) -> std::io::Result<Child> {
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        if let Some(pid) = child.id() {
            self.tags.entry(task_id).or_default().insert(pid);
            debug!(task_id = %task_id, pid, "tracked spawned process");
        }
        Ok(child)
    }

    /// Forget a PID once its child has been reaped.
    pub fn untrack(&self, task_id: Uuid, pid: u32) {
        if let Some(mut set) = self.tags.get_mut(&task_id) {
            set.remove(&pid);
        }
        self.tags.retain(|_, set| !set.is_empty());
    }

    /// PIDs currently tracked for a task.
    pub fn pids_for_task(&self, task_id: Uuid) -> Vec<u32> {
        self.tags
            .get(&task_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Terminate every process tree tracked for a task. Returns the number
    /// of root PIDs signalled.
    pub async fn kill_task(&self, task_id: Uuid) -> usize {
        let pids = match self.tags.remove(&task_id) {
            Some((_, set)) => set,
            None => return 0,
        };
        let count = pids.len();
        for pid in pids {
            info!(task_id = %task_id, pid, "terminating process tree");
            kill_tree(pid).await;
        }
        count
    }

    /// Best-effort sweep of processes whose working directory is under
    /// `path`. Only effective on Linux (via `/proc`); elsewhere it silently
    /// finds nothing and callers fall back on task-tagged kills.
    pub async fn kill_in_directory(&self, path: &Path) -> usize {
        let targets = processes_with_cwd_under(path);
        let count = targets.len();
        for pid in targets {
            warn!(pid, path = %path.display(), "terminating process holding worktree directory");
            kill_tree(pid).await;
        }
        count
    }

    /// Terminate everything the registry knows about. Used at shutdown.
    pub async fn kill_all(&self) -> usize {
        let task_ids: Vec<Uuid> = self.tags.iter().map(|e| *e.key()).collect();
        let mut total = 0;
        for task_id in task_ids {
            total += self.kill_task(task_id).await;
        }
        total
    }

    pub fn tracked_task_count(&self) -> usize {
        self.tags.len()
    }
}

// ---------------------------------------------------------------------------
// ProcessSweeper bridge (used by worktree cleanup)
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl tp_core::worktree_manager::ProcessSweeper for ProcessRegistry {
    async fn kill_task_processes(&self, task_id: Uuid) {
        self.kill_task(task_id).await;
    }

    async fn kill_processes_in_directory(&self, path: &Path) {
        self.kill_in_directory(path).await;
    }
}

// ---------------------------------------------------------------------------
// Tree termination
// ---------------------------------------------------------------------------

#[cfg(unix)]
async fn kill_tree(pid: u32) {
    // Descendants first, in case a child escaped the process group.
    for descendant in descendants_of(pid) {
        unsafe {
            libc::kill(descendant as i32, libc::SIGKILL);
        }
    }
    unsafe {
        // Negative PID signals the whole process group.
        libc::kill(-(pid as i32), libc::SIGKILL);
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(windows)]
async fn kill_tree(pid: u32) {
    let _ = tokio::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .await;
}

/// PIDs whose parent chain leads to `root`, discovered via `/proc`.
#[cfg(target_os = "linux")]
fn descendants_of(root: u32) -> Vec<u32> {
    let mut parents: Vec<(u32, u32)> = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        if let Some(ppid) = parent_of(pid) {
            parents.push((pid, ppid));
        }
    }

    let mut out = Vec::new();
    let mut frontier = vec![root];
    while let Some(current) = frontier.pop() {
        for (pid, ppid) in &parents {
            if *ppid == current && !out.contains(pid) {
                out.push(*pid);
                frontier.push(*pid);
            }
        }
    }
    out
}

#[cfg(target_os = "linux")]
fn parent_of(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Field 4 of /proc/<pid>/stat, after the parenthesized comm (which may
    // itself contain spaces).
    let after_comm = stat.rsplit(')').next()?;
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn descendants_of(_root: u32) -> Vec<u32> {
    Vec::new()
}

/// PIDs whose cwd resolves under `path`. Linux-only; other platforms return
/// nothing.
#[cfg(target_os = "linux")]
fn processes_with_cwd_under(path: &Path) -> Vec<u32> {
    let own_pid = std::process::id();
    let Ok(canonical) = path.canonicalize() else {
        return Vec::new();
    };
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        if let Ok(cwd) = std::fs::read_link(format!("/proc/{pid}/cwd")) {
            if cwd.starts_with(&canonical) {
                out.push(pid);
            }
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
fn processes_with_cwd_under(_path: &Path) -> Vec<u32> {
    Vec::new()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_command() -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        cmd.stdout(std::process::Stdio::null());
        cmd
    }

    #[tokio::test]
    async fn spawn_tracks_and_untrack_forgets() {
        let registry = ProcessRegistry::new();
        let task_id = Uuid::new_v4();

        let mut child = registry.spawn(task_id, &mut sleep_command()).unwrap();
        let pid = child.id().unwrap();
        assert_eq!(registry.pids_for_task(task_id), vec![pid]);

        child.kill().await.unwrap();
        registry.untrack(task_id, pid);
        assert!(registry.pids_for_task(task_id).is_empty());
        assert_eq!(registry.tracked_task_count(), 0);
    }

    #[tokio::test]
    async fn kill_task_terminates_tracked_processes() {
        let registry = ProcessRegistry::new();
        let task_id = Uuid::new_v4();

        let mut child = registry.spawn(task_id, &mut sleep_command()).unwrap();
        let killed = registry.kill_task(task_id).await;
        assert_eq!(killed, 1);

        // The child must be reapable promptly after the kill.
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .expect("child did not exit after kill")
            .unwrap();
        assert!(!status.success());
        assert!(registry.pids_for_task(task_id).is_empty());
    }

    #[tokio::test]
    async fn kill_task_on_unknown_task_is_zero() {
        let registry = ProcessRegistry::new();
        assert_eq!(registry.kill_task(Uuid::new_v4()).await, 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn directory_kill_finds_process_by_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new();
        let task_id = Uuid::new_v4();

        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        cmd.current_dir(tmp.path());
        let mut child = registry.spawn(task_id, &mut cmd).unwrap();

        let killed = registry.kill_in_directory(tmp.path()).await;
        assert!(killed >= 1);

        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .expect("child did not exit after directory kill")
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn kill_all_clears_registry() {
        let registry = ProcessRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut child_a = registry.spawn(a, &mut sleep_command()).unwrap();
        let mut child_b = registry.spawn(b, &mut sleep_command()).unwrap();

        let total = registry.kill_all().await;
        assert_eq!(total, 2);
        assert_eq!(registry.tracked_task_count(), 0);

        let _ = child_a.wait().await;
        let _ = child_b.wait().await;
    }
}
