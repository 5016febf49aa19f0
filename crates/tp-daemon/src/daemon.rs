//! Daemon wiring: builds the orchestration stack from config, serves the
//! event-stream surface, and tears everything down in order on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use tp_agents::pr_watcher::PrWatcher;
use tp_agents::runner::AgentRunner;
use tp_agents::supervisor::{AgentSupervisor, SupervisorConfig};
use tp_bridge::event_bus::EventBus;
use tp_bridge::sse::{self, ApiState};
use tp_core::buffers::TaskBuffers;
use tp_core::config::Config;
use tp_core::secrets::{EnvSecretStore, SecretStore, GITHUB_TOKEN, GITLAB_TOKEN};
use tp_core::task_store::TaskStore;
use tp_core::worktree_manager::{ProcessSweeper, WorktreeManager};
use tp_integrations::forge::{ForgeAdapter, ForgeRouter};
use tp_session::process_registry::ProcessRegistry;
use tp_session::shutdown::{DrainGuard, ShutdownSignal};

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

fn dirs_home() -> Option<String> {
    std::env::var("HOME").ok().filter(|h| !h.is_empty())
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

pub struct Daemon {
    config: Config,
    bus: EventBus,
    store: Arc<TaskStore>,
    buffers: Arc<TaskBuffers>,
    registry: Arc<ProcessRegistry>,
    supervisor: Arc<AgentSupervisor>,
    watcher: Arc<PrWatcher>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Build the whole stack from config.
    pub async fn new(config: Config) -> Result<Self> {
        let db_path = expand_home(&config.general.db_path);
        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let store = Arc::new(
            TaskStore::new(&db_path)
                .await
                .context("failed to open task store")?,
        );

        let bus = EventBus::with_queue_cap(config.events.subscriber_queue);
        let buffers = Arc::new(TaskBuffers::new(
            config.events.log_cap_per_task,
            config.events.chat_cap_per_task,
        ));
        let registry = Arc::new(ProcessRegistry::new());

        let worktrees = Arc::new(
            WorktreeManager::new(
                expand_home(&config.git.repos_base_dir),
                expand_home(&config.git.worktrees_dir),
            )
            .with_max_file_content_bytes(config.git.max_file_content_bytes)
            .with_sweeper(Arc::clone(&registry) as Arc<dyn ProcessSweeper>),
        );

        let secrets: Arc<dyn SecretStore> = Arc::new(EnvSecretStore);
        let forge: Arc<dyn ForgeAdapter> = Arc::new(ForgeRouter::new(
            secrets.get(GITHUB_TOKEN).await,
            secrets.get(GITLAB_TOKEN).await,
        ));

        let supervisor = AgentSupervisor::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&buffers),
            Arc::clone(&registry),
            worktrees,
            Arc::clone(&forge),
            secrets,
            AgentRunner::new(Arc::clone(&registry)),
            SupervisorConfig {
                default_timeout_ms: config.agents.default_timeout_ms,
                warning_threshold_ms: config.agents.warning_threshold_ms,
                extension_ms: config.agents.extension_ms,
                silence_warning_ms: config.agents.silence_warning_ms,
            },
        );

        let watcher = PrWatcher::new(
            Arc::clone(&store),
            Arc::clone(&supervisor),
            forge,
            bus.clone(),
            config.watcher.pr_poll_interval_ms,
        );

        Ok(Self {
            config,
            bus,
            store,
            buffers,
            registry,
            supervisor,
            watcher,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn supervisor(&self) -> &Arc<AgentSupervisor> {
        &self.supervisor
    }

    /// Run until the shutdown signal fires, then tear down in order: cancel
    /// active agents, stop the watcher, close topics, kill stragglers.
    pub async fn run(self) -> Result<()> {
        // Resume PR tracking for tasks that were mid-flight at last exit.
        self.watcher.init().await;

        let watcher = Arc::clone(&self.watcher);
        let watcher_shutdown = self.shutdown.clone();
        let watcher_guard = DrainGuard::new(self.shutdown.clone());
        tokio::spawn(async move {
            watcher.run(watcher_shutdown).await;
            drop(watcher_guard);
        });

        // Periodic sweep of expired per-task buffers.
        let buffers = Arc::clone(&self.buffers);
        let sweep_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut rx = sweep_shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = rx.recv() => return,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        let removed = buffers.sweep();
                        if removed > 0 {
                            info!(removed, "expired task buffers released");
                        }
                    }
                }
            }
        });

        // Event-stream surface.
        let state = ApiState::new(
            Arc::clone(&self.store),
            Arc::clone(&self.buffers),
            self.bus.clone(),
        );
        let router = sse::router(state).layer(tower_http::trace::TraceLayer::new_for_http());
        let addr = self.config.daemon.bind_addr.clone();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(%addr, "taskpilot daemon listening");

        let mut serve_shutdown = self.shutdown.subscribe();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = serve_shutdown.recv().await;
        });

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received");
                shutdown.trigger();
            }
        });

        server.await.context("server error")?;

        // Ordered teardown.
        info!("shutting down: cancelling active agents");
        self.supervisor.shutdown().await;

        let mut drain = self.shutdown.clone();
        let confirmed = drain.wait_for_drain(1, Duration::from_secs(10)).await;
        if confirmed < 1 {
            warn!("PR watcher did not confirm drain in time");
        }

        self.bus.close_all();
        let killed = self.registry.kill_all().await;
        if killed > 0 {
            warn!(killed, "terminated straggler processes at shutdown");
        }
        info!("taskpilot daemon stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_home_rewrites_tilde() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(expand_home("~/x/y"), "/home/tester/x/y");
        assert_eq!(expand_home("/abs/path"), "/abs/path");
        assert_eq!(expand_home("relative"), "relative");
    }
}
