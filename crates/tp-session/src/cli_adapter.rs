//! Command templates for the supported coding-CLI backends.
//!
//! Each adapter knows its backend's binary, standing flags, model flag, how
//! the prompt is delivered (argv element vs. piped on stdin), and which
//! environment variable carries its credential. The adapter only *describes*
//! the spawn; the runner owns the child process.

use tp_core::types::AgentKind;

// ---------------------------------------------------------------------------
// PromptDelivery / CommandSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDelivery {
    /// Prompt appended as the final argv element.
    Argv,
    /// Prompt written to the child's stdin, terminated by EOF-on-close.
    Stdin,
}

/// A fully resolved spawn description.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Prompt to write to stdin when delivery resolved to [`PromptDelivery::Stdin`].
    pub stdin_prompt: Option<String>,
    /// Environment variable the backend expects its credential in.
    pub credential_env_var: &'static str,
}

/// Argv prompts beyond this size are re-routed through stdin. Windows is far
/// more restrictive than POSIX (the whole command line caps at ~32 KiB, and
/// `.cmd` shims re-interpret special characters).
#[cfg(windows)]
const MAX_ARGV_PROMPT: usize = 6_000;
#[cfg(not(windows))]
const MAX_ARGV_PROMPT: usize = 100_000;

fn effective_delivery(preferred: PromptDelivery, prompt: &str) -> PromptDelivery {
    match preferred {
        PromptDelivery::Stdin => PromptDelivery::Stdin,
        PromptDelivery::Argv => {
            let risky = prompt.len() > MAX_ARGV_PROMPT
                || (cfg!(windows) && prompt.contains(['"', '%', '^']));
            if risky {
                PromptDelivery::Stdin
            } else {
                PromptDelivery::Argv
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CliAdapter trait
// ---------------------------------------------------------------------------

/// Per-backend command conventions. All adapters must be `Send + Sync`.
pub trait CliAdapter: Send + Sync {
    fn agent_kind(&self) -> AgentKind;

    /// Binary name resolved via PATH.
    fn binary_name(&self) -> &str;

    /// Flags always passed: non-interactive mode, structured output, and
    /// permission bypass where the backend needs one.
    fn default_args(&self) -> Vec<String>;

    /// Flags selecting a specific model.
    fn model_args(&self, model: &str) -> Vec<String>;

    /// How this backend prefers to receive the prompt.
    fn prompt_delivery(&self) -> PromptDelivery;

    /// Environment variable the backend reads its credential from.
    fn credential_env_var(&self) -> &'static str;

    /// Assemble the final spawn description for a prompt, applying the
    /// argv-length fallback.
    fn command_spec(&self, prompt: &str, model: Option<&str>) -> CommandSpec {
        let mut args = self.default_args();
        if let Some(model) = model {
            args.extend(self.model_args(model));
        }
        let stdin_prompt = match effective_delivery(self.prompt_delivery(), prompt) {
            PromptDelivery::Argv => {
                args.push(prompt.to_string());
                None
            }
            PromptDelivery::Stdin => Some(prompt.to_string()),
        };
        CommandSpec {
            program: self.binary_name().to_string(),
            args,
            stdin_prompt,
            credential_env_var: self.credential_env_var(),
        }
    }
}

// ---------------------------------------------------------------------------
// Claude Code
// ---------------------------------------------------------------------------

/// Anthropic's Claude Code CLI. NDJSON on stdout via `stream-json`.
pub struct ClaudeCodeAdapter;

impl CliAdapter for ClaudeCodeAdapter {
    fn agent_kind(&self) -> AgentKind {
        AgentKind::ClaudeCode
    }

    fn binary_name(&self) -> &str {
        "claude"
    }

    fn default_args(&self) -> Vec<String> {
        vec![
            "-p".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--dangerously-skip-permissions".into(),
        ]
    }

    fn model_args(&self, model: &str) -> Vec<String> {
        vec!["--model".into(), model.into()]
    }

    fn prompt_delivery(&self) -> PromptDelivery {
        PromptDelivery::Argv
    }

    fn credential_env_var(&self) -> &'static str {
        "ANTHROPIC_API_KEY"
    }
}

// ---------------------------------------------------------------------------
// Codex
// ---------------------------------------------------------------------------

/// OpenAI's Codex CLI in non-interactive exec mode.
pub struct CodexAdapter;

impl CliAdapter for CodexAdapter {
    fn agent_kind(&self) -> AgentKind {
        AgentKind::Codex
    }

    fn binary_name(&self) -> &str {
        "codex"
    }

    fn default_args(&self) -> Vec<String> {
        vec![
            "exec".into(),
            "--json".into(),
            "--full-auto".into(),
            "--skip-git-repo-check".into(),
        ]
    }

    fn model_args(&self, model: &str) -> Vec<String> {
        vec!["-m".into(), model.into()]
    }

    fn prompt_delivery(&self) -> PromptDelivery {
        // codex reads the task from stdin when no positional prompt is given.
        PromptDelivery::Stdin
    }

    fn credential_env_var(&self) -> &'static str {
        "OPENAI_API_KEY"
    }
}

// ---------------------------------------------------------------------------
// Copilot
// ---------------------------------------------------------------------------

pub struct CopilotAdapter;

impl CliAdapter for CopilotAdapter {
    fn agent_kind(&self) -> AgentKind {
        AgentKind::Copilot
    }

    fn binary_name(&self) -> &str {
        "copilot"
    }

    fn default_args(&self) -> Vec<String> {
        vec!["-p".into(), "--allow-all-tools".into(), "--no-color".into()]
    }

    fn model_args(&self, model: &str) -> Vec<String> {
        vec!["--model".into(), model.into()]
    }

    fn prompt_delivery(&self) -> PromptDelivery {
        PromptDelivery::Argv
    }

    fn credential_env_var(&self) -> &'static str {
        "GH_TOKEN"
    }
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

pub struct GeminiAdapter;

impl CliAdapter for GeminiAdapter {
    fn agent_kind(&self) -> AgentKind {
        AgentKind::Gemini
    }

    fn binary_name(&self) -> &str {
        "gemini"
    }

    fn default_args(&self) -> Vec<String> {
        vec!["-p".into(), "--yolo".into()]
    }

    fn model_args(&self, model: &str) -> Vec<String> {
        vec!["-m".into(), model.into()]
    }

    fn prompt_delivery(&self) -> PromptDelivery {
        PromptDelivery::Argv
    }

    fn credential_env_var(&self) -> &'static str {
        "GEMINI_API_KEY"
    }
}

// ---------------------------------------------------------------------------
// OpenRouter (via opencode)
// ---------------------------------------------------------------------------

/// OpenRouter-backed models run through the opencode CLI.
pub struct OpenrouterAdapter;

impl CliAdapter for OpenrouterAdapter {
    fn agent_kind(&self) -> AgentKind {
        AgentKind::Openrouter
    }

    fn binary_name(&self) -> &str {
        "opencode"
    }

    fn default_args(&self) -> Vec<String> {
        vec!["run".into(), "--print-logs".into()]
    }

    fn model_args(&self, model: &str) -> Vec<String> {
        vec!["-m".into(), format!("openrouter/{model}")]
    }

    fn prompt_delivery(&self) -> PromptDelivery {
        PromptDelivery::Argv
    }

    fn credential_env_var(&self) -> &'static str {
        "OPENROUTER_API_KEY"
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Adapter lookup for an agent kind.
pub fn adapter_for(kind: AgentKind) -> Box<dyn CliAdapter> {
    match kind {
        AgentKind::ClaudeCode => Box::new(ClaudeCodeAdapter),
        AgentKind::Codex => Box::new(CodexAdapter),
        AgentKind::Copilot => Box::new(CopilotAdapter),
        AgentKind::Gemini => Box::new(GeminiAdapter),
        AgentKind::Openrouter => Box::new(OpenrouterAdapter),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_prompt_rides_argv() {
        let spec = ClaudeCodeAdapter.command_spec("do the thing", Some("sonnet"));
        assert_eq!(spec.program, "claude");
        assert_eq!(spec.args.last().unwrap(), "do the thing");
        assert!(spec.args.contains(&"--model".to_string()));
        assert!(spec.args.contains(&"stream-json".to_string()));
        assert!(spec.stdin_prompt.is_none());
        assert_eq!(spec.credential_env_var, "ANTHROPIC_API_KEY");
    }

    #[test]
    fn codex_prompt_rides_stdin() {
        let spec = CodexAdapter.command_spec("fix the bug", None);
        assert_eq!(spec.program, "codex");
        assert_eq!(spec.stdin_prompt.as_deref(), Some("fix the bug"));
        assert!(!spec.args.iter().any(|a| a == "fix the bug"));
    }

    #[test]
    fn oversized_argv_prompt_falls_back_to_stdin() {
        let huge = "x".repeat(MAX_ARGV_PROMPT + 1);
        let spec = ClaudeCodeAdapter.command_spec(&huge, None);
        assert!(spec.stdin_prompt.is_some());
        assert!(!spec.args.iter().any(|a| a.len() > MAX_ARGV_PROMPT));
    }

    #[test]
    fn factory_covers_every_kind() {
        for kind in [
            AgentKind::ClaudeCode,
            AgentKind::Codex,
            AgentKind::Copilot,
            AgentKind::Gemini,
            AgentKind::Openrouter,
        ] {
            let adapter = adapter_for(kind);
            assert_eq!(adapter.agent_kind(), kind);
            assert!(!adapter.binary_name().is_empty());
        }
    }

    #[test]
    fn openrouter_prefixes_model() {
        let spec = OpenrouterAdapter.command_spec("task", Some("deepseek/deepseek-chat"));
        assert!(spec
            .args
            .iter()
            .any(|a| a == "openrouter/deepseek/deepseek-chat"));
    }
}
