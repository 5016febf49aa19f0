//! Prompt construction for agent runs.
//!
//! Five variants cover the run shapes the supervisor can request. Every
//! variant that lets the agent touch files carries the forbidden-actions
//! clause: running project commands and version control belong to the
//! orchestrator, never to the CLI child.

use serde::{Deserialize, Serialize};

use tp_core::types::{Repository, Task};

// ---------------------------------------------------------------------------
// Variant selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptVariant {
    Task,
    Resume,
    EmptyRepo,
    PlanOnly,
    ImplementPlan,
}

/// Inputs the prompt builder needs for one run.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub task: &'a Task,
    pub repository: Option<&'a Repository>,
    pub is_resume: bool,
    pub review_feedback: Option<&'a str>,
    pub is_empty_repo: bool,
    pub plan_only: bool,
    pub approved_plan: Option<&'a str>,
}

impl PromptInputs<'_> {
    pub fn variant(&self) -> PromptVariant {
        if self.is_resume && self.review_feedback.is_some() {
            PromptVariant::Resume
        } else if self.plan_only {
            PromptVariant::PlanOnly
        } else if self.approved_plan.is_some() {
            PromptVariant::ImplementPlan
        } else if self.is_empty_repo {
            PromptVariant::EmptyRepo
        } else {
            PromptVariant::Task
        }
    }
}

// ---------------------------------------------------------------------------
// Clauses
// ---------------------------------------------------------------------------

const FORBIDDEN_ACTIONS: &str = "\
Strict constraints:
- Do NOT run tests, builds, or development servers.
- Do NOT execute scripts or any project commands.
- Do NOT use git or any other version-control command; the orchestrator \
commits, pushes, and opens the pull request for you.
- Work only by reading and editing files inside the current directory.";

const PLAN_ONLY_CLAUSE: &str = "\
This is a planning run. Do NOT create, modify, or delete any file. Explore \
the repository read-only and respond with a concrete implementation plan: \
the files you would touch, the changes you would make, and the order you \
would make them in.";

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Render the prompt for a run.
pub fn build_prompt(inputs: &PromptInputs<'_>) -> String {
    let task = inputs.task;
    let mut sections: Vec<String> = Vec::new();

    match inputs.variant() {
        PromptVariant::Task => {
            sections.push(format!("Implement the following task: {}", task.title));
        }
        PromptVariant::Resume => {
            sections.push(format!(
                "You previously worked on this task: {}. A reviewer has \
                 requested changes; address the feedback below on top of \
                 your existing work.",
                task.title
            ));
        }
        PromptVariant::EmptyRepo => {
            sections.push(format!(
                "Implement the following task in a brand-new, empty \
                 repository: {}. Create the initial project structure \
                 yourself.",
                task.title
            ));
        }
        PromptVariant::PlanOnly => {
            sections.push(format!("Produce an implementation plan for: {}", task.title));
            sections.push(PLAN_ONLY_CLAUSE.to_string());
        }
        PromptVariant::ImplementPlan => {
            sections.push(format!(
                "Implement the following task: {}. An implementation plan \
                 has already been approved; follow it.",
                task.title
            ));
        }
    }

    if let Some(desc) = task.description.as_deref().filter(|d| !d.is_empty()) {
        sections.push(format!("Description:\n{desc}"));
    }

    if let Some(spec) = task.final_spec.as_deref().or(task.generated_spec.as_deref()) {
        if !spec.is_empty() {
            sections.push(format!("Specification:\n{spec}"));
        }
    }

    if let Some(plan) = inputs.approved_plan.filter(|p| !p.is_empty()) {
        sections.push(format!("Approved plan:\n{plan}"));
    }

    if let Some(feedback) = inputs.review_feedback.filter(|f| !f.is_empty()) {
        sections.push(format!("Reviewer feedback:\n{feedback}"));
    }

    if !task.context_files.is_empty() {
        sections.push(format!(
            "Start by reading these files:\n{}",
            task.context_files
                .iter()
                .map(|f| format!("- {f}"))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    if let Some(repo) = inputs.repository {
        let mut context = Vec::new();
        if let Some(conventions) = repo.conventions.as_deref().filter(|c| !c.is_empty()) {
            context.push(format!("Project conventions:\n{conventions}"));
        }
        if !repo.learned_patterns.is_empty() {
            context.push(format!(
                "Patterns observed in earlier tasks:\n{}",
                repo.learned_patterns
                    .iter()
                    .map(|p| format!("- {}", p.pattern))
                    .collect::<Vec<_>>()
                    .join("\n")
            ));
        }
        if !context.is_empty() {
            sections.push(context.join("\n\n"));
        }
    }

    if let Some(build) = task.build_command.as_deref().filter(|b| !b.is_empty()) {
        sections.push(format!(
            "For reference only, the project builds with `{build}`. You must \
             NOT run it."
        ));
    }

    if inputs.variant() != PromptVariant::PlanOnly {
        sections.push(FORBIDDEN_ACTIONS.to_string());
    }

    sections.join("\n\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tp_core::types::AgentKind;

    fn make_task() -> Task {
        Task::new(
            "Add rate limiting",
            "https://github.com/o/r",
            "main",
            AgentKind::ClaudeCode,
        )
    }

    fn base_inputs(task: &Task) -> PromptInputs<'_> {
        PromptInputs {
            task,
            repository: None,
            is_resume: false,
            review_feedback: None,
            is_empty_repo: false,
            plan_only: false,
            approved_plan: None,
        }
    }

    #[test]
    fn variant_selection_table() {
        let task = make_task();

        assert_eq!(base_inputs(&task).variant(), PromptVariant::Task);

        let mut i = base_inputs(&task);
        i.is_resume = true;
        i.review_feedback = Some("rename X to Y");
        assert_eq!(i.variant(), PromptVariant::Resume);

        // Resume without feedback is not a resume prompt.
        let mut i = base_inputs(&task);
        i.is_resume = true;
        assert_eq!(i.variant(), PromptVariant::Task);

        let mut i = base_inputs(&task);
        i.is_empty_repo = true;
        assert_eq!(i.variant(), PromptVariant::EmptyRepo);

        let mut i = base_inputs(&task);
        i.plan_only = true;
        assert_eq!(i.variant(), PromptVariant::PlanOnly);

        let mut i = base_inputs(&task);
        i.approved_plan = Some("1. do the thing");
        assert_eq!(i.variant(), PromptVariant::ImplementPlan);
    }

    #[test]
    fn non_plan_variants_carry_forbidden_actions() {
        let task = make_task();
        let prompt = build_prompt(&base_inputs(&task));
        assert!(prompt.contains("Do NOT run tests"));
        assert!(prompt.contains("version-control"));
    }

    #[test]
    fn plan_only_forbids_mutation_instead() {
        let task = make_task();
        let mut i = base_inputs(&task);
        i.plan_only = true;
        let prompt = build_prompt(&i);
        assert!(prompt.contains("Do NOT create, modify, or delete"));
        assert!(!prompt.contains("Do NOT run tests"));
    }

    #[test]
    fn resume_prompt_embeds_feedback() {
        let task = make_task();
        let mut i = base_inputs(&task);
        i.is_resume = true;
        i.review_feedback = Some("rename X to Y");
        let prompt = build_prompt(&i);
        assert!(prompt.contains("rename X to Y"));
        assert!(prompt.contains("requested changes"));
    }

    #[test]
    fn build_command_is_advisory_only() {
        let mut task = make_task();
        task.build_command = Some("npm run build".into());
        let prompt = build_prompt(&base_inputs(&task));
        assert!(prompt.contains("npm run build"));
        assert!(prompt.contains("must NOT run it"));
    }

    #[test]
    fn context_files_listed_in_order() {
        let mut task = make_task();
        task.context_files = vec!["src/a.rs".into(), "src/b.rs".into()];
        let prompt = build_prompt(&base_inputs(&task));
        let a = prompt.find("src/a.rs").unwrap();
        let b = prompt.find("src/b.rs").unwrap();
        assert!(a < b);
    }

    #[test]
    fn repository_context_is_included() {
        let task = make_task();
        let mut repo = Repository::new("https://github.com/o/r", "r");
        repo.conventions = Some("use snake_case".into());
        let mut i = base_inputs(&task);
        i.repository = Some(&repo);
        let prompt = build_prompt(&i);
        assert!(prompt.contains("use snake_case"));
    }
}
