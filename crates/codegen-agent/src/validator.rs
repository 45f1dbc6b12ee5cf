//! Generic command-based gate battery (§4.D/§4.F validation step).
//!
//! Grounded on `fullstack/backend_fsm.py`'s `eval_backend` /
//! `eval_backend_handlers` / `eval_backend_index`: each stage gates on a
//! fixed ordered list of shell commands (typecheck, test, lint, migration
//! push) run inside the candidate's workspace. The first non-zero exit's
//! stdout/stderr becomes the feedback fed back into the candidate's next
//! LLM turn; a clean run through every command is the only way `complete()`
//! is accepted.

use async_trait::async_trait;

use crate::beam::{ValidationOutcome, ValidatorBattery};
use crate::errors::AgentResult;
use crate::workspace::Workspace;

pub struct CommandValidator {
    commands: Vec<String>,
    cwd: String,
    needs_postgres: bool,
}

impl CommandValidator {
    pub fn new(commands: Vec<&str>, cwd: &str, needs_postgres: bool) -> Self {
        Self {
            commands: commands.into_iter().map(String::from).collect(),
            cwd: cwd.to_string(),
            needs_postgres,
        }
    }

    /// Schema + server scaffolding: typecheck only.
    pub fn draft() -> Self {
        Self::new(vec!["bun run typecheck"], ".", false)
    }

    /// tRPC handlers: typecheck plus the unit test suite, against a live
    /// Postgres service since handlers touch the database.
    pub fn handlers() -> Self {
        Self::new(vec!["bun run typecheck", "bun test"], ".", true)
    }

    /// Router wiring + migrations: push the schema, then typecheck.
    pub fn index() -> Self {
        Self::new(vec!["drizzle-kit push --force", "bun run typecheck"], ".", true)
    }

    /// Frontend: typecheck and lint.
    pub fn frontend() -> Self {
        Self::new(vec!["bun run typecheck", "bun run lint"], ".", false)
    }
}

#[async_trait]
impl ValidatorBattery for CommandValidator {
    async fn validate(&self, workspace: &Workspace) -> AgentResult<ValidationOutcome> {
        for command in &self.commands {
            let result = if self.needs_postgres {
                workspace.exec_with_pg(command, &self.cwd).await?
            } else {
                workspace.exec(command, &self.cwd).await?
            };
            if !result.success() {
                return Ok(ValidationOutcome {
                    passed: false,
                    feedback: Some(format!(
                        "`{command}` failed (exit {}):\n{}",
                        result.exit_code, result.stderr
                    )),
                });
            }
        }
        Ok(ValidationOutcome {
            passed: true,
            feedback: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{LocalFsEngine, PathSet};
    use std::sync::Arc;

    async fn workspace() -> Workspace {
        let dir = tempfile::tempdir().unwrap();
        let engine: Arc<dyn crate::workspace::ContainerEngine> =
            Arc::new(LocalFsEngine::new(dir.keep()));
        Workspace::create(engine, "scratch", None, PathSet::default(), PathSet::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn passes_when_every_command_exits_zero() {
        let ws = workspace().await;
        let validator = CommandValidator::new(vec!["true"], ".", false);
        let outcome = validator.validate(&ws).await.unwrap();
        assert!(outcome.passed);
        assert!(outcome.feedback.is_none());
    }

    #[tokio::test]
    async fn reports_feedback_on_first_failing_command() {
        let ws = workspace().await;
        let validator = CommandValidator::new(vec!["false", "true"], ".", false);
        let outcome = validator.validate(&ws).await.unwrap();
        assert!(!outcome.passed);
        assert!(outcome.feedback.unwrap().contains("false"));
    }
}
