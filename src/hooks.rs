//! Command-based service hooks
//!
//! [`CommandServiceHook`] implements [`ServiceHook`] by running external
//! commands, which is how the CLI stops and restarts containers (or anything
//! else) around a backup without the engine knowing about any runtime.
//!
//! - The quiesce command runs with `DIRVAULT_JOB` set to the job name. Every
//!   non-empty line it prints on stdout becomes a token.
//! - The resume command runs with the tokens appended as arguments.
//!
//! A non-zero exit status is a [`VaultError::Hook`]. An empty command
//! disables that half of the hook.

use crate::error::{Result, VaultError};
use crate::orchestrator::{QuiesceToken, ServiceHook};
use crate::types::BackupJob;
use serde::{Deserialize, Serialize};
use std::process::{Command, Output};
use tracing::{debug, info};

/// Environment variable carrying the job name
pub const JOB_ENV: &str = "DIRVAULT_JOB";

/// Quiesce/resume commands as `argv` vectors
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandHookConfig {
    /// Program and arguments run before archiving
    #[serde(default)]
    pub quiesce: Vec<String>,
    /// Program and arguments run after archiving; tokens are appended
    #[serde(default)]
    pub resume: Vec<String>,
}

impl CommandHookConfig {
    /// Whether neither command is configured
    pub fn is_empty(&self) -> bool {
        self.quiesce.is_empty() && self.resume.is_empty()
    }
}

/// Runs configured commands to pause and resume services
#[derive(Debug, Clone, Default)]
pub struct CommandServiceHook {
    config: CommandHookConfig,
}

impl CommandServiceHook {
    /// Hook running the commands in `config`
    pub fn new(config: CommandHookConfig) -> Self {
        Self { config }
    }

    fn execute(&self, argv: &[String], extra: &[QuiesceToken], job: &BackupJob) -> Result<Option<Output>> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(None);
        };

        debug!("Running hook command {} {:?}", program, args);
        let output = Command::new(program)
            .args(args)
            .args(extra)
            .env(JOB_ENV, &job.name)
            .output()
            .map_err(|e| VaultError::hook(format!("failed to run '{}': {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VaultError::hook(format!(
                "'{}' exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(Some(output))
    }
}

impl ServiceHook for CommandServiceHook {
    fn quiesce(&self, job: &BackupJob) -> Result<Vec<QuiesceToken>> {
        let Some(output) = self.execute(&self.config.quiesce, &[], job)? else {
            return Ok(Vec::new());
        };
        let tokens: Vec<QuiesceToken> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        info!("Quiesced {} services for {}", tokens.len(), job.name);
        Ok(tokens)
    }

    fn resume(&self, job: &BackupJob, tokens: &[QuiesceToken]) -> Result<()> {
        if self.execute(&self.config.resume, tokens, job)?.is_some() {
            info!("Resumed services for {}", job.name);
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn job() -> BackupJob {
        BackupJob {
            name: "nightly".to_string(),
            ..Default::default()
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_quiesce_tokens_from_stdout() {
        let hook = CommandServiceHook::new(CommandHookConfig {
            quiesce: sh("printf 'web\\n\\n  db  \\n'; test \"$DIRVAULT_JOB\" = nightly"),
            resume: Vec::new(),
        });
        assert_eq!(hook.quiesce(&job()).unwrap(), vec!["web", "db"]);
    }

    #[test]
    fn test_resume_receives_tokens() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("resumed");
        let script = format!("echo \"$@\" > '{}'", out.display());
        // With `sh -c`, the first extra argument becomes $0
        let mut resume = sh(&script);
        resume.push("resume".to_string());
        let hook = CommandServiceHook::new(CommandHookConfig {
            quiesce: Vec::new(),
            resume,
        });

        hook.resume(&job(), &["web".to_string(), "db".to_string()]).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "web db");
    }

    #[test]
    fn test_failing_command_is_hook_error() {
        let hook = CommandServiceHook::new(CommandHookConfig {
            quiesce: sh("echo boom >&2; exit 3"),
            resume: Vec::new(),
        });
        let err = hook.quiesce(&job()).unwrap_err();
        assert!(matches!(err, VaultError::Hook(ref msg) if msg.contains("boom")));
    }

    #[test]
    fn test_empty_config_is_noop() {
        let hook = CommandServiceHook::default();
        assert!(hook.quiesce(&job()).unwrap().is_empty());
        assert!(hook.resume(&job(), &[]).is_ok());
    }
}
