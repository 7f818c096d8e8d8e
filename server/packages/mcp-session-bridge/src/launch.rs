use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// How to start one worker process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no worker command given; pass it after `--`")]
    MissingCommand,
}

impl LaunchSpec {
    /// Parses `program arg1 arg2 ...`.
    pub fn from_command_line(command: &[String]) -> Result<Self, LaunchError> {
        let (program, args) = command.split_first().ok_or(LaunchError::MissingCommand)?;
        Ok(Self {
            program: PathBuf::from(program),
            args: args.to_vec(),
            env: HashMap::new(),
        })
    }

    /// Environment for a spawned worker: its own variables plus the bridge's request
    /// timeout, which the worker uses to bound its own tool execution.
    pub fn worker_env(&self, request_timeout: Duration) -> HashMap<String, String> {
        let timeout_ms = request_timeout.as_millis().to_string();
        let mut env = self.env.clone();
        env.insert("MCP_TIMEOUT".to_string(), timeout_ms.clone());
        env.insert("MCP_TOOL_TIMEOUT".to_string(), timeout_ms);
        env
    }

    pub fn display(&self) -> String {
        format_command_for_display(&self.program, &self.args)
    }
}

fn format_command_for_display(program: &Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program.to_string_lossy().as_ref()));
    for arg in args {
        parts.push(shell_quote(arg));
    }
    parts.join(" ")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_splits_program_and_args() {
        let spec = LaunchSpec::from_command_line(&[
            "node".to_string(),
            "build/index.js".to_string(),
        ])
        .expect("spec");
        assert_eq!(spec.program, PathBuf::from("node"));
        assert_eq!(spec.args, vec!["build/index.js".to_string()]);
        assert_eq!(spec.display(), "'node' 'build/index.js'");
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            LaunchSpec::from_command_line(&[]),
            Err(LaunchError::MissingCommand)
        ));
    }

    #[test]
    fn worker_env_injects_timeouts_over_spec_env() {
        let mut spec = LaunchSpec::from_command_line(&["worker".to_string()]).expect("spec");
        spec.env.insert("MCP_TIMEOUT".to_string(), "1".to_string());
        spec.env.insert("EXTRA".to_string(), "yes".to_string());

        let env = spec.worker_env(Duration::from_secs(180));
        assert_eq!(env["MCP_TIMEOUT"], "180000");
        assert_eq!(env["MCP_TOOL_TIMEOUT"], "180000");
        assert_eq!(env["EXTRA"], "yes");
    }

    #[test]
    fn display_quotes_single_quotes() {
        let spec = LaunchSpec::from_command_line(&["sh".to_string(), "it's".to_string()])
            .expect("spec");
        assert_eq!(spec.display(), "'sh' 'it'\\''s'");
    }
}
