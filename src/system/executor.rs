// src/system/executor.rs

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command as StdCommand, ExitStatus, Stdio};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Shell command line could not be parsed: {0}")]
    CommandParse(String),
    #[error("No shell specified to run the command.")]
    EmptyCommand,
    #[error("Shell '{0}' could not be executed: {1}")]
    CommandFailed(String, #[source] std::io::Error),
    #[error("Command '{command}' exited with code {code}.")]
    NonZeroExitStatus { command: String, code: i32 },
    #[error("Command '{0}' was terminated by a signal.")]
    Terminated(String),
    #[error("Command '{command}' produced output that was not valid UTF-8")]
    InvalidUtf8Output {
        command: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
    #[error("Could not prepare the invocation script: {0}")]
    Script(#[source] std::io::Error),
}

/// The interpreter a script is handed to: program plus leading arguments,
/// with the script path appended last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellSpec {
    /// Parses a command line such as `pwsh -NoProfile -File`.
    pub fn parse(command_line: &str) -> Result<Self, ExecutionError> {
        let trimmed = command_line.trim();
        let mut parts = shlex::split(trimmed)
            .ok_or_else(|| ExecutionError::CommandParse(trimmed.to_string()))?
            .into_iter();
        let program = parts.next().ok_or(ExecutionError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn command_for(&self, script: &Path, cwd: &Path) -> StdCommand {
        let mut command = StdCommand::new(&self.program);
        command
            .args(&self.args)
            .arg(script)
            .current_dir(dunce::simplified(cwd));
        command
    }
}

/// Quotes a value as a PowerShell single-quoted string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Builds a script that dot-sources `fragments` in order, then calls
/// `command` with `args` passed as literals.
pub fn render_invocation_script(fragments: &[PathBuf], command: &str, args: &[String]) -> String {
    let mut script = String::from("$ErrorActionPreference = 'Stop'\n");
    for fragment in fragments {
        script.push_str(". ");
        script.push_str(&quote_literal(&fragment.to_string_lossy()));
        script.push('\n');
    }
    script.push_str("& ");
    script.push_str(&quote_literal(command));
    for arg in args {
        script.push(' ');
        script.push_str(&quote_literal(arg));
    }
    script.push('\n');
    script
}

fn write_temp_script(script: &str) -> Result<NamedTempFile, ExecutionError> {
    let mut file = tempfile::Builder::new()
        .prefix("psprofile-")
        .suffix(".ps1")
        .tempfile()
        .map_err(ExecutionError::Script)?;
    file.write_all(script.as_bytes()).map_err(ExecutionError::Script)?;
    file.flush().map_err(ExecutionError::Script)?;
    log::trace!("Wrote invocation script to '{}'.", file.path().display());
    Ok(file)
}

fn check_status(status: ExitStatus, shell: &ShellSpec) -> Result<(), ExecutionError> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(ExecutionError::NonZeroExitStatus {
            command: shell.program.clone(),
            code,
        }),
        None => Err(ExecutionError::Terminated(shell.program.clone())),
    }
}

/// Runs `script` through `shell` with inherited stdio and waits for it.
/// The temporary script file is removed afterwards.
pub fn run_script(shell: &ShellSpec, script: &str, cwd: &Path) -> Result<(), ExecutionError> {
    let file = write_temp_script(script)?;
    let status = shell
        .command_for(file.path(), cwd)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|e| spawn_error(shell, e))?;
    check_status(status, shell)
}

/// Runs `script` through `shell` and captures its standard output.
/// Stderr is passed through to the user's terminal.
pub fn capture_script(shell: &ShellSpec, script: &str, cwd: &Path) -> Result<String, ExecutionError> {
    let file = write_temp_script(script)?;
    let output = shell
        .command_for(file.path(), cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .map_err(|e| spawn_error(shell, e))?;
    check_status(output.status, shell)?;

    String::from_utf8(output.stdout).map_err(|e| ExecutionError::InvalidUtf8Output {
        command: shell.program.clone(),
        source: e,
    })
}

fn spawn_error(shell: &ShellSpec, e: std::io::Error) -> ExecutionError {
    if e.kind() == ErrorKind::NotFound {
        log::debug!("Shell program '{}' not found on PATH.", shell.program);
    }
    ExecutionError::CommandFailed(shell.program.clone(), e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shell_spec() {
        let spec = ShellSpec::parse("pwsh -NoProfile -File").unwrap();
        assert_eq!(spec.program, "pwsh");
        assert_eq!(spec.args, vec!["-NoProfile", "-File"]);

        assert!(matches!(ShellSpec::parse("   "), Err(ExecutionError::EmptyCommand)));
        assert!(matches!(ShellSpec::parse("pwsh 'unclosed"), Err(ExecutionError::CommandParse(_))));
    }

    #[test]
    fn test_render_invocation_script_quotes_everything() {
        let script = render_invocation_script(
            &[PathBuf::from("/p/git.ps1"), PathBuf::from("/p/it's.ps1")],
            "Invoke-Git",
            &["status".to_string(), "--short; rm".to_string()],
        );
        assert_eq!(
            script,
            "$ErrorActionPreference = 'Stop'\n\
             . '/p/git.ps1'\n\
             . '/p/it''s.ps1'\n\
             & 'Invoke-Git' 'status' '--short; rm'\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_capture_script_runs_through_shell() {
        let shell = ShellSpec::parse("sh").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let output = capture_script(&shell, "echo hello\n", dir.path()).unwrap();
        assert_eq!(output.trim(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_is_reported() {
        let shell = ShellSpec::parse("sh").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let result = run_script(&shell, "exit 3\n", dir.path());
        assert!(matches!(result, Err(ExecutionError::NonZeroExitStatus { code: 3, .. })));
    }

    #[test]
    fn test_missing_shell_is_a_spawn_error() {
        let shell = ShellSpec::parse("psprofile-no-such-shell-binary").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let result = run_script(&shell, "", dir.path());
        assert!(matches!(result, Err(ExecutionError::CommandFailed(..))));
    }
}
