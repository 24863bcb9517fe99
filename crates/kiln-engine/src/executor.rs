use crate::error::ExecError;

/// Abstraction over external command execution for testability.
///
/// Production code uses [`RealExecutor`], tests use mockall-generated mocks.
#[allow(async_fn_in_trait)]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command and capture stdout.
    async fn exec(&self, program: &str, args: &[String]) -> Result<String, ExecError>;
}

/// Runs commands with `tokio::process`.
pub struct RealExecutor;

impl CommandExecutor for RealExecutor {
    async fn exec(&self, program: &str, args: &[String]) -> Result<String, ExecError> {
        use std::process::Stdio;

        tracing::debug!(program, ?args, "exec");

        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ExecError::NotFound {
                program: program.to_owned(),
                source: e,
            })?;

        if output.status.success() {
            String::from_utf8(output.stdout).map_err(|e| ExecError::InvalidUtf8 {
                program: program.to_owned(),
                source: e,
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            Err(ExecError::CommandFailed {
                program: program.to_owned(),
                args: args.to_vec(),
                stderr,
            })
        }
    }
}
