//! Subprocess execution
//!
//! Workspaces never spawn processes themselves; they describe the command with
//! a [`CommandSpec`] and hand it to an [`Executor`]. [`ProcessExecutor`] is the
//! real implementation, tests substitute scripted ones.

use crate::context::OpContext;
use crate::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// A fully described command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    /// Added on top of the inherited process environment
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn envs(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }
}

/// Exit status and combined stdout/stderr of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub output: Vec<u8>,
}

impl CommandOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).to_string()
    }
}

/// Runs commands to completion
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `spec`, killing the process if `ctx` is cancelled or expires.
    ///
    /// A non-zero exit is reported through [`CommandOutput::success`], not
    /// as an error.
    async fn run(&self, spec: &CommandSpec, ctx: &OpContext) -> Result<CommandOutput>;
}

/// [`Executor`] backed by OS processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

#[async_trait]
impl Executor for ProcessExecutor {
    async fn run(&self, spec: &CommandSpec, ctx: &OpContext) -> Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &spec.dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!(program = %spec.program, args = ?spec.args, "Running command");

        let child = cmd.spawn()?;
        tokio::select! {
            output = child.wait_with_output() => {
                let output = output?;
                let mut combined = output.stdout;
                combined.extend_from_slice(&output.stderr);
                Ok(CommandOutput {
                    success: output.status.success(),
                    code: output.status.code(),
                    output: combined,
                })
            }
            err = ctx.done() => {
                // dropping the wait future drops the child, which kills it
                tracing::warn!(program = %spec.program, error = %err, "Command interrupted");
                Err(err)
            }
        }
    }
}
