//! Tool verbs against one resource's working directory
//!
//! A [`Workspace`] runs the provisioning tool in a directory that manages a
//! single resource. Blocking verbs take an [`OpContext`]; `apply_async` and
//! `destroy_async` record the action in the workspace [`Operation`] and
//! finish on a background task that reports through an
//! [`OperationCallback`].

use crate::context::OpContext;
use crate::error::{ExecError, Result};
use crate::executor::{CommandSpec, Executor};
use crate::filter::{NoOpFilter, OutputFilter};
use crate::scheduler::{InUse, InUseGuard, ProviderHandle, ProviderScheduler};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tfbridge_core::diagnostics::{failure_summary, find_change_summary};
use tfbridge_core::{Operation, OperationError, StateFile, StateV4};

pub const DEFAULT_TOOL_PATH: &str = "terraform";
pub const DEFAULT_ASYNC_TIMEOUT: Duration = Duration::from_secs(60 * 60);

pub const KIND_APPLY: &str = "apply";
pub const KIND_DESTROY: &str = "destroy";

const NON_EXISTENT_REMOTE_OBJECT: &str = "Cannot import non-existent remote object";

/// Tool verbs and their fixed flag sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Apply,
    Destroy,
    Refresh,
    Plan,
}

impl Verb {
    fn args(self) -> &'static [&'static str] {
        match self {
            Verb::Apply => &["apply", "-auto-approve", "-input=false", "-lock=false", "-json"],
            Verb::Destroy => &["destroy", "-auto-approve", "-input=false", "-lock=false", "-json"],
            Verb::Refresh => &[
                "apply",
                "-refresh-only",
                "-auto-approve",
                "-input=false",
                "-lock=false",
                "-json",
            ],
            Verb::Plan => &["plan", "-refresh=false", "-input=false", "-lock=false", "-json"],
        }
    }

    fn failure(self, output: String) -> ExecError {
        let summary = failure_summary(&output);
        match self {
            Verb::Apply => ExecError::ApplyFailed { summary, output },
            Verb::Destroy => ExecError::DestroyFailed { summary, output },
            Verb::Refresh => ExecError::RefreshFailed { summary, output },
            Verb::Plan => ExecError::PlanFailed { summary, output },
        }
    }
}

/// Receives the outcome of an asynchronous verb.
///
/// Runs on the background task after the operation has ended. A returned
/// error is logged and goes nowhere else.
#[async_trait]
pub trait OperationCallback: Send + Sync {
    async fn on_complete(&self, error: Option<OperationError>, ctx: &OpContext) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub state: StateV4,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshResult {
    pub exists: bool,
    /// An asynchronous apply or destroy is still running; `exists` is assumed
    pub async_in_progress: bool,
    pub state: Option<StateV4>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanResult {
    pub exists: bool,
    pub up_to_date: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    pub exists: bool,
    pub state: Option<StateV4>,
}

/// Native provider process borrowed for the workspace's invocations
#[derive(Clone)]
pub struct ProviderBinding {
    pub handle: ProviderHandle,
    pub in_use: Arc<dyn InUse>,
    pub scheduler: Arc<dyn ProviderScheduler>,
}

/// Execution context of one resource's working directory
pub struct Workspace {
    dir: PathBuf,
    tool_path: String,
    executor: Arc<dyn Executor>,
    operation: Operation,
    async_timeout: Duration,
    env: RwLock<Vec<(String, String)>>,
    filter: RwLock<Arc<dyn OutputFilter>>,
    provider: Mutex<Option<ProviderBinding>>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("dir", &self.dir)
            .field("tool_path", &self.tool_path)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    pub fn new(dir: impl Into<PathBuf>, executor: Arc<dyn Executor>) -> Self {
        Self {
            dir: dir.into(),
            tool_path: DEFAULT_TOOL_PATH.to_string(),
            executor,
            operation: Operation::new(),
            async_timeout: DEFAULT_ASYNC_TIMEOUT,
            env: RwLock::new(Vec::new()),
            filter: RwLock::new(Arc::new(NoOpFilter)),
            provider: Mutex::new(None),
        }
    }

    pub fn with_tool_path(mut self, tool_path: impl Into<String>) -> Self {
        self.tool_path = tool_path.into();
        self
    }

    pub fn with_async_timeout(mut self, timeout: Duration) -> Self {
        self.async_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tool_path(&self) -> &str {
        &self.tool_path
    }

    pub fn last_operation(&self) -> &Operation {
        &self.operation
    }

    /// Replaces the environment overrides of later invocations
    pub fn set_env(&self, env: Vec<(String, String)>) {
        *self.env.write() = env;
    }

    pub fn env(&self) -> Vec<(String, String)> {
        self.env.read().clone()
    }

    pub fn set_filter(&self, filter: Arc<dyn OutputFilter>) {
        *self.filter.write() = filter;
    }

    /// Replaces the provider binding.
    ///
    /// A previous binding held from a different scheduler is handed back to
    /// that scheduler for stopping.
    pub fn set_provider(&self, binding: Option<ProviderBinding>) {
        let replaced = {
            let mut current = self.provider.lock();
            let same_scheduler = matches!(
                (current.as_ref(), binding.as_ref()),
                (Some(old), Some(new)) if Arc::ptr_eq(&old.scheduler, &new.scheduler)
            );
            let previous = std::mem::replace(&mut *current, binding);
            if same_scheduler { None } else { previous }
        };

        if let Some(old) = replaced {
            if let Err(e) = old.scheduler.stop(&old.handle) {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Cannot stop replaced provider");
            }
        }
    }

    pub fn provider_handle(&self) -> Option<ProviderHandle> {
        self.provider.lock().as_ref().map(|b| b.handle.clone())
    }

    /// Drops the provider binding and asks its scheduler to stop the process
    pub fn release_provider(&self) -> Result<()> {
        match self.provider.lock().take() {
            Some(binding) => binding.scheduler.stop(&binding.handle),
            None => Ok(()),
        }
    }

    fn filter_output(&self, raw: &str) -> String {
        self.filter.read().filter(raw)
    }

    fn ensure_not_running(&self) -> Result<()> {
        let op = self.operation.snapshot();
        if op.is_running() {
            return Err(ExecError::OperationInProgress {
                kind: op.kind,
                started_at: op.start_time,
            });
        }
        Ok(())
    }

    /// Runs the tool in the working directory and returns its filtered
    /// output along with whether it succeeded.
    pub(crate) async fn run_tool(&self, args: &[&str], ctx: &OpContext) -> Result<(bool, String)> {
        let spec = CommandSpec::new(&self.tool_path)
            .args(args.iter().copied())
            .current_dir(&self.dir)
            .envs(self.env());

        let binding = self.provider.lock().clone();
        let _in_use = binding.map(|b| InUseGuard::new(b.in_use));

        tracing::debug!(dir = %self.dir.display(), args = ?args, "Running tool");
        let out = self.executor.run(&spec, ctx).await?;
        let output = self.filter_output(&out.text());
        if !out.success {
            tracing::debug!(
                dir = %self.dir.display(),
                code = ?out.code,
                output = %output,
                "Tool invocation failed"
            );
        }
        Ok((out.success, output))
    }

    async fn run_verb(&self, verb: Verb, ctx: &OpContext) -> Result<String> {
        let (success, output) = self.run_tool(verb.args(), ctx).await?;
        if !success {
            return Err(verb.failure(output));
        }
        Ok(output)
    }

    async fn load_state(&self) -> Result<StateV4> {
        Ok(StateFile::new(&self.dir).load().await?)
    }

    /// Runs apply and blocks until it finishes
    pub async fn apply(&self, ctx: &OpContext) -> Result<ApplyResult> {
        self.ensure_not_running()?;
        self.run_verb(Verb::Apply, ctx).await?;
        let state = self.load_state().await?;
        tracing::info!(dir = %self.dir.display(), id = ?state.id(), "Applied");
        Ok(ApplyResult { state })
    }

    /// Starts apply on a background task.
    ///
    /// Fails immediately when an operation is already running.
    pub fn apply_async(self: &Arc<Self>, callback: Arc<dyn OperationCallback>) -> Result<()> {
        self.spawn_async(Verb::Apply, KIND_APPLY, callback)
    }

    /// Runs destroy and blocks until it finishes
    pub async fn destroy(&self, ctx: &OpContext) -> Result<()> {
        self.ensure_not_running()?;
        self.run_verb(Verb::Destroy, ctx).await?;
        tracing::info!(dir = %self.dir.display(), "Destroyed");
        Ok(())
    }

    /// Starts destroy on a background task.
    ///
    /// A no-op when the last recorded operation is already a destroy.
    pub fn destroy_async(self: &Arc<Self>, callback: Arc<dyn OperationCallback>) -> Result<()> {
        if self.operation.kind() == KIND_DESTROY {
            tracing::debug!(dir = %self.dir.display(), "Destroy already recorded");
            return Ok(());
        }
        self.spawn_async(Verb::Destroy, KIND_DESTROY, callback)
    }

    fn spawn_async(
        self: &Arc<Self>,
        verb: Verb,
        kind: &'static str,
        callback: Arc<dyn OperationCallback>,
    ) -> Result<()> {
        let rt = tokio::runtime::Handle::try_current()
            .map_err(|e| ExecError::Workspace(format!("cannot start {} operation: {}", kind, e)))?;
        if !self.operation.mark_start(kind) {
            let op = self.operation.snapshot();
            return Err(ExecError::OperationInProgress {
                kind: op.kind,
                started_at: op.start_time,
            });
        }

        let ctx = OpContext::with_timeout(self.async_timeout);
        let ws = Arc::clone(self);
        tracing::debug!(dir = %self.dir.display(), kind, "Starting async operation");

        rt.spawn(async move {
            let error = match ws.run_verb(verb, &ctx).await {
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(dir = %ws.dir.display(), kind, error = %e, "Async operation failed");
                    Some(Arc::new(e) as OperationError)
                }
            };
            ws.operation.set_error(error.clone());
            ws.operation.mark_end();
            tracing::debug!(dir = %ws.dir.display(), kind, "Async operation ended");

            if let Err(e) = callback.on_complete(error, &ctx).await {
                tracing::error!(dir = %ws.dir.display(), kind, error = %e, "Async operation callback failed");
            }
        });
        Ok(())
    }

    /// Reconciles the persisted state with the remote object.
    ///
    /// While an async operation is running the resource is reported as
    /// existing without invoking the tool. An ended operation is flushed
    /// once the refresh completes.
    pub async fn refresh(&self, ctx: &OpContext) -> Result<RefreshResult> {
        let op = self.operation.snapshot();
        if op.is_running() {
            return Ok(RefreshResult {
                exists: true,
                async_in_progress: op.kind == KIND_APPLY || op.kind == KIND_DESTROY,
                state: None,
            });
        }
        let flush = op.end_time.is_some();

        let result = self.refresh_state(ctx).await;
        if flush {
            self.operation.flush();
        }
        result
    }

    async fn refresh_state(&self, ctx: &OpContext) -> Result<RefreshResult> {
        self.run_verb(Verb::Refresh, ctx).await?;
        let state = self.load_state().await?;
        Ok(RefreshResult {
            exists: state.exists(),
            async_in_progress: false,
            state: Some(state),
        })
    }

    /// Compares the remote object with the desired configuration
    pub async fn plan(&self, ctx: &OpContext) -> Result<PlanResult> {
        self.ensure_not_running()?;
        let output = self.run_verb(Verb::Plan, ctx).await?;
        let summary = find_change_summary(&output).ok_or(ExecError::ChangeSummaryMissing(output))?;
        tracing::debug!(dir = %self.dir.display(), %summary, "Planned");
        Ok(PlanResult {
            exists: summary.add == 0,
            up_to_date: summary.change == 0,
        })
    }

    /// Seeds the persisted state from the remote object with the external
    /// identifier `id`.
    ///
    /// Without an identifier, or when the remote object does not exist, the
    /// resource is reported as not existing. An existing state instance is
    /// returned as is.
    pub async fn import(
        &self,
        ctx: &OpContext,
        resource_type: &str,
        name: &str,
        id: Option<&str>,
    ) -> Result<ImportResult> {
        self.ensure_not_running()?;
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            tracing::debug!(dir = %self.dir.display(), "No external identifier to import");
            return Ok(ImportResult::default());
        };

        let state_file = StateFile::new(&self.dir);
        if state_file.exists().await {
            let state = state_file.load().await?;
            if state.instance().is_some() {
                return Ok(ImportResult {
                    exists: state.exists(),
                    state: Some(state),
                });
            }
        }

        let address = format!("{}.{}", resource_type, name);
        let (success, output) = self
            .run_tool(&["import", "-input=false", "-lock=false", address.as_str(), id], ctx)
            .await?;
        if !success {
            if output.contains(NON_EXISTENT_REMOTE_OBJECT) {
                tracing::debug!(dir = %self.dir.display(), %address, id, "Remote object does not exist");
                return Ok(ImportResult::default());
            }
            return Err(ExecError::ImportFailed {
                summary: failure_summary(&output),
                output,
            });
        }

        let state = self.load_state().await?;
        tracing::info!(dir = %self.dir.display(), %address, id, "Imported");
        Ok(ImportResult {
            exists: state.exists(),
            state: Some(state),
        })
    }
}
