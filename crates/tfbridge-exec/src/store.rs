//! Per-resource workspace cache

use crate::context::OpContext;
use crate::error::{ExecError, Result};
use crate::executor::Executor;
use crate::filter;
use crate::runner::ENV_REATTACH_PROVIDERS;
use crate::scheduler::{NoOpProviderScheduler, ProviderHandle, ProviderScheduler};
use crate::workspace::{DEFAULT_ASYNC_TIMEOUT, DEFAULT_TOOL_PATH, ProviderBinding, Workspace};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tfbridge_core::diagnostics::failure_summary;
use tfbridge_core::{ResourceId, StateFile};
use tokio::fs;

pub const MAIN_CONFIGURATION_FILE: &str = "main.tf.json";
pub const STATE_LOCK_INFO_FILE: &str = ".terraform.tfstate.lock.info";
pub const PROVIDER_LOCK_FILE: &str = ".terraform.lock.hcl";

/// Supplies the documents a working directory is built from
#[async_trait]
pub trait ContentProducer: Send + Sync {
    /// The configuration document written as `main.tf.json`
    async fn configuration(&self) -> Result<Vec<u8>>;

    /// Seed state, written only when the directory has none yet
    async fn state(&self) -> Result<Option<Vec<u8>>>;
}

/// [`ContentProducer`] reading both documents from files
#[derive(Debug, Clone)]
pub struct FileContentProducer {
    configuration: PathBuf,
    state: Option<PathBuf>,
}

impl FileContentProducer {
    pub fn new(configuration: impl Into<PathBuf>) -> Self {
        Self {
            configuration: configuration.into(),
            state: None,
        }
    }

    pub fn with_state(mut self, state: impl Into<PathBuf>) -> Self {
        self.state = Some(state.into());
        self
    }
}

#[async_trait]
impl ContentProducer for FileContentProducer {
    async fn configuration(&self) -> Result<Vec<u8>> {
        fs::read(&self.configuration).await.map_err(|e| {
            ExecError::Workspace(format!(
                "cannot read configuration {}: {}",
                self.configuration.display(),
                e
            ))
        })
    }

    async fn state(&self) -> Result<Option<Vec<u8>>> {
        match &self.state {
            Some(path) => Ok(Some(fs::read(path).await?)),
            None => Ok(None),
        }
    }
}

/// Per-call wiring of a workspace
#[derive(Clone)]
pub struct Setup {
    /// Added to every tool invocation
    pub env: Vec<(String, String)>,
    pub provider_handle: ProviderHandle,
    pub scheduler: Arc<dyn ProviderScheduler>,
    /// Values redacted from tool output
    pub sensitive_values: Vec<String>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            env: Vec::new(),
            provider_handle: ProviderHandle::default(),
            scheduler: Arc::new(NoOpProviderScheduler),
            sensitive_values: Vec::new(),
        }
    }
}

/// Creates and caches one [`Workspace`] per resource
pub struct WorkspaceStore {
    root: PathBuf,
    executor: Arc<dyn Executor>,
    tool_path: String,
    async_timeout: Duration,
    workspaces: Mutex<HashMap<ResourceId, Arc<Workspace>>>,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>, executor: Arc<dyn Executor>) -> Self {
        Self {
            root: root.into(),
            executor,
            tool_path: DEFAULT_TOOL_PATH.to_string(),
            async_timeout: DEFAULT_ASYNC_TIMEOUT,
            workspaces: Mutex::new(HashMap::new()),
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

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Working directory of `id` under the store root.
    ///
    /// The id must be a single plain path segment, so the directory can
    /// never resolve to the root itself or outside it.
    pub fn dir_for(&self, id: &ResourceId) -> Result<PathBuf> {
        let raw = id.as_str();
        let mut components = Path::new(raw).components();
        let single_segment = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_segment || raw.contains(['/', '\\']) {
            return Err(ExecError::Workspace(format!(
                "invalid resource id {:?}: must be a single path segment",
                raw
            )));
        }
        Ok(self.root.join(raw))
    }

    pub fn get(&self, id: &ResourceId) -> Option<Arc<Workspace>> {
        self.workspaces.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.workspaces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.lock().is_empty()
    }

    fn get_or_create(&self, id: &ResourceId, dir: &Path) -> Arc<Workspace> {
        let mut workspaces = self.workspaces.lock();
        let ws = workspaces.entry(id.clone()).or_insert_with(|| {
            Arc::new(
                Workspace::new(dir, Arc::clone(&self.executor))
                    .with_tool_path(&self.tool_path)
                    .with_async_timeout(self.async_timeout),
            )
        });
        Arc::clone(ws)
    }

    /// Returns the workspace of `id`, preparing its directory for the next
    /// invocation.
    ///
    /// A workspace whose operation is still running is returned untouched.
    /// Otherwise the configuration is rewritten, the seed state is written
    /// if none exists, a stale lock left by an interrupted run is removed,
    /// a native provider is borrowed from the scheduler and the directory
    /// is initialised when it has never been.
    pub async fn workspace(
        &self,
        ctx: &OpContext,
        id: &ResourceId,
        producer: &dyn ContentProducer,
        setup: Setup,
    ) -> Result<Arc<Workspace>> {
        let dir = self.dir_for(id)?;
        fs::create_dir_all(&dir).await?;

        let ws = self.get_or_create(id, &dir);
        if ws.last_operation().is_running() {
            tracing::debug!(resource = %id, "Operation is running, reusing workspace as is");
            return Ok(ws);
        }

        fs::write(dir.join(MAIN_CONFIGURATION_FILE), producer.configuration().await?).await?;
        let state_file = StateFile::new(&dir);
        if !state_file.exists().await {
            if let Some(state) = producer.state().await? {
                state_file.write_raw(&state).await?;
            }
        }

        match fs::remove_file(dir.join(STATE_LOCK_INFO_FILE)).await {
            Ok(()) => tracing::debug!(resource = %id, "Removed stale state lock"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let provider = setup.scheduler.start(&setup.provider_handle).await?;
        let mut env = setup.env;
        if !provider.reattach_config.is_empty() {
            env.push((ENV_REATTACH_PROVIDERS.to_string(), provider.reattach_config));
        }
        ws.set_env(env);
        ws.set_filter(filter::for_secrets(setup.sensitive_values));
        ws.set_provider(Some(ProviderBinding {
            handle: setup.provider_handle,
            in_use: provider.in_use,
            scheduler: setup.scheduler,
        }));

        if !fs::try_exists(dir.join(PROVIDER_LOCK_FILE)).await? {
            tracing::info!(resource = %id, dir = %dir.display(), "Initializing workspace");
            let (success, output) = ws.run_tool(&["init", "-input=false"], ctx).await?;
            if !success {
                return Err(ExecError::Workspace(format!(
                    "init failed: {}",
                    failure_summary(&output)
                )));
            }
        }

        Ok(ws)
    }

    /// Deletes the working directory of `id` and forgets its workspace.
    ///
    /// The provider borrowed by the workspace is handed back to its
    /// scheduler for stopping.
    pub async fn remove(&self, id: &ResourceId) -> Result<()> {
        let dir = self.dir_for(id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let removed = self.workspaces.lock().remove(id);
        if let Some(ws) = removed {
            if let Err(e) = ws.release_provider() {
                tracing::warn!(resource = %id, error = %e, "Cannot stop workspace provider");
            }
        }
        tracing::debug!(resource = %id, dir = %dir.display(), "Removed workspace");
        Ok(())
    }
}
