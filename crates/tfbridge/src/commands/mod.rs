pub mod apply;
pub mod destroy;
pub mod import;
pub mod plan;
pub mod refresh;

use crate::Target;
use anyhow::Context;
use async_trait::async_trait;
use colored::Colorize;
use parking_lot::Mutex;
use std::sync::Arc;
use tfbridge_config::{RuntimeConfig, SchedulerKind};
use tfbridge_core::{AsyncTracker, OperationError, ResourceId, StateV4, TrackerStore};
use tfbridge_exec::{
    ContentProducer, FileContentProducer, NativeProviderConfig, NoOpProviderScheduler, OpContext,
    OperationCallback, ProcessExecutor, ProviderHandle, ProviderScheduler, Setup,
    SharedProviderScheduler, Workspace, WorkspaceProviderScheduler, WorkspaceStore,
    native_runner_factory,
};
use tokio::sync::oneshot;

/// Everything a command needs, built once from the runtime configuration
pub struct Runtime {
    pub config: RuntimeConfig,
    pub store: WorkspaceStore,
    pub scheduler: Arc<dyn ProviderScheduler>,
    pub trackers: TrackerStore,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let store = WorkspaceStore::new(&config.workspace_root, Arc::new(ProcessExecutor))
            .with_tool_path(&config.terraform_path)
            .with_async_timeout(config.async_timeout());
        let scheduler = build_scheduler(&config);
        Self {
            config,
            store,
            scheduler,
            trackers: TrackerStore::new(),
        }
    }

    /// Prepares the working directory of `target`
    pub async fn open(&self, target: &Target, ctx: &OpContext) -> anyhow::Result<Arc<Workspace>> {
        let id = ResourceId::new(&target.resource);
        let mut producer = FileContentProducer::new(&target.config);
        if let Some(state) = &target.state {
            producer = producer.with_state(state);
        }

        let provider_handle = provider_handle(&producer).await?;
        let setup = Setup {
            env: self
                .config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            provider_handle,
            scheduler: Arc::clone(&self.scheduler),
            sensitive_values: Vec::new(),
        };

        let ws = self
            .store
            .workspace(ctx, &id, &producer, setup)
            .await
            .with_context(|| format!("failed to prepare workspace for {}", id))?;
        println!(
            "{} {}",
            "Workspace:".dimmed(),
            ws.dir().display().to_string().cyan()
        );
        Ok(ws)
    }

    /// Records an observed state on the resource's tracker
    pub fn observe(&self, target: &Target, state: &StateV4) {
        let tracker = self.trackers.tracker(&ResourceId::new(&target.resource));
        tracker.set_tf_id(state.id().map(str::to_string));
        if let Some(attributes) = state.attributes() {
            tracker.set_framework_state(attributes.to_string().into_bytes());
        }
    }
}

fn build_scheduler(config: &RuntimeConfig) -> Arc<dyn ProviderScheduler> {
    let Some(settings) = &config.native_provider else {
        return Arc::new(NoOpProviderScheduler);
    };
    let mut native = NativeProviderConfig::new(&settings.path, &settings.name)
        .with_args(settings.args.iter().cloned())
        .with_reattach_timeout(settings.reattach_timeout());
    native.protocol_version = settings.protocol_version;

    match config.scheduler.kind {
        SchedulerKind::None => Arc::new(NoOpProviderScheduler),
        SchedulerKind::Shared => Arc::new(
            SharedProviderScheduler::new(config.scheduler.ttl, native_runner_factory(native))
                .with_ttl_margin(config.scheduler.ttl_margin),
        ),
        SchedulerKind::Workspace => Arc::new(WorkspaceProviderScheduler::native(native)),
    }
}

/// Handle of the `provider` block of the configuration document
async fn provider_handle(producer: &FileContentProducer) -> anyhow::Result<ProviderHandle> {
    let raw = producer.configuration().await?;
    let doc: serde_json::Value =
        serde_json::from_slice(&raw).context("configuration is not a JSON document")?;
    let provider = doc.get("provider").cloned().unwrap_or_default();
    Ok(ProviderHandle::from_configuration(&provider))
}

/// Forwards the outcome of an async verb to the waiting command
pub struct WaitCallback {
    tracker: Arc<AsyncTracker>,
    tx: Mutex<Option<oneshot::Sender<Option<OperationError>>>>,
}

impl WaitCallback {
    pub fn new(tracker: Arc<AsyncTracker>) -> (Arc<Self>, oneshot::Receiver<Option<OperationError>>) {
        let (tx, rx) = oneshot::channel();
        let callback = Arc::new(Self {
            tracker,
            tx: Mutex::new(Some(tx)),
        });
        (callback, rx)
    }
}

#[async_trait]
impl OperationCallback for WaitCallback {
    async fn on_complete(
        &self,
        error: Option<OperationError>,
        _ctx: &OpContext,
    ) -> tfbridge_exec::Result<()> {
        let op = self.tracker.last_operation();
        op.set_error(error.clone());
        op.mark_end();

        if let Some(tx) = self.tx.lock().take() {
            // the command may have given up waiting
            let _ = tx.send(error);
        }
        Ok(())
    }
}

/// Starts an async verb through `start` and waits for its callback
pub async fn run_async<F>(runtime: &Runtime, target: &Target, kind: &str, start: F) -> anyhow::Result<()>
where
    F: FnOnce(Arc<dyn OperationCallback>) -> tfbridge_exec::Result<()>,
{
    let tracker = runtime.trackers.tracker(&ResourceId::new(&target.resource));
    if !tracker.last_operation().mark_start(kind) {
        anyhow::bail!("{} operation is already running", tracker.last_operation().kind());
    }

    let (callback, rx) = WaitCallback::new(Arc::clone(&tracker));
    if let Err(e) = start(callback) {
        tracker.last_operation().flush();
        return Err(e.into());
    }
    println!("{} {} operation started", "⏳".yellow(), kind);

    let error = rx
        .await
        .context("async operation ended without reporting")?;
    match error {
        Some(e) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            anyhow::bail!("{} operation failed", kind)
        }
        None => {
            println!("{} {} operation finished", "✓".green().bold(), kind);
            Ok(())
        }
    }
}
