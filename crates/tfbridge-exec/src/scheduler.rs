//! Native provider scheduling
//!
//! Three interchangeable policies decide which native provider process a tool
//! invocation reattaches to:
//!
//! - [`NoOpProviderScheduler`]: no shared process, every invocation launches
//!   its own plugin
//! - [`SharedProviderScheduler`]: one process per [`ProviderHandle`], reused
//!   across resources until its reuse budget (ttl) is spent
//! - [`WorkspaceProviderScheduler`]: one dedicated process for a workspace,
//!   torn down once the last borrower releases it

use crate::error::{ExecError, Result};
use crate::runner::{NativeProviderConfig, NativeProviderRunner, ProviderRunner};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

pub const DEFAULT_TTL_MARGIN: f64 = 0.1;

/// Key of a configuration-equivalence class of native provider invocations.
///
/// Resources whose provider configuration is identical share a handle and may
/// share a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ProviderHandle(String);

impl ProviderHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Derives a handle from the provider configuration
    pub fn from_configuration(config: &serde_json::Value) -> Self {
        let digest = Sha256::digest(config.to_string().as_bytes());
        Self(
            digest
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<String>(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The empty handle never identifies a provider
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }
}

impl std::fmt::Display for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Borrow token for a scheduled provider process
pub trait InUse: Send + Sync {
    fn increment(&self);
    fn decrement(&self);
}

/// Increments on creation and decrements on drop
pub struct InUseGuard(Arc<dyn InUse>);

impl InUseGuard {
    pub fn new(in_use: Arc<dyn InUse>) -> Self {
        in_use.increment();
        Self(in_use)
    }
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

/// A provider process handed out by a scheduler
#[derive(Clone)]
pub struct ScheduledProvider {
    pub in_use: Arc<dyn InUse>,
    /// Empty when there is no process to reattach to
    pub reattach_config: String,
}

#[async_trait]
pub trait ProviderScheduler: Send + Sync {
    async fn start(&self, handle: &ProviderHandle) -> Result<ScheduledProvider>;
    fn stop(&self, handle: &ProviderHandle) -> Result<()>;
}

/// Creates the runner for a new scheduler entry
pub type RunnerFactory = Arc<dyn Fn(&ProviderHandle) -> Arc<dyn ProviderRunner> + Send + Sync>;

/// Factory launching [`NativeProviderRunner`]s from one configuration
pub fn native_runner_factory(config: NativeProviderConfig) -> RunnerFactory {
    Arc::new(move |_handle: &ProviderHandle| {
        Arc::new(NativeProviderRunner::new(config.clone())) as Arc<dyn ProviderRunner>
    })
}

struct NoOpInUse;

impl InUse for NoOpInUse {
    fn increment(&self) {}
    fn decrement(&self) {}
}

/// Scheduler that manages no process at all
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProviderScheduler;

#[async_trait]
impl ProviderScheduler for NoOpProviderScheduler {
    async fn start(&self, _handle: &ProviderHandle) -> Result<ScheduledProvider> {
        Ok(ScheduledProvider {
            in_use: Arc::new(NoOpInUse),
            reattach_config: String::new(),
        })
    }

    fn stop(&self, _handle: &ProviderHandle) -> Result<()> {
        Ok(())
    }
}

struct SchedulerEntry {
    runner: Arc<dyn ProviderRunner>,
    in_use: u64,
    invocation_count: u64,
    generation: u64,
}

#[derive(Default)]
struct Entries {
    by_handle: HashMap<ProviderHandle, SchedulerEntry>,
    next_generation: u64,
}

/// Borrow counters of a shared scheduler entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStats {
    pub in_use: u64,
    pub invocation_count: u64,
}

enum Decision {
    Reuse(Arc<dyn ProviderRunner>, u64),
    Replace,
    Create,
}

/// Shares one process per handle across resources under a reuse budget.
///
/// An entry serves at most `ttl` borrows. Once spent it is replaced on the
/// next request, unless it is still borrowed: then it keeps serving up to
/// `ttl * (1 + ttl_margin)` borrows, after which requests are refused with
/// [`ExecError::ReuseBudgetExceeded`] until the borrowers drain.
pub struct SharedProviderScheduler {
    entries: Arc<Mutex<Entries>>,
    start_lock: tokio::sync::Mutex<()>,
    factory: RunnerFactory,
    ttl: u64,
    ttl_margin: f64,
}

impl SharedProviderScheduler {
    pub fn new(ttl: u64, factory: RunnerFactory) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries::default())),
            start_lock: tokio::sync::Mutex::new(()),
            factory,
            ttl,
            ttl_margin: DEFAULT_TTL_MARGIN,
        }
    }

    pub fn with_ttl_margin(mut self, ttl_margin: f64) -> Self {
        self.ttl_margin = ttl_margin;
        self
    }

    pub fn entry_stats(&self, handle: &ProviderHandle) -> Option<EntryStats> {
        self.entries
            .lock()
            .by_handle
            .get(handle)
            .map(|e| EntryStats {
                in_use: e.in_use,
                invocation_count: e.invocation_count,
            })
    }

    fn budget_exceeded(&self, invocation_count: u64) -> bool {
        (invocation_count + 1) as f64 > self.ttl as f64 * (1.0 + self.ttl_margin)
    }

    fn in_use(&self, handle: &ProviderHandle, generation: u64) -> Arc<dyn InUse> {
        Arc::new(SharedInUse {
            entries: Arc::clone(&self.entries),
            handle: handle.clone(),
            generation,
        })
    }
}

#[async_trait]
impl ProviderScheduler for SharedProviderScheduler {
    async fn start(&self, handle: &ProviderHandle) -> Result<ScheduledProvider> {
        let _serial = self.start_lock.lock().await;

        let (runner, generation) = {
            let mut entries = self.entries.lock();
            let decision = match entries.by_handle.get(handle) {
                Some(e) if e.invocation_count < self.ttl || e.in_use > 0 => {
                    if self.budget_exceeded(e.invocation_count) {
                        tracing::debug!(
                            %handle,
                            ttl = self.ttl,
                            ttl_margin = self.ttl_margin,
                            invocation_count = e.invocation_count,
                            "Reuse budget has been exceeded, caller will need to retry"
                        );
                        return Err(ExecError::ReuseBudgetExceeded {
                            handle: handle.to_string(),
                            invocation_count: e.invocation_count,
                            ttl: self.ttl,
                        });
                    }
                    Decision::Reuse(Arc::clone(&e.runner), e.generation)
                }
                Some(_) => Decision::Replace,
                None => Decision::Create,
            };

            match decision {
                Decision::Reuse(runner, generation) => {
                    tracing::debug!(%handle, "Reusing the provider runner");
                    (runner, generation)
                }
                Decision::Replace | Decision::Create => {
                    if let Some(expired) = entries.by_handle.remove(handle) {
                        tracing::debug!(
                            %handle,
                            invocation_count = expired.invocation_count,
                            "The provider runner has expired, stopping it"
                        );
                        if let Err(e) = expired.runner.stop() {
                            tracing::warn!(%handle, error = %e, "Cannot stop expired provider runner");
                        }
                    }
                    entries.next_generation += 1;
                    let generation = entries.next_generation;
                    let runner = (self.factory)(handle);
                    entries.by_handle.insert(
                        handle.clone(),
                        SchedulerEntry {
                            runner: Arc::clone(&runner),
                            in_use: 0,
                            invocation_count: 0,
                            generation,
                        },
                    );
                    tracing::debug!(%handle, ttl = self.ttl, "Starting new shared provider");
                    (runner, generation)
                }
            }
        };

        let reattach_config = runner.start().await?;
        Ok(ScheduledProvider {
            in_use: self.in_use(handle, generation),
            reattach_config,
        })
    }

    fn stop(&self, _handle: &ProviderHandle) -> Result<()> {
        // entries are only retired through their reuse budget
        Ok(())
    }
}

/// Token adjusting one generation of a shared entry.
/// Tokens of a replaced entry no longer affect its successor.
struct SharedInUse {
    entries: Arc<Mutex<Entries>>,
    handle: ProviderHandle,
    generation: u64,
}

impl InUse for SharedInUse {
    fn increment(&self) {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.by_handle.get_mut(&self.handle) {
            if e.generation == self.generation {
                e.in_use += 1;
                e.invocation_count += 1;
            }
        }
    }

    fn decrement(&self) {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.by_handle.get_mut(&self.handle) {
            if e.generation == self.generation && e.in_use > 0 {
                e.in_use -= 1;
            }
        }
    }
}

/// Reference counter whose holders can wait for it to drain
pub struct RefCounter {
    count: watch::Sender<u64>,
}

impl Default for RefCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RefCounter {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    pub fn count(&self) -> u64 {
        *self.count.borrow()
    }

    /// Resolves once the count is zero
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl InUse for RefCounter {
    fn increment(&self) {
        self.count.send_modify(|count| *count += 1);
    }

    fn decrement(&self) {
        self.count.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Dedicates one process to a workspace for its lifetime.
///
/// [`ProviderScheduler::stop`] only schedules termination: the process is
/// stopped once every borrower has released it. A borrower that never
/// releases keeps the process alive indefinitely.
pub struct WorkspaceProviderScheduler {
    runner: Arc<dyn ProviderRunner>,
    in_use: Arc<RefCounter>,
}

impl WorkspaceProviderScheduler {
    pub fn new(runner: Arc<dyn ProviderRunner>) -> Self {
        Self {
            runner,
            in_use: Arc::new(RefCounter::new()),
        }
    }

    pub fn native(config: NativeProviderConfig) -> Self {
        Self::new(Arc::new(NativeProviderRunner::new(config)))
    }

    pub fn borrowers(&self) -> u64 {
        self.in_use.count()
    }
}

#[async_trait]
impl ProviderScheduler for WorkspaceProviderScheduler {
    async fn start(&self, _handle: &ProviderHandle) -> Result<ScheduledProvider> {
        tracing::debug!("Starting the workspace provider runner");
        let reattach_config = self.runner.start().await?;
        Ok(ScheduledProvider {
            in_use: Arc::clone(&self.in_use) as Arc<dyn InUse>,
            reattach_config,
        })
    }

    fn stop(&self, _handle: &ProviderHandle) -> Result<()> {
        let rt = tokio::runtime::Handle::try_current()
            .map_err(|e| ExecError::Workspace(format!("cannot schedule provider stop: {}", e)))?;
        tracing::debug!(borrowers = self.in_use.count(), "Scheduling provider runner stop");

        let runner = Arc::clone(&self.runner);
        let in_use = Arc::clone(&self.in_use);
        rt.spawn(async move {
            in_use.wait_idle().await;
            tracing::debug!("Provider runner not in use, stopping");
            if let Err(e) = runner.stop() {
                tracing::info!(error = %e, "Failed to stop provider runner");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;
    use std::time::Duration;

    fn counting_factory() -> (RunnerFactory, Arc<Mutex<Vec<Arc<FakeRunner>>>>) {
        let created = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&created);
        let factory: RunnerFactory = Arc::new(move |_handle: &ProviderHandle| {
            let mut created = sink.lock();
            let runner = Arc::new(FakeRunner::new(format!("reattach-{}", created.len())));
            created.push(Arc::clone(&runner));
            runner as Arc<dyn ProviderRunner>
        });
        (factory, created)
    }

    #[test]
    fn test_handle_from_configuration() {
        let a = ProviderHandle::from_configuration(&serde_json::json!({"region": "us-east-1", "profile": "x"}));
        let b = ProviderHandle::from_configuration(&serde_json::json!({"profile": "x", "region": "us-east-1"}));
        let c = ProviderHandle::from_configuration(&serde_json::json!({"region": "eu-west-1"}));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is_valid());
        assert_eq!(a.as_str().len(), 64);
        assert!(!ProviderHandle::default().is_valid());
    }

    #[tokio::test]
    async fn test_noop_scheduler() {
        let scheduler = NoOpProviderScheduler;
        let provider = scheduler.start(&ProviderHandle::new("h")).await.unwrap();
        assert!(provider.reattach_config.is_empty());
        provider.in_use.increment();
        provider.in_use.decrement();
        assert!(scheduler.stop(&ProviderHandle::new("h")).is_ok());
    }

    #[tokio::test]
    async fn test_shared_reuses_within_ttl() {
        let (factory, created) = counting_factory();
        let scheduler = SharedProviderScheduler::new(2, factory);
        let handle = ProviderHandle::new("aws");

        let first = scheduler.start(&handle).await.unwrap();
        first.in_use.increment();
        let second = scheduler.start(&handle).await.unwrap();
        second.in_use.increment();

        assert_eq!(first.reattach_config, "reattach-0");
        assert_eq!(second.reattach_config, "reattach-0");
        assert_eq!(created.lock().len(), 1);
        assert_eq!(
            scheduler.entry_stats(&handle),
            Some(EntryStats {
                in_use: 2,
                invocation_count: 2
            })
        );
    }

    #[tokio::test]
    async fn test_shared_refuses_past_budget_while_borrowed() {
        let (factory, created) = counting_factory();
        let scheduler = SharedProviderScheduler::new(2, factory);
        let handle = ProviderHandle::new("aws");

        let first = scheduler.start(&handle).await.unwrap();
        first.in_use.increment();
        let second = scheduler.start(&handle).await.unwrap();
        second.in_use.increment();

        let err = scheduler.start(&handle).await.err().unwrap();
        assert!(err.is_reuse_budget_exceeded());
        // the borrowed process was neither stopped nor replaced
        assert_eq!(created.lock().len(), 1);
        assert_eq!(created.lock()[0].stops(), 0);
    }

    #[tokio::test]
    async fn test_shared_margin_allows_overshoot() {
        let (factory, created) = counting_factory();
        let scheduler = SharedProviderScheduler::new(10, factory).with_ttl_margin(0.1);
        let handle = ProviderHandle::new("aws");

        let mut borrowed = Vec::new();
        for _ in 0..11 {
            let provider = scheduler.start(&handle).await.unwrap();
            provider.in_use.increment();
            borrowed.push(provider);
        }
        assert_eq!(created.lock().len(), 1);
        assert_eq!(scheduler.entry_stats(&handle).unwrap().invocation_count, 11);

        assert!(scheduler.start(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_shared_replaces_expired_idle_entry() {
        let (factory, created) = counting_factory();
        let scheduler = SharedProviderScheduler::new(2, factory);
        let handle = ProviderHandle::new("aws");

        for _ in 0..2 {
            let provider = scheduler.start(&handle).await.unwrap();
            provider.in_use.increment();
            provider.in_use.decrement();
        }
        let stale = scheduler.start(&handle).await.unwrap();

        assert_eq!(stale.reattach_config, "reattach-1");
        assert_eq!(created.lock().len(), 2);
        assert_eq!(created.lock()[0].stops(), 1);
        assert_eq!(
            scheduler.entry_stats(&handle),
            Some(EntryStats {
                in_use: 0,
                invocation_count: 0
            })
        );
    }

    #[tokio::test]
    async fn test_stale_token_does_not_touch_new_entry() {
        let (factory, _created) = counting_factory();
        let scheduler = SharedProviderScheduler::new(1, factory);
        let handle = ProviderHandle::new("aws");

        let old = scheduler.start(&handle).await.unwrap();
        old.in_use.increment();
        old.in_use.decrement();
        let _new = scheduler.start(&handle).await.unwrap();

        old.in_use.increment();
        assert_eq!(scheduler.entry_stats(&handle).unwrap().invocation_count, 0);
    }

    #[tokio::test]
    async fn test_shared_decrement_below_zero_is_ignored() {
        let (factory, _created) = counting_factory();
        let scheduler = SharedProviderScheduler::new(5, factory);
        let handle = ProviderHandle::new("aws");

        let provider = scheduler.start(&handle).await.unwrap();
        provider.in_use.decrement();
        provider.in_use.decrement();
        assert_eq!(scheduler.entry_stats(&handle).unwrap().in_use, 0);

        provider.in_use.increment();
        assert_eq!(scheduler.entry_stats(&handle).unwrap().in_use, 1);
    }

    #[tokio::test]
    async fn test_shared_start_failure_propagates() {
        let factory: RunnerFactory =
            Arc::new(|_: &ProviderHandle| Arc::new(FakeRunner::failing()) as Arc<dyn ProviderRunner>);
        let scheduler = SharedProviderScheduler::new(5, factory);

        let err = scheduler.start(&ProviderHandle::new("aws")).await.err().unwrap();
        assert!(matches!(err, ExecError::ProviderExited(_)));
    }

    #[tokio::test]
    async fn test_workspace_stop_waits_for_borrowers() {
        let runner = Arc::new(FakeRunner::new("reattach"));
        let scheduler = WorkspaceProviderScheduler::new(Arc::clone(&runner) as Arc<dyn ProviderRunner>);
        let handle = ProviderHandle::default();

        let first = scheduler.start(&handle).await.unwrap();
        let second = scheduler.start(&handle).await.unwrap();
        assert_eq!(first.reattach_config, "reattach");
        first.in_use.increment();
        second.in_use.increment();

        scheduler.stop(&handle).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.stops(), 0);

        first.in_use.decrement();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.stops(), 0);
        assert_eq!(scheduler.borrowers(), 1);

        second.in_use.decrement();
        for _ in 0..100 {
            if runner.stops() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runner.stops(), 1);
    }

    #[tokio::test]
    async fn test_workspace_stop_when_idle() {
        let runner = Arc::new(FakeRunner::new("reattach"));
        let scheduler = WorkspaceProviderScheduler::new(Arc::clone(&runner) as Arc<dyn ProviderRunner>);

        scheduler.start(&ProviderHandle::default()).await.unwrap();
        scheduler.stop(&ProviderHandle::default()).unwrap();
        for _ in 0..100 {
            if runner.stops() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runner.stops(), 1);
    }

    #[tokio::test]
    async fn test_in_use_guard() {
        let counter = Arc::new(RefCounter::new());
        {
            let _guard = InUseGuard::new(Arc::clone(&counter) as Arc<dyn InUse>);
            assert_eq!(counter.count(), 1);
        }
        assert_eq!(counter.count(), 0);
        counter.wait_idle().await;
    }
}
