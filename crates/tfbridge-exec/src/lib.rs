//! tfbridge execution layer
//!
//! Runs the provisioning tool against per-resource working directories and
//! manages the native provider processes those invocations reattach to.
//!
//! # Components
//!
//! - [`Workspace`]: apply, destroy, refresh, plan and import in one
//!   directory, blocking or on a background task
//! - [`WorkspaceStore`]: one workspace per resource, prepared before use
//! - [`NativeProviderRunner`]: supervises one provider plugin process
//! - [`SharedProviderScheduler`], [`WorkspaceProviderScheduler`] and
//!   [`NoOpProviderScheduler`]: decide which process an invocation uses
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tfbridge_core::ResourceId;
//! use tfbridge_exec::{FileContentProducer, OpContext, ProcessExecutor, Setup, WorkspaceStore};
//!
//! let store = WorkspaceStore::new("/tmp/tfbridge", Arc::new(ProcessExecutor));
//! let producer = FileContentProducer::new("main.tf.json");
//! let ctx = OpContext::background();
//!
//! let ws = store
//!     .workspace(&ctx, &ResourceId::new("vpc"), &producer, Setup::default())
//!     .await?;
//! let plan = ws.plan(&ctx).await?;
//! if !plan.exists {
//!     ws.apply(&ctx).await?;
//! }
//! ```

pub mod context;
pub mod error;
pub mod executor;
pub mod filter;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use context::OpContext;
pub use error::{ExecError, Result};
pub use executor::{CommandOutput, CommandSpec, Executor, ProcessExecutor};
pub use filter::{NoOpFilter, OutputFilter, RedactFilter};
pub use runner::{NativeProviderConfig, NativeProviderRunner, ProviderRunner};
pub use scheduler::{
    InUse, InUseGuard, NoOpProviderScheduler, ProviderHandle, ProviderScheduler, RunnerFactory,
    ScheduledProvider, SharedProviderScheduler, WorkspaceProviderScheduler, native_runner_factory,
};
pub use store::{ContentProducer, FileContentProducer, Setup, WorkspaceStore};
pub use workspace::{
    ApplyResult, ImportResult, OperationCallback, PlanResult, ProviderBinding, RefreshResult,
    Workspace,
};
