//! tfbridge core
//!
//! In-memory bookkeeping shared by every reconciliation pass of a controller
//! that drives a declarative provisioning tool:
//!
//! - [`Operation`]: "is a provisioning action in flight for this resource"
//! - [`AsyncTracker`] / [`TrackerStore`]: one tracker per resource identity,
//!   holding the operation and the last known provider state
//! - [`StateV4`]: the persisted state document of a working directory
//! - [`diagnostics`]: parsing of the tool's structured log
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 reconciler                   │
//! └───────┬──────────────────────────┬───────────┘
//!         │                          │
//! ┌───────▼────────┐        ┌────────▼─────────┐
//! │ tfbridge-core  │        │  tfbridge-exec   │
//! │ TrackerStore   │◄───────┤  WorkspaceStore  │
//! │ Operation      │        │  Workspace       │
//! │ StateV4        │        │  Schedulers      │
//! └────────────────┘        └──────────────────┘
//! ```

pub mod diagnostics;
pub mod error;
pub mod operation;
pub mod state;
pub mod tracker;

// Re-exports
pub use diagnostics::{ChangeSummary, Diagnostic};
pub use error::{CoreError, Result};
pub use operation::{Operation, OperationError, OperationSnapshot};
pub use state::{InstanceObjectStateV4, ResourceStateV4, STATE_FILE, StateFile, StateV4};
pub use tracker::{AsyncTracker, CachedState, InstanceState, ResourceId, StateOrigin, TrackerStore};
