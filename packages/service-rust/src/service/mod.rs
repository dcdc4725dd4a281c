//! Operation dispatch and progress reporting.
//!
//! 1. **Dispatch** (`dispatcher`): accept a request, assign a dispatch id,
//!    create its cancellation token and progress channel
//! 2. **Resolution** (`registry`): exhaustive request kind -> operation table
//! 3. **Execution** (`executor`): bounded worker pool, panic isolation,
//!    exactly one terminal event per dispatch
//! 4. **Operations** (`domain`): the built-in operation per request kind
//! 5. **Background work** (`worker`): periodic key synchronization

pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod executor;
pub mod lifecycle;
pub mod operation;
pub mod progress;
pub mod registry;
pub mod worker;

pub use cancel::{CancellationToken, Cancelled};
pub use config::DispatcherConfig;
pub use dispatcher::{DispatchHandle, Dispatcher, ExclusiveDispatcher};
pub use domain::OperationDeps;
pub use executor::OperationExecutor;
pub use lifecycle::DispatcherState;
pub use operation::{DispatchError, Operation, OperationContext};
pub use progress::{
    DeliveryError, EncodedReplyTarget, LogReplyTarget, ProgressChannel, ProgressReporter,
    ReplyTarget,
};
pub use registry::{BoundOperation, OperationRegistry};
pub use worker::{BackgroundRunnable, BackgroundWorker, KeySyncRunnable, MaintenanceTask};
