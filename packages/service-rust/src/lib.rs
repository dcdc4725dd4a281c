//! `keyop` service: dispatches key-management operations onto a bounded
//! worker pool and streams their progress back to the caller.

pub mod service;
pub mod storage;
pub mod traits;

pub use service::{
    CancellationToken, DispatchError, DispatchHandle, Dispatcher, DispatcherConfig,
    ExclusiveDispatcher, Operation, OperationContext, OperationDeps, OperationRegistry,
    ReplyTarget,
};
pub use storage::MemoryKeyRepository;
pub use traits::{CryptoEngine, KeyRepository, Keyserver, ProofVerifier};

#[cfg(test)]
mod test_utils;
