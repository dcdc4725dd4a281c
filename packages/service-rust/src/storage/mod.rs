//! Key repository implementations.

pub mod memory;

pub use memory::MemoryKeyRepository;
