//! In-process adapters for tests and the demo binary.

pub mod in_memory_store;
pub mod loader;
pub mod relay;

pub use in_memory_store::InMemorySessionStore;
pub use loader::SimulatedLoader;
pub use relay::InMemoryRelay;
