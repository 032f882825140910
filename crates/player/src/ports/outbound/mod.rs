//! Outbound ports - Interfaces for external services
//!
//! These ports define the contracts that infrastructure adapters must implement,
//! allowing the session engine to talk to the session store, the relay and the
//! resource loader without depending on concrete implementations.

pub mod relay_port;
pub mod resource_loader_port;
pub mod session_store_port;

pub use relay_port::{JoinEndpoint, RelayError, RelayPort};
pub use resource_loader_port::{LoadError, ResourceLoaderPort};
pub use session_store_port::{SessionStorePort, StoreError, StoreSubscription};

#[cfg(any(test, feature = "testing"))]
pub use relay_port::MockRelayPort;
#[cfg(any(test, feature = "testing"))]
pub use resource_loader_port::MockResourceLoaderPort;
#[cfg(any(test, feature = "testing"))]
pub use session_store_port::MockSessionStorePort;
