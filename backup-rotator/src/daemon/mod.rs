//! Run lifecycle: the single-instance guard and interrupt cleanup.

pub mod cleanup;
pub mod guard;
pub mod shutdown;

pub use cleanup::CleanupRegistry;
pub use guard::ExecutionGuard;
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};
