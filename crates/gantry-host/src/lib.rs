//! Plugin host runtime for Gantry.
//!
//! This crate composes the host's moving parts:
//!
//! - **Registry**: authoritative plugin instances and lifecycle states
//! - **Event bus**: priority-ordered typed dispatch with a bounded pool
//! - **Scheduler**: delayed, periodic, and immediate background tasks
//! - **Extension manager**: ordinal-sorted extension points
//! - **Loader**: staged bundle copies in isolated namespaces
//! - **Plugin manager**: discovery → resolution → load → enable
//! - **Hot reload**: phased, state-preserving code swap with rollback
//!
//! # Example
//!
//! ```rust,ignore
//! use gantry_host::{ManagerOptions, PluginManager};
//!
//! #[tokio::main]
//! async fn main() -> gantry_core::Result<()> {
//!     let manager = PluginManager::new(ManagerOptions::new("./plugins"));
//!     manager.load_all().await?;
//!     manager.enable_all().await;
//!     // ...
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod event_bus;
pub mod extensions;
pub mod hot_reload;
pub mod loader;
pub mod manager;
pub mod namespace;
pub mod registry;
pub mod scheduler;
pub mod snapshot;
pub mod timing;

pub use api::{HotReloadable, Plugin, PluginContext, Stateful};
pub use event_bus::{
    ApplicationEvent, EventBase, EventBus, EventPriority, HandlerRegistration,
};
pub use extensions::{Extension, ExtensionInfo, ExtensionManager};
pub use hot_reload::{HotReloadOrchestrator, ReloadOptions, ReloadPhase, ReloadReport};
pub use loader::{PluginLoader, TempStats};
pub use manager::{LoadReport, ManagerOptions, PluginManager};
pub use namespace::{PluginCtor, PluginNamespace};
pub use registry::{PluginRegistry, RegistryStatus};
pub use scheduler::{AsyncHandle, PluginScheduler, SchedulerStats, TaskId, TaskScheduler};
pub use snapshot::{SnapshotStore, StateSnapshot};
pub use timing::LifecycleTimings;

/// Event bus worker pool size.
pub const EVENT_POOL_SIZE: usize = 4;

/// Scheduler pool size for delayed and periodic tasks.
pub const SCHEDULED_POOL_SIZE: usize = 4;

/// Scheduler pool size for immediate background tasks.
pub const ASYNC_POOL_SIZE: usize = 8;

/// Concurrent hot reloads allowed across distinct plugins.
pub const RELOAD_POOL_SIZE: usize = 3;
