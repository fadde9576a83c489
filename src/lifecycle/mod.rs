//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     MeshConfig → build components → start workers (workers.rs)
//!
//! Shutdown (shutdown.rs):
//!     Signal received (signals.rs) → broadcast → workers exit → join with grace
//!
//! Reload:
//!     ConfigWatcher → Mesh::apply_reload → feature flags swapped
//! ```

pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod workers;

pub use shutdown::Shutdown;
pub use startup::{Mesh, StartupError};
pub use workers::{spawn_periodic, WorkerGroup};
