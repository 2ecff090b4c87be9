// Port Layer - Interfaces for external dependencies

pub mod id_provider; // For deterministic testing
pub mod launcher;

// Re-exports
pub use id_provider::IdProvider;
pub use launcher::{ExitReport, LaunchError, LaunchSpec, ProcessLauncher, SupervisedProcess};
