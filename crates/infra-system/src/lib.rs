// Reflector Infrastructure - System Adapters
// Implements: ProcessLauncher, proxy binary resolution

pub mod binary_path;
pub mod subprocess_launcher;

pub use binary_path::{expand_path, BinaryResolver};
pub use subprocess_launcher::{exit_report, SubprocessLauncher, SupervisedChild};
