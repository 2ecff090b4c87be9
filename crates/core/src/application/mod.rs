// Application Layer - Punch relay and match session supervision

pub mod constants;
pub mod relay;
pub mod session;
mod shutdown;

// Re-exports
pub use relay::{Relay, RelayAction, RelayConfig, RelayEvent, RelayStats};
pub use session::{EmulatorPlan, EndedBy, MatchSession, SessionOutcome, SessionPlan};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
