// Domain Layer - Identifiers, wire messages and exit reasons

pub mod args;
pub mod error;
pub mod exit;
pub mod message;

// Re-exports
pub use args::{PlayerUid, PortPair, ProxyArgs};
pub use error::DomainError;
pub use exit::ProxyExit;
pub use message::{classify, Inbound, OpponentEnvelope, PeerEndpoint, PunchRequest};
