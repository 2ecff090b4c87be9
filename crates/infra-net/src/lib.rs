// Reflector Infrastructure - Network Adapter
// Drives the punch relay over real UDP sockets

pub mod error;
pub mod punch;

pub use error::NetError;
pub use punch::{BoundProxy, ProxyRunReport, PunchProxy};
