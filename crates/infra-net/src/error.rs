// Network adapter errors

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Cannot resolve rendezvous server {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
