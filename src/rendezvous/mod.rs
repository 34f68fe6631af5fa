// Rendezvous module
//
// Startup barrier on the master port. Workers join with their rank and the
// config digest; once they are released the port belongs to the trainers.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::join;
pub use protocol::Message;
pub use server::RendezvousServer;

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("port {port} on {addr} is already in use")]
    PortConflict { addr: String, port: u16 },

    #[error("failed to bind rendezvous endpoint {addr}:{port}: {source}")]
    Bind {
        addr: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("rendezvous timed out after {waited:?}: {joined}/{expected} workers joined")]
    Timeout {
        joined: usize,
        expected: usize,
        waited: Duration,
    },

    #[error("barrier was not released within {waited:?}")]
    NoRelease { waited: Duration },

    #[error("rank {rank} is outside a world of {world_size} workers")]
    RankOutOfRange { rank: usize, world_size: usize },

    #[error("rank {rank} expects {reported} workers but the launcher started {expected}")]
    WorldSizeMismatch {
        rank: usize,
        reported: usize,
        expected: usize,
    },

    #[error("rank {rank} was launched with a different configuration")]
    DigestMismatch { rank: usize },

    #[error("rank {0} joined twice")]
    DuplicateRank(usize),

    #[error("rendezvous aborted: {0}")]
    Aborted(String),

    #[error("could not reach rendezvous at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("rendezvous protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
