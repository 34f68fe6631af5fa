// Rendezvous server
//
// Owns the master port until the workers are released. `barrier` accepts one
// `join` per rank and releases everyone with `go` once the world is complete.
// Released workers half-close; the listener is closed before the server hangs
// up, so a worker seeing EOF knows the trainer may bind the port.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::protocol::{Connection, Message};
use super::RendezvousError;

/// How long a connection may stay silent before its `join`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long released workers get to half-close
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RendezvousServer {
    listener: TcpListener,
    addr: String,
    port: u16,
}

impl RendezvousServer {
    /// Bind the rendezvous endpoint
    ///
    /// Fails with [`RendezvousError::PortConflict`] when another process
    /// already listens on `addr:port`. Port 0 binds an ephemeral port.
    pub async fn bind(addr: &str, port: u16) -> Result<Self, RendezvousError> {
        let listener = match TcpListener::bind((addr, port)).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                return Err(RendezvousError::PortConflict {
                    addr: addr.to_string(),
                    port,
                });
            }
            Err(source) => {
                return Err(RendezvousError::Bind {
                    addr: addr.to_string(),
                    port,
                    source,
                });
            }
        };

        let port = listener.local_addr()?.port();
        info!(addr, port, "Rendezvous endpoint bound");

        Ok(Self {
            listener,
            addr: addr.to_string(),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Wait until ranks `0..world_size` have each joined once with `digest`
    ///
    /// Consumes the server: on success the master port is free when this
    /// returns, on failure it is freed when the error is returned. Every accepted connection performs its handshake in its own task, so a
    /// peer that connects and stays silent cannot hold up the others.
    /// Connections that close, send garbage or miss the handshake timeout are
    /// dropped and do not count. A duplicate or out-of-range rank, a digest or
    /// world-size mismatch, or the overall timeout aborts every joined peer.
    pub async fn barrier(
        self,
        world_size: usize,
        digest: &str,
        timeout: Duration,
    ) -> Result<(), RendezvousError> {
        let deadline = Instant::now() + timeout;
        let mut peers: BTreeMap<usize, Connection> = BTreeMap::new();
        let mut handshakes: JoinSet<Option<(Connection, SocketAddr, Message)>> = JoinSet::new();

        while peers.len() < world_size {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    let err = RendezvousError::Timeout {
                        joined: peers.len(),
                        expected: world_size,
                        waited: timeout,
                    };
                    abort_all(&mut peers, &err.to_string()).await;
                    return Err(err);
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        handshakes.spawn(handshake(stream, peer_addr, deadline));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept rendezvous connection"),
                },
                Some(done) = handshakes.join_next(), if !handshakes.is_empty() => {
                    let Ok(Some((mut conn, peer_addr, message))) = done else {
                        continue;
                    };

                    let (rank, reported, peer_digest) = match message {
                        Message::Join {
                            rank,
                            world_size,
                            digest,
                        } => (rank, world_size, digest),
                        other => {
                            warn!(peer = %peer_addr, message = ?other, "Ignoring non-join message");
                            continue;
                        }
                    };

                    let rejection = if rank >= world_size {
                        Some(RendezvousError::RankOutOfRange { rank, world_size })
                    } else if reported != world_size {
                        Some(RendezvousError::WorldSizeMismatch {
                            rank,
                            reported,
                            expected: world_size,
                        })
                    } else if peer_digest != digest {
                        Some(RendezvousError::DigestMismatch { rank })
                    } else if peers.contains_key(&rank) {
                        Some(RendezvousError::DuplicateRank(rank))
                    } else {
                        None
                    };

                    if let Some(err) = rejection {
                        let reason = err.to_string();
                        let _ = conn.send(&Message::Abort { reason: reason.clone() }).await;
                        abort_all(&mut peers, &reason).await;
                        return Err(err);
                    }

                    debug!(rank, joined = peers.len() + 1, world_size, "Worker joined rendezvous");
                    peers.insert(rank, conn);
                }
            }
        }

        let mut failed = None;
        for (rank, conn) in peers.iter_mut() {
            if let Err(e) = conn.send(&Message::Go { world_size }).await {
                failed = Some(format!("failed to release rank {}: {}", rank, e));
                break;
            }
        }
        if let Some(reason) = failed {
            abort_all(&mut peers, &reason).await;
            return Err(RendezvousError::Aborted(reason));
        }

        // Workers close their side first, so no TIME_WAIT socket is left on
        // the master port when the trainer binds it
        let drain_deadline = Instant::now() + DRAIN_TIMEOUT;
        for (rank, conn) in peers.iter_mut() {
            if timeout_at(drain_deadline, conn.recv()).await.is_err() {
                debug!(rank, "Worker did not close its side of the rendezvous");
            }
        }

        let (addr, port) = (self.addr, self.port);
        drop(handshakes);
        drop(self.listener);
        drop(peers);
        info!(world_size, addr = %addr, port, "All workers joined, barrier released");
        Ok(())
    }
}

/// Read the first message of a fresh connection
async fn handshake(
    stream: TcpStream,
    peer_addr: SocketAddr,
    deadline: Instant,
) -> Option<(Connection, SocketAddr, Message)> {
    let mut conn = Connection::new(stream);
    let limit = deadline.min(Instant::now() + HANDSHAKE_TIMEOUT);
    match timeout_at(limit, conn.recv()).await {
        Ok(Ok(Some(message))) => Some((conn, peer_addr, message)),
        Ok(Ok(None)) => {
            debug!(peer = %peer_addr, "Peer closed before joining");
            None
        }
        Ok(Err(e)) => {
            warn!(peer = %peer_addr, error = %e, "Ignoring malformed rendezvous peer");
            None
        }
        Err(_) => {
            debug!(peer = %peer_addr, "Peer sent nothing, dropping connection");
            None
        }
    }
}

async fn abort_all(peers: &mut BTreeMap<usize, Connection>, reason: &str) {
    for conn in peers.values_mut() {
        let _ = conn
            .send(&Message::Abort {
                reason: reason.to_string(),
            })
            .await;
    }
}
