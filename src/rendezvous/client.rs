// Rendezvous client
//
// Worker side of the barrier: connect (retrying while the launcher comes
// up), announce the rank, block until `go` or `abort`. After `go` the worker
// half-closes and waits for the launcher to hang up, which happens only once
// the master port is free.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::protocol::{Connection, Message};
use super::RendezvousError;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(200);
/// Upper bound on waiting for the launcher to free the master port
const HANDOVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Join the rendezvous at `addr:port` and wait for the barrier to release
///
/// Returns the world size announced by the launcher. By then the launcher
/// has stopped listening on `port`.
pub async fn join(
    addr: &str,
    port: u16,
    rank: usize,
    world_size: usize,
    digest: &str,
    timeout: Duration,
) -> Result<usize, RendezvousError> {
    let deadline = Instant::now() + timeout;
    let stream = connect_with_retry(addr, port, deadline).await?;
    let mut conn = Connection::new(stream);

    conn.send(&Message::Join {
        rank,
        world_size,
        digest: digest.to_string(),
    })
    .await?;
    debug!(rank, world_size, "Sent join, waiting for barrier");

    match timeout_at(deadline, conn.recv()).await {
        Ok(Ok(Some(Message::Go { world_size }))) => {
            await_handover(&mut conn, rank).await;
            info!(rank, world_size, "Rendezvous complete");
            Ok(world_size)
        }
        Ok(Ok(Some(Message::Abort { reason }))) => Err(RendezvousError::Aborted(reason)),
        Ok(Ok(Some(other))) => Err(RendezvousError::Protocol(format!(
            "unexpected message from launcher: {:?}",
            other
        ))),
        Ok(Ok(None)) => Err(RendezvousError::Aborted(
            "launcher closed the rendezvous".to_string(),
        )),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(RendezvousError::NoRelease { waited: timeout }),
    }
}

async fn await_handover(conn: &mut Connection, rank: usize) {
    if let Err(e) = conn.close_write().await {
        debug!(rank, error = %e, "Failed to half-close rendezvous connection");
    }
    match timeout(HANDOVER_TIMEOUT, conn.recv()).await {
        Ok(Ok(None)) => debug!(rank, "Launcher released the master port"),
        Ok(Ok(Some(message))) => warn!(rank, message = ?message, "Unexpected message after go"),
        Ok(Err(e)) => debug!(rank, error = %e, "Rendezvous connection failed after go"),
        Err(_) => warn!(
            rank,
            waited = ?HANDOVER_TIMEOUT,
            "Launcher did not hang up, the master port may still be held"
        ),
    }
}

async fn connect_with_retry(
    addr: &str,
    port: u16,
    deadline: Instant,
) -> Result<TcpStream, RendezvousError> {
    let endpoint = format!("{}:{}", addr, port);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let error = match timeout_at(deadline, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => e,
            Err(_) => std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        };

        if Instant::now() + CONNECT_RETRY_INTERVAL >= deadline {
            return Err(RendezvousError::Connect {
                endpoint,
                source: error,
            });
        }

        debug!(endpoint = %endpoint, attempt, error = %error, "Rendezvous not reachable yet, retrying");
        sleep(CONNECT_RETRY_INTERVAL).await;
    }
}
