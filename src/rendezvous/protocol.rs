// Rendezvous wire protocol
//
// Newline-delimited JSON objects tagged by `type`. Workers send `join`;
// the launcher answers with `go` once every rank is present, or `abort`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::RendezvousError;

/// Upper bound on one protocol line; longer input is a protocol error
const MAX_LINE_BYTES: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Worker announces itself
    Join {
        rank: usize,
        world_size: usize,
        digest: String,
    },
    /// Every rank has joined; training may start
    Go { world_size: usize },
    /// Rendezvous failed; the receiver must exit
    Abort { reason: String },
}

/// Framed message stream over a TCP connection
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), RendezvousError> {
        let mut line = serde_json::to_vec(message)
            .map_err(|e| RendezvousError::Protocol(e.to_string()))?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Half-close: the peer reads EOF, replies can still arrive
    pub async fn close_write(&mut self) -> Result<(), RendezvousError> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Read the next message; `None` when the peer closed the connection
    pub async fn recv(&mut self) -> Result<Option<Message>, RendezvousError> {
        let mut line = String::new();
        let read = (&mut self.reader)
            .take(MAX_LINE_BYTES)
            .read_line(&mut line)
            .await?;

        if read == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') && read as u64 >= MAX_LINE_BYTES {
            return Err(RendezvousError::Protocol(format!(
                "message exceeds {} bytes",
                MAX_LINE_BYTES
            )));
        }

        serde_json::from_str(line.trim_end())
            .map(Some)
            .map_err(|e| RendezvousError::Protocol(format!("malformed message: {}", e)))
    }
}
