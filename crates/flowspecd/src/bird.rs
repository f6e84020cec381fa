//! BIRD control socket client
//!
//! BIRD answers on its control socket with lines prefixed by a four digit
//! reply code. A reply ends with a line whose code is `0000`; codes starting
//! with 8 or 9 are errors.

use crate::error::FetchError;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

/// Default BIRD control socket path.
pub const DEFAULT_BIRD_SOCKET: &str = "/run/bird/bird.ctl";

/// Query for every BGP-learned IPv4 and IPv6 flowspec route with attributes.
pub const ROUTE_QUERY: &str =
    "show route where ((net.type = NET_FLOW4 || net.type = NET_FLOW6) && source = RTS_BGP) all";

/// Line prefix marking the end of a reply.
const END_OF_REPLY: &str = "0000 ";

/// Source of route dump text.
#[async_trait]
pub trait RouteSource: Send + Sync {
    /// Run `command` and return the full reply text.
    async fn fetch(&self, command: &str) -> Result<String, FetchError>;
}

/// Client for the BIRD control socket.
///
/// A new connection is opened per query.
#[derive(Debug, Clone)]
pub struct BirdSocket {
    path: PathBuf,
}

impl BirdSocket {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RouteSource for BirdSocket {
    async fn fetch(&self, command: &str) -> Result<String, FetchError> {
        debug!(command = %command, socket = %self.path.display(), "Querying BIRD");

        let mut stream = UnixStream::connect(&self.path).await?;
        stream.write_all(format!("{}\n", command).as_bytes()).await?;

        let mut lines = BufReader::new(stream).lines();
        let mut reply = String::new();
        while let Some(line) = lines.next_line().await? {
            if let Some(message) = error_reply(&line) {
                return Err(FetchError::Rejected(message.to_string()));
            }
            reply.push_str(&line);
            reply.push('\n');
            if line.starts_with(END_OF_REPLY) {
                break;
            }
        }

        debug!(bytes = reply.len(), "Finished reading BIRD reply");
        Ok(reply)
    }
}

/// Return the message of an error reply line (`8xxx ` / `9xxx `).
fn error_reply(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    if bytes.len() < 5 || bytes[4] != b' ' {
        return None;
    }
    if !matches!(bytes[0], b'8' | b'9') || !bytes[..4].iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some(line[5..].trim())
}
