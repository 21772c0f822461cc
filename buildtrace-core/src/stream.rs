//! Decoding of the daemon's build response body.
//!
//! Both builders answer an image build request with a stream of JSON messages,
//! one per line. Reading happens on the submitting task; decoded messages are
//! forwarded to the translator task over a channel.

use crate::error::{BuildError, Result};
use crate::legacy::JsonMessage;
use crate::translator::{BackendMessage, BackendSender};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::{debug, trace};

/// Message id carrying the built image id (`aux: {"ID": ...}`) from BuildKit.
pub const IMAGE_ID_MESSAGE: &str = "moby.image.id";

/// Message id carrying a base64 protobuf `StatusResponse` in `aux`.
pub const TRACE_MESSAGE: &str = "moby.buildkit.trace";

/// Reader over a newline-delimited JSON message stream.
pub struct MessageStream<R> {
    lines: Lines<BufReader<R>>,
    decoded: u64,
}

impl<R: AsyncRead + Unpin> MessageStream<R> {
    pub fn new(reader: R) -> Self {
        Self { lines: BufReader::new(reader).lines(), decoded: 0 }
    }

    /// Number of messages decoded so far.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Read the next message, skipping blank lines. `None` at end of stream.
    pub async fn next_message(&mut self) -> Result<Option<JsonMessage>> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::InvalidData => {
                        BuildError::protocol(format!("message is not valid UTF-8: {}", e))
                    }
                    _ => BuildError::daemon("read_build_response", e),
                })?;

            let Some(line) = line else {
                return Ok(None);
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let msg: JsonMessage = serde_json::from_str(line).map_err(|e| {
                BuildError::protocol(format!("undecodable message {:?}: {}", line, e))
            })?;
            self.decoded += 1;
            trace!(id = %msg.id, "Decoded build response message");
            return Ok(Some(msg));
        }
    }
}

/// Forward every message of a response body to the translator.
///
/// Stops early without error, and without reading further, if the translator has
/// gone away; the translator's own outcome is what the orchestrator reports in that
/// case.
pub async fn forward_messages<R>(reader: R, sender: &BackendSender) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut stream = MessageStream::new(reader);

    while !sender.is_closed() {
        let Some(msg) = stream.next_message().await? else {
            debug!(decoded = stream.decoded(), "Build response stream finished");
            return Ok(());
        };
        if !sender.send(BackendMessage::Json(msg)).await {
            break;
        }
    }

    debug!(decoded = stream.decoded(), "Translator stopped, no longer reading response");
    Ok(())
}
