//! Newline-delimited JSON framing between workers and the rendezvous host.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::envelope::Envelope;
use super::identity::AgentId;
use crate::error::{Error, Result};

/// Upper bound for a single encoded frame.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// One line on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// First frame of every worker connection: the identities it hosts.
    Hello { agents: Vec<AgentId> },
    /// Identities added after the handshake.
    Register { agents: Vec<AgentId> },
    /// A message to relay or deliver.
    Envelope(Envelope),
    /// Host could not relay an envelope.
    Nack {
        correlation_id: String,
        destination: AgentId,
        reason: String,
    },
}

pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: Vec::new(),
        }
    }

    /// Read the next frame. `Ok(None)` means the peer closed the stream.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            self.line.clear();
            let read = (&mut self.reader)
                .take(MAX_FRAME_BYTES as u64 + 1)
                .read_until(b'\n', &mut self.line)
                .await?;

            if read == 0 {
                return Ok(None);
            }
            if read > MAX_FRAME_BYTES {
                return Err(Error::Protocol(format!(
                    "frame exceeds {} bytes",
                    MAX_FRAME_BYTES
                )));
            }

            while matches!(self.line.last(), Some(b'\n' | b'\r')) {
                self.line.pop();
            }
            if self.line.is_empty() {
                continue;
            }

            return serde_json::from_slice(&self.line)
                .map(Some)
                .map_err(|e| Error::Protocol(format!("invalid frame: {}", e)));
        }
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut bytes = serde_json::to_vec(frame)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Write queued frames until the queue closes, the token fires, or a write fails.
pub(crate) async fn drain_outbound<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let written = tokio::select! {
            _ = shutdown.cancelled() => break,
            written = writer.write_frame(&frame) => written,
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "Failed to write frame");
            break;
        }
    }

    let _ = writer.shutdown().await;
}
