//! Carries an [`EventBus`] across a byte stream.
//!
//! Each direction is newline-delimited JSON, one frame per line:
//!
//! ```text
//! {"channel":"state-update","payload":{"volume":0.5}}
//! ```
//!
//! Frames read from the stream are emitted on the local bus tagged with the
//! bridge id, and the writer skips messages carrying its own tag, so nothing
//! is echoed back to the side it came from. Malformed lines are logged and
//! skipped; the bridge stops when either direction hits EOF or an I/O error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::bus::{BusMessage, EventBus};
use crate::error::SyncError;

#[derive(Serialize)]
struct OutgoingFrame<'a> {
    channel: &'a str,
    payload: &'a Value,
}

#[derive(Deserialize)]
struct IncomingFrame {
    channel: String,
    #[serde(default)]
    payload: Value,
}

/// A running bridge. Dropping it stops both directions.
#[must_use = "dropping a Bridge disconnects it immediately"]
pub struct Bridge {
    id: Uuid,
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
}

impl Bridge {
    /// Bridge `bus` over a duplex stream such as a `TcpStream`.
    pub fn connect<T>(bus: &EventBus, stream: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::spawn(bus, reader, writer)
    }

    /// Bridge `bus` over separate read and write halves.
    ///
    /// Must be called inside a tokio runtime. The bus is subscribed before
    /// this returns, so every message emitted afterwards is forwarded.
    pub fn spawn<R, W>(bus: &EventBus, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = Uuid::new_v4();
        let receiver = bus.subscribe();

        let inbound = tokio::spawn(read_frames(id, bus.clone(), reader));
        let outbound = tokio::spawn(write_frames(id, receiver, writer));

        info!(bridge = %id, "bridge connected");
        Self {
            id,
            inbound,
            outbound,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// True once either direction has stopped.
    pub fn is_finished(&self) -> bool {
        self.inbound.is_finished() || self.outbound.is_finished()
    }

    /// Wait until the remote side closes the stream.
    pub async fn closed(mut self) {
        let _ = (&mut self.inbound).await;
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.inbound.abort();
        self.outbound.abort();
        debug!(bridge = %self.id, "bridge dropped");
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

async fn read_frames<R>(id: Uuid, bus: EventBus, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!(bridge = %id, "bridge stream closed by peer");
                return;
            }
            Err(e) => {
                warn!(bridge = %id, error = %e, "bridge read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match decode_frame(&line) {
            Ok(frame) => {
                trace!(bridge = %id, channel = %frame.channel, "frame in");
                bus.emit_message(BusMessage {
                    channel: Arc::from(frame.channel),
                    payload: frame.payload,
                    via: Some(id),
                });
            }
            Err(e) => warn!(bridge = %id, error = %e, "skipping malformed frame"),
        }
    }
}

async fn write_frames<W>(id: Uuid, mut receiver: broadcast::Receiver<BusMessage>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = match receiver.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(n)) => {
                warn!(bridge = %id, lagged = n, "bridge fell behind, messages dropped");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        if message.via == Some(id) {
            continue;
        }

        let line = match encode_frame(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(bridge = %id, channel = %message.channel, error = %e, "failed to encode frame");
                continue;
            }
        };
        if let Err(e) = write_line(&mut writer, &line).await {
            warn!(bridge = %id, error = %e, "bridge write failed");
            return;
        }
        trace!(bridge = %id, channel = %message.channel, "frame out");
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &[u8]) -> Result<(), SyncError> {
    writer.write_all(line).await?;
    writer.flush().await?;
    Ok(())
}

fn encode_frame(message: &BusMessage) -> Result<Vec<u8>, SyncError> {
    let mut line = serde_json::to_vec(&OutgoingFrame {
        channel: &message.channel,
        payload: &message.payload,
    })?;
    line.push(b'\n');
    Ok(line)
}

fn decode_frame(line: &str) -> Result<IncomingFrame, SyncError> {
    Ok(serde_json::from_str(line)?)
}
