//! Pipe transport: NUL-framed JSON over a read/write byte-stream pair.
//!
//! One reader task and one writer task per connection. The reader splits the
//! inbound byte stream on the frame delimiter, parses each chunk, and hands
//! [`Incoming`] frames to the multiplexer channel. The writer serializes all
//! outbound frames through a single queue so frames never interleave, and
//! back-pressure from a full pipe is absorbed by awaiting the underlying
//! write rather than surfacing to callers.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{Incoming, FRAME_DELIMITER};

/// Frames larger than this indicate a broken peer rather than a payload.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const OUTBOUND_QUEUE: usize = 128;
const INBOUND_QUEUE: usize = 512;

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

fn frame_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(
        vec![FRAME_DELIMITER],
        vec![FRAME_DELIMITER],
        MAX_FRAME_LEN,
    )
}

/// Handle to a running pipe transport.
///
/// Cloned freely; all clones share the writer queue and the closed token.
/// Dropping handles does not close the transport; that happens on explicit
/// [`close`](Transport::close), on reader EOF, or on a write failure.
#[derive(Clone)]
pub(crate) struct Transport {
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl Transport {
    /// Spawn reader and writer tasks over the given stream halves. Returns
    /// the handle and the channel of parsed inbound frames.
    pub fn spawn(reader: BoxedRead, writer: BoxedWrite) -> (Self, mpsc::Receiver<Incoming>) {
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Incoming>(INBOUND_QUEUE);
        let closed = CancellationToken::new();

        tokio::spawn(read_loop(reader, inbound_tx, closed.clone()));
        tokio::spawn(write_loop(writer, outbound_rx, closed.clone()));

        (
            Self {
                outbound: outbound_tx,
                closed,
            },
            inbound_rx,
        )
    }

    /// Queue one frame for writing. The delimiter is appended by the writer.
    pub async fn send(&self, frame: String) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionLost);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionLost)
    }

    /// Begin shutdown: the writer drains its queue and both halves are
    /// dropped. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled once the transport is down, in either direction.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

async fn read_loop(reader: BoxedRead, inbound: mpsc::Sender<Incoming>, closed: CancellationToken) {
    let mut frames = FramedRead::new(reader, frame_codec());
    loop {
        let chunk = tokio::select! {
            chunk = frames.next() => chunk,
            _ = closed.cancelled() => break,
        };
        match chunk {
            Some(Ok(bytes)) => {
                if bytes.is_empty() {
                    continue;
                }
                match Incoming::parse(&bytes) {
                    Ok(frame) => {
                        if inbound.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        // A single bad frame is recoverable; the stream is not
                        // resynchronized because the delimiter already is.
                        warn!(target: "pipecdp::transport", %err, "dropping unparseable frame");
                    }
                }
            }
            Some(Err(err)) => {
                warn!(target: "pipecdp::transport", %err, "read failed, closing transport");
                break;
            }
            None => {
                debug!(target: "pipecdp::transport", "pipe closed by browser");
                break;
            }
        }
    }
    closed.cancel();
}

async fn write_loop(
    writer: BoxedWrite,
    mut outbound: mpsc::Receiver<String>,
    closed: CancellationToken,
) {
    let mut sink = FramedWrite::new(writer, frame_codec());
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(err) = sink.send(frame).await {
                            warn!(target: "pipecdp::transport", %err, "write failed, closing transport");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = closed.cancelled() => {
                // Drain whatever was queued before the close, then stop.
                outbound.close();
                while let Ok(frame) = outbound.try_recv() {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = futures::SinkExt::<String>::flush(&mut sink).await;
    closed.cancel();
}
