//! Duplex call protocol shared by the stream client and server.
//!
//! - **protocol**: frame and header types
//! - **codec**: length-prefixed tagged framing over any byte stream

pub mod codec;
pub mod protocol;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::io::ReaderStream;

pub use codec::{FrameCodec, MAX_FRAME_LEN};
pub use protocol::{CallHeader, CallId, CallStatus, Frame};

use crate::error::CallError;

/// Largest data chunk read from a local stream before it is sent.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Any bidirectional byte stream a call can run over (TCP, TLS, in-memory).
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxIo = Box<dyn Io>;

pub type FrameReader = FramedRead<ReadHalf<BoxIo>, FrameCodec>;
pub type FrameWriter = FramedWrite<WriteHalf<BoxIo>, FrameCodec>;

/// A framed connection, split so both directions can be driven at once.
pub struct Connection {
    pub reader: FrameReader,
    pub writer: FrameWriter,
}

impl Connection {
    pub fn new(io: BoxIo) -> Self {
        let (read, write) = tokio::io::split(io);
        Self {
            reader: FramedRead::new(read, FrameCodec::new()),
            writer: FramedWrite::new(write, FrameCodec::new()),
        }
    }
}

/// Send `input` as data frames until EOF.
pub(crate) async fn send_data(
    input: &mut (dyn AsyncRead + Send + Unpin),
    writer: &mut FrameWriter,
    endpoint: &str,
) -> Result<(), CallError> {
    let mut chunks = ReaderStream::with_capacity(input, CHUNK_SIZE);
    while let Some(chunk) = chunks.next().await {
        writer
            .send(Frame::Data(chunk?))
            .await
            .map_err(|e| CallError::transport(endpoint, e))?;
    }
    Ok(())
}

/// Write incoming data frames to `output` until the peer's status arrives.
pub(crate) async fn recv_data(
    reader: &mut FrameReader,
    output: &mut (dyn AsyncWrite + Send + Unpin),
    endpoint: &str,
) -> Result<CallStatus, CallError> {
    loop {
        match reader.next().await {
            Some(Ok(Frame::Data(bytes))) => output.write_all(&bytes).await?,
            Some(Ok(Frame::Status(status))) => {
                output.flush().await?;
                return Ok(status);
            }
            Some(Ok(other)) => {
                return Err(CallError::transport(
                    endpoint,
                    format!("unexpected {} frame mid-call", other.kind()),
                ));
            }
            Some(Err(e)) => return Err(CallError::transport(endpoint, e)),
            None => {
                return Err(CallError::transport(
                    endpoint,
                    "connection closed before terminal status",
                ));
            }
        }
    }
}
