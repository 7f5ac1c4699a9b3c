use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::{FrameError, Framer};

/// One `\n`-terminated line, written verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineFramer;

#[async_trait]
impl Framer for LineFramer {
    async fn copy(
        &self,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        src: &mut (dyn AsyncBufRead + Send + Unpin),
    ) -> Result<(), FrameError> {
        let mut line = Vec::new();
        src.read_until(b'\n', &mut line).await?;
        if line.last() != Some(&b'\n') {
            return Err(FrameError::Eof);
        }
        tracing::trace!(len = line.len(), "Framed line");
        dest.write_all(&line).await?;
        dest.flush().await?;
        Ok(())
    }
}
