use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{FrameError, Framer};

const DEFAULT_MAX_HEAD: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;

/// One HTTP/1.x message, delimited by its own headers and re-emitted verbatim.
///
/// Responses are the normal case (a warm process answering on stdout). Bodies
/// are delimited by `Content-Length` or chunked transfer coding; a response
/// with neither cannot be delimited on a persistent stream and is rejected.
/// Requests without a length carry no body.
#[derive(Debug, Clone, Copy)]
pub struct HttpFramer {
    max_head: usize,
}

impl Default for HttpFramer {
    fn default() -> Self {
        Self {
            max_head: DEFAULT_MAX_HEAD,
        }
    }
}

impl HttpFramer {
    /// Upper bound on start line plus headers.
    pub fn with_max_head(mut self, max_head: usize) -> Self {
        self.max_head = max_head;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    None,
    Length(u64),
    Chunked,
}

#[async_trait]
impl Framer for HttpFramer {
    async fn copy(
        &self,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        src: &mut (dyn AsyncBufRead + Send + Unpin),
    ) -> Result<(), FrameError> {
        let (head, body) = self.read_head(src).await?;
        dest.write_all(&head).await?;

        match body {
            Body::None => {}
            Body::Length(len) => copy_exact(src, dest, len).await?,
            Body::Chunked => copy_chunked(src, dest, self.max_head).await?,
        }
        dest.flush().await?;
        tracing::trace!(head_len = head.len(), ?body, "Framed HTTP message");
        Ok(())
    }
}

impl HttpFramer {
    async fn read_head(
        &self,
        src: &mut (dyn AsyncBufRead + Send + Unpin),
    ) -> Result<(Vec<u8>, Body), FrameError> {
        let mut head = Vec::new();

        // Tolerate stray CRLFs left between messages.
        let start = loop {
            head.clear();
            let line = read_line(src, &mut head, self.max_head).await?;
            if !line.trim().is_empty() {
                break line;
            }
        };

        loop {
            let budget = self.max_head.saturating_sub(head.len());
            if budget == 0 {
                return Err(FrameError::Malformed("message head too large".into()));
            }
            let line = read_line(src, &mut head, budget).await?;
            if line.trim_end_matches(['\r', '\n']).is_empty() {
                break;
            }
        }
        tracing::trace!(start = start.trim_end(), "Read HTTP message head");

        let body = parse_head(&head)?;
        Ok((head, body))
    }
}

fn is_bodyless(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

/// Decide how the body after `head` is delimited.
fn parse_head(head: &[u8]) -> Result<Body, FrameError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    if head.starts_with(b"HTTP/") {
        let mut response = httparse::Response::new(&mut headers);
        complete(response.parse(head))?;
        let status = response.code.unwrap_or_default();
        if is_bodyless(status) {
            return Ok(Body::None);
        }
        match framing(&*response.headers)? {
            (true, _) => Ok(Body::Chunked),
            (false, Some(len)) => Ok(Body::Length(len)),
            (false, None) => Err(FrameError::Malformed(format!(
                "response {status} has neither content-length nor chunked encoding"
            ))),
        }
    } else {
        let mut request = httparse::Request::new(&mut headers);
        complete(request.parse(head))?;
        match framing(&*request.headers)? {
            (true, _) => Ok(Body::Chunked),
            (false, Some(len)) => Ok(Body::Length(len)),
            (false, None) => Ok(Body::None),
        }
    }
}

fn complete(parsed: Result<httparse::Status<usize>, httparse::Error>) -> Result<(), FrameError> {
    match parsed {
        Ok(httparse::Status::Complete(_)) => Ok(()),
        Ok(httparse::Status::Partial) => Err(FrameError::Malformed("incomplete message head".into())),
        Err(e) => Err(FrameError::Malformed(format!("bad message head: {e}"))),
    }
}

/// `(chunked, content_length)` from the message headers.
fn framing(headers: &[httparse::Header<'_>]) -> Result<(bool, Option<u64>), FrameError> {
    let mut content_length = None;
    let mut chunked = false;
    for header in headers {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| FrameError::Malformed(format!("non-UTF-8 {} header", header.name)))?
            .trim();
        if header.name.eq_ignore_ascii_case("content-length") {
            let len = value
                .parse::<u64>()
                .map_err(|_| FrameError::Malformed(format!("bad content-length {value:?}")))?;
            content_length = Some(len);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
        }
    }
    Ok((chunked, content_length))
}

/// Append one `\n`-terminated line to `buf`, returning it as text.
async fn read_line(
    src: &mut (dyn AsyncBufRead + Send + Unpin),
    buf: &mut Vec<u8>,
    limit: usize,
) -> Result<String, FrameError> {
    let start = buf.len();
    let n = (&mut *src)
        .take(limit as u64)
        .read_until(b'\n', buf)
        .await?;
    let line = &buf[start..];
    if line.last() != Some(&b'\n') {
        return Err(if n >= limit {
            FrameError::Malformed("message head too large".into())
        } else {
            FrameError::Eof
        });
    }
    String::from_utf8(line.to_vec())
        .map_err(|_| FrameError::Malformed("message head is not valid UTF-8".into()))
}

async fn copy_exact(
    src: &mut (dyn AsyncBufRead + Send + Unpin),
    dest: &mut (dyn AsyncWrite + Send + Unpin),
    len: u64,
) -> Result<(), FrameError> {
    let mut body = (&mut *src).take(len);
    let copied = tokio::io::copy_buf(&mut body, dest).await?;
    if copied < len {
        return Err(FrameError::Eof);
    }
    Ok(())
}

async fn copy_chunked(
    src: &mut (dyn AsyncBufRead + Send + Unpin),
    dest: &mut (dyn AsyncWrite + Send + Unpin),
    max_line: usize,
) -> Result<(), FrameError> {
    let mut line = Vec::new();
    loop {
        line.clear();
        read_line(src, &mut line, max_line).await?;
        dest.write_all(&line).await?;

        let size = match httparse::parse_chunk_size(&line) {
            Ok(httparse::Status::Complete((_, size))) => size,
            _ => {
                let text = String::from_utf8_lossy(&line);
                return Err(FrameError::Malformed(format!("bad chunk size {:?}", text.trim_end())));
            }
        };

        if size == 0 {
            // Trailers, then the terminating blank line.
            loop {
                line.clear();
                let trailer = read_line(src, &mut line, max_line).await?;
                dest.write_all(&line).await?;
                if trailer.trim().is_empty() {
                    return Ok(());
                }
            }
        }

        copy_exact(src, dest, size).await?;
        line.clear();
        let end = read_line(src, &mut line, max_line).await?;
        if !end.trim().is_empty() {
            return Err(FrameError::Malformed("chunk not followed by CRLF".into()));
        }
        dest.write_all(&line).await?;
    }
}
