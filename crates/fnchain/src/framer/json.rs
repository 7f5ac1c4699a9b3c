use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::{FrameError, Framer};

const DEFAULT_MAX_DOCUMENT: usize = 16 * 1024 * 1024;

/// One JSON document per message.
///
/// The document is located with a byte scanner (so nothing past its end is
/// consumed), validated with serde_json and written back compactly followed
/// by a newline.
#[derive(Debug, Clone, Copy)]
pub struct JsonFramer {
    max_document: usize,
}

impl Default for JsonFramer {
    fn default() -> Self {
        Self {
            max_document: DEFAULT_MAX_DOCUMENT,
        }
    }
}

impl JsonFramer {
    /// Upper bound on one document's encoded size.
    pub fn with_max_document(mut self, max_document: usize) -> Self {
        self.max_document = max_document;
        self
    }
}

#[async_trait]
impl Framer for JsonFramer {
    async fn copy(
        &self,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        src: &mut (dyn AsyncBufRead + Send + Unpin),
    ) -> Result<(), FrameError> {
        let raw = read_document(src, self.max_document).await?;
        let value: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|e| FrameError::Malformed(e.to_string()))?;
        let mut encoded =
            serde_json::to_vec(&value).map_err(|e| FrameError::Malformed(e.to_string()))?;
        encoded.push(b'\n');
        dest.write_all(&encoded).await?;
        dest.flush().await?;
        Ok(())
    }
}

async fn read_document(
    src: &mut (dyn AsyncBufRead + Send + Unpin),
    max_document: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut scanner = Scanner::Leading;
    let mut doc = Vec::new();
    loop {
        let buf = src.fill_buf().await?;
        if buf.is_empty() {
            // A bare scalar may legitimately end at end of stream.
            return match scanner {
                Scanner::Scalar => Ok(doc),
                _ => Err(FrameError::Eof),
            };
        }
        let (consumed, done) = scanner.feed(buf, &mut doc)?;
        src.consume(consumed);
        if doc.len() > max_document {
            return Err(FrameError::Malformed(format!(
                "JSON document exceeds {max_document} bytes"
            )));
        }
        if done {
            return Ok(doc);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Scanner {
    Leading,
    Nested {
        depth: usize,
        in_string: bool,
        escaped: bool,
    },
    String {
        escaped: bool,
    },
    Scalar,
}

impl Scanner {
    /// Feed bytes; returns how many were consumed and whether the document is complete.
    fn feed(&mut self, buf: &[u8], doc: &mut Vec<u8>) -> Result<(usize, bool), FrameError> {
        for (i, &b) in buf.iter().enumerate() {
            match self {
                Scanner::Leading => {
                    if b.is_ascii_whitespace() {
                        continue;
                    }
                    *self = match b {
                        b'{' | b'[' => Scanner::Nested {
                            depth: 1,
                            in_string: false,
                            escaped: false,
                        },
                        b'"' => Scanner::String { escaped: false },
                        b'-' | b'0'..=b'9' | b't' | b'f' | b'n' => Scanner::Scalar,
                        other => {
                            return Err(FrameError::Malformed(format!(
                                "unexpected byte {:?} at start of document",
                                other as char
                            )));
                        }
                    };
                    doc.push(b);
                }
                Scanner::Nested {
                    depth,
                    in_string,
                    escaped,
                } => {
                    doc.push(b);
                    if *in_string {
                        if *escaped {
                            *escaped = false;
                        } else if b == b'\\' {
                            *escaped = true;
                        } else if b == b'"' {
                            *in_string = false;
                        }
                        continue;
                    }
                    match b {
                        b'"' => *in_string = true,
                        b'{' | b'[' => *depth += 1,
                        b'}' | b']' => {
                            *depth -= 1;
                            if *depth == 0 {
                                return Ok((i + 1, true));
                            }
                        }
                        _ => {}
                    }
                }
                Scanner::String { escaped } => {
                    doc.push(b);
                    if *escaped {
                        *escaped = false;
                    } else if b == b'\\' {
                        *escaped = true;
                    } else if b == b'"' {
                        return Ok((i + 1, true));
                    }
                }
                Scanner::Scalar => {
                    if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'+' | b'.') {
                        doc.push(b);
                    } else {
                        // Terminator stays in the stream for the next message.
                        return Ok((i, true));
                    }
                }
            }
        }
        Ok((buf.len(), false))
    }
}
