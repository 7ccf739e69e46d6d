//! Newline-delimited record reader with a bounded accumulator.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Errors that end a line stream early.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads `\n`-terminated records from a byte stream.
///
/// A `\r` directly before the terminator is stripped. Bytes after the last
/// terminator are discarded at end of stream. Invalid UTF-8 is replaced
/// lossily rather than failing the connection.
pub struct LineFramer<R> {
    reader: BufReader<R>,
    max_line_bytes: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineFramer<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_line_bytes,
            buf: Vec::new(),
        }
    }

    /// Read the next record.
    ///
    /// Returns `Ok(None)` at end of stream. Cancel-safe only in the sense
    /// that a cancelled call loses the partial record; callers treat
    /// cancellation as the end of the stream.
    pub async fn next_line(&mut self) -> Result<Option<String>, FrameError> {
        self.buf.clear();
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                self.buf.clear();
                return Ok(None);
            }

            if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                self.buf.extend_from_slice(&available[..pos]);
                self.reader.consume(pos + 1);
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
                if self.buf.len() > self.max_line_bytes {
                    return Err(FrameError::LineTooLong {
                        limit: self.max_line_bytes,
                    });
                }
                return Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()));
            }

            let len = available.len();
            self.buf.extend_from_slice(available);
            self.reader.consume(len);
            // One extra byte of slack for a `\r` still waiting on its `\n`.
            if self.buf.len() > self.max_line_bytes.saturating_add(1) {
                return Err(FrameError::LineTooLong {
                    limit: self.max_line_bytes,
                });
            }
        }
    }

    /// Drain the stream, returning every complete record and the error that
    /// ended it, if any.
    pub async fn collect_lines(mut self) -> (Vec<String>, Option<FrameError>) {
        let mut lines = Vec::new();
        loop {
            match self.next_line().await {
                Ok(Some(line)) => lines.push(line),
                Ok(None) => return (lines, None),
                Err(e) => return (lines, Some(e)),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn frame(input: &[u8], limit: usize) -> (Vec<String>, Option<FrameError>) {
        LineFramer::new(input, limit).collect_lines().await
    }

    #[tokio::test]
    async fn splits_lines_and_strips_carriage_return() {
        let (lines, err) = frame(b"foo\r\nbar\n", 1024).await;
        assert_eq!(lines, vec!["foo", "bar"]);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn trailing_partial_record_is_discarded() {
        let (lines, err) = frame(b"foo\nbar", 1024).await;
        assert_eq!(lines, vec!["foo"]);
        assert!(err.is_none());

        let (lines, _) = frame(b"no newline at all", 1024).await;
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        let (lines, err) = frame(b"", 1024).await;
        assert!(lines.is_empty());
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn blank_lines_are_records() {
        let (lines, _) = frame(b"\n\r\na\n", 1024).await;
        assert_eq!(lines, vec!["", "", "a"]);
    }

    #[tokio::test]
    async fn only_the_carriage_return_before_newline_is_stripped() {
        let (lines, _) = frame(b"a\rb\r\r\n", 1024).await;
        assert_eq!(lines, vec!["a\rb\r"]);
    }

    #[tokio::test]
    async fn line_at_limit_is_accepted_with_crlf() {
        let (lines, err) = frame(b"abcd\r\n", 4).await;
        assert_eq!(lines, vec!["abcd"]);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn line_over_limit_fails_the_stream() {
        let (lines, err) = frame(b"ok\nabcdef\nnever\n", 4).await;
        assert_eq!(lines, vec!["ok"]);
        assert!(matches!(err, Some(FrameError::LineTooLong { limit: 4 })));
    }

    #[tokio::test]
    async fn unterminated_overflow_fails_before_eof() {
        let input = vec![b'x'; 100];
        let (lines, err) = frame(&input, 10).await;
        assert!(lines.is_empty());
        assert!(matches!(err, Some(FrameError::LineTooLong { limit: 10 })));
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let (lines, _) = frame(b"a\xffb\n", 1024).await;
        assert_eq!(lines, vec!["a\u{fffd}b"]);
    }

    #[tokio::test]
    async fn records_split_across_reads() {
        let (client, mut server) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(b"hello wor").await.unwrap();
            server.write_all(b"ld\r").await.unwrap();
            server.write_all(b"\nsecond\n").await.unwrap();
        });

        let mut framer = LineFramer::new(client, 1024);
        assert_eq!(framer.next_line().await.unwrap().as_deref(), Some("hello world"));
        assert_eq!(framer.next_line().await.unwrap().as_deref(), Some("second"));
        writer.await.unwrap();
        assert!(framer.next_line().await.unwrap().is_none());
    }
}
