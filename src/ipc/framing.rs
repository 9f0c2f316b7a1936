//! JSON Lines framing for the sidecar stdio channels.
//!
//! Each message occupies exactly one line:
//!
//! ```text
//! <compact JSON object>\n
//! ```
//!
//! Readers accept both LF and CRLF terminators. A final line without a
//! terminator before EOF is still delivered.

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum line size (16MB) to prevent OOM from a misbehaving peer.
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Errors produced while reading or writing framed lines.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line exceeded the size limit. The rest of the line was discarded.
    #[error("Line exceeds maximum {max} bytes")]
    TooLarge { max: usize },

    /// A line was not valid UTF-8.
    #[error("Line is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// An outgoing body contained a raw newline and would break framing.
    #[error("Message body contains an embedded newline")]
    EmbeddedNewline,

    /// Serialization of an outgoing message failed.
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl FrameError {
    /// Whether the stream is still positioned at a line boundary and can be
    /// read again after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::TooLarge { .. } | FrameError::InvalidUtf8(_))
    }
}

/// Read one line from the stream.
///
/// Returns `Ok(None)` on EOF. The line terminator (`\n` or `\r\n`) is
/// stripped.
///
/// # Errors
///
/// Returns an error if:
/// - The stream fails (`FrameError::Io`)
/// - The line exceeds `MAX_LINE_SIZE` (`FrameError::TooLarge`, recoverable)
/// - The line is not valid UTF-8 (`FrameError::InvalidUtf8`, recoverable)
///
/// # Example
///
/// ```ignore
/// while let Some(line) = read_line(&mut reader).await? {
///     let value: serde_json::Value = serde_json::from_str(&line)?;
/// }
/// ```
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    read_line_limited(reader, MAX_LINE_SIZE).await
}

async fn read_line_limited<R>(reader: &mut R, max: usize) -> Result<Option<String>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let bytes_read = (&mut *reader)
        .take(max as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;

    if bytes_read == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > max {
        discard_rest_of_line(reader).await?;
        return Err(FrameError::TooLarge { max });
    }

    Ok(Some(String::from_utf8(buf)?))
}

/// Skip bytes up to and including the next newline (or EOF).
async fn discard_rest_of_line<R>(reader: &mut R) -> Result<(), FrameError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

/// Write one framed line and flush.
///
/// The body and its terminator go out in a single `write_all`, so callers
/// that serialize access to the writer never interleave partial lines.
///
/// # Errors
///
/// Returns `FrameError::EmbeddedNewline` if `body` contains `\n`, or
/// `FrameError::Io` if the write or flush fails.
pub async fn write_line<W>(writer: &mut W, body: &str) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if body.contains('\n') {
        return Err(FrameError::EmbeddedNewline);
    }

    let mut line = String::with_capacity(body.len() + 1);
    line.push_str(body);
    line.push('\n');

    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;

    Ok(())
}

/// Serialize `message` as compact JSON and write it as one line.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_string(message)?;
    write_line(writer, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, BufReader};
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (mut client, server) = duplex(1024);
        let message = r#"{"id":"req-1","method":"health"}"#;

        write_line(&mut client, message).await.expect("Write failed");

        let mut reader = BufReader::new(server);
        let received = timeout(TEST_TIMEOUT, read_line(&mut reader))
            .await
            .expect("Test timed out")
            .expect("Read failed");

        assert_eq!(received.as_deref(), Some(message));
    }

    #[tokio::test]
    async fn test_read_handles_crlf_and_lf() {
        let mut reader: &[u8] = b"{\"a\":1}\r\n{\"b\":2}\n";

        let first = read_line(&mut reader).await.expect("Read failed");
        let second = read_line(&mut reader).await.expect("Read failed");
        let eof = read_line(&mut reader).await.expect("Read failed");

        assert_eq!(first.as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(second.as_deref(), Some(r#"{"b":2}"#));
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn test_read_unterminated_final_line() {
        let mut reader: &[u8] = b"{\"last\":true}";

        let line = read_line(&mut reader).await.expect("Read failed");
        assert_eq!(line.as_deref(), Some(r#"{"last":true}"#));
        assert_eq!(read_line(&mut reader).await.expect("Read failed"), None);
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped() {
        let mut reader: &[u8] = b"0123456789abcdef\n{\"ok\":1}\n";

        let result = read_line_limited(&mut reader, 8).await;
        match result {
            Err(err @ FrameError::TooLarge { max: 8 }) => assert!(err.is_recoverable()),
            other => panic!("Expected TooLarge, got {:?}", other),
        }

        // The stream resynchronizes on the next line.
        let next = read_line_limited(&mut reader, 8).await.expect("Read failed");
        assert_eq!(next.as_deref(), Some(r#"{"ok":1}"#));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_recoverable() {
        let mut reader: &[u8] = b"\xff\xfe\n{}\n";

        let err = read_line(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidUtf8(_)));
        assert!(err.is_recoverable());

        let next = read_line(&mut reader).await.expect("Read failed");
        assert_eq!(next.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_write_rejects_embedded_newline() {
        let mut sink = Vec::new();
        let err = write_line(&mut sink, "{\n}").await.unwrap_err();

        assert!(matches!(err, FrameError::EmbeddedNewline));
        assert!(sink.is_empty(), "Nothing should be written");
    }

    #[tokio::test]
    async fn test_write_message_is_single_line() {
        let mut sink = Vec::new();
        let value = serde_json::json!({"text": "line one\nline two"});

        write_message(&mut sink, &value).await.expect("Write failed");

        let written = String::from_utf8(sink).unwrap();
        assert_eq!(written.matches('\n').count(), 1);
        assert!(written.ends_with('\n'));
        assert!(written.contains(r"line one\nline two"));
    }

    #[tokio::test]
    async fn test_closed_stream_returns_none() {
        let (client, server) = duplex(64);
        drop(client);

        let mut reader = BufReader::new(server);
        let result = timeout(TEST_TIMEOUT, read_line(&mut reader))
            .await
            .expect("Test timed out")
            .expect("Read failed");

        assert_eq!(result, None);
    }
}
