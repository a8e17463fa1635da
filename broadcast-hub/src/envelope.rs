use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest line, delimiter included, accepted from a peer.
pub const MAX_LINE_BYTES: u64 = 1024 * 1024;

/// One unit of wire traffic: a kind tag plus a payload the hub never inspects.
///
/// Serialized as a single JSON object `{"type": ..., "payload": ...}` on its
/// own line. A missing `payload` decodes as `null` and unknown top-level
/// fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    /// An envelope with a `null` payload.
    pub fn bare(kind: impl Into<String>) -> Self {
        Self::new(kind, Value::Null)
    }
}

/// Encodes an envelope as compact JSON followed by the `\n` delimiter.
///
/// Compact output escapes control characters, so the only raw newline in the
/// result is the trailing delimiter.
pub fn encode_line(envelope: &Envelope) -> serde_json::Result<Vec<u8>> {
    let mut encoded = serde_json::to_vec(envelope)?;
    encoded.push(b'\n');
    Ok(encoded)
}

/// Reads the next envelope, returning `Ok(None)` once the peer closes the stream.
///
/// Blank lines are skipped. A line that is not a valid envelope, or that
/// runs past [`MAX_LINE_BYTES`] without a delimiter, yields an error of kind
/// [`io::ErrorKind::InvalidData`].
pub async fn read_envelope<R>(reader: &mut R) -> io::Result<Option<Envelope>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if !line.ends_with(b"\n") && bytes as u64 == MAX_LINE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {MAX_LINE_BYTES} bytes"),
            ));
        }

        let trimmed = line.trim_ascii_end();
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_slice(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode_line(envelope).map_err(to_io_error)?;
    write_line(writer, &encoded).await
}

/// Writes an already encoded line in full and flushes it.
pub async fn write_line<W>(writer: &mut W, line: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(line).await?;
    writer.flush().await
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
