use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AdbError, AdbResult};

// The ADB host protocol is a simple length-prefixed text format:
//
// Request:  {4-digit hex length}{payload}
// Response: OKAY[{4-digit hex length}{data}]
//       or: FAIL{4-digit hex length}{error_message}
//
// After certain requests (shell:, sync:, host:track-devices) the
// connection switches modes and this framing no longer applies.

/// Frame a host request: `"{:04X}{payload}"`.
pub fn encode_message(payload: &str) -> Vec<u8> {
    format!("{:04X}{}", payload.len(), payload).into_bytes()
}

/// Parse a 4-character hex length prefix into a `usize`.
pub fn parse_hex_length(buf: &[u8]) -> AdbResult<usize> {
    if buf.len() < 4 {
        return Err(AdbError::Parse(format!(
            "hex length too short: {} bytes, need 4",
            buf.len()
        )));
    }
    let hex = std::str::from_utf8(&buf[..4])
        .map_err(|_| AdbError::Parse(format!("invalid UTF-8 in hex length: {:?}", &buf[..4])))?;
    usize::from_str_radix(hex, 16)
        .map_err(|_| AdbError::Parse(format!("invalid hex length: {:?}", hex)))
}

/// Write one framed host request. A write failure is a network error.
pub async fn write_message<W>(writer: &mut W, payload: &str) -> AdbResult<()>
where
    W: AsyncWrite + Unpin,
{
    write_all(writer, &encode_message(payload)).await
}

/// Read one framed message: exactly 4 hex digits, then exactly that many
/// bytes. The caller sees a whole message or an error, never a partial one.
pub async fn read_message<R>(reader: &mut R) -> AdbResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_exact(reader, &mut len_buf, "message length").await?;
    let len = parse_hex_length(&len_buf)?;
    let mut body = vec![0u8; len];
    if len > 0 {
        read_exact(reader, &mut body, "message body").await?;
    }
    Ok(body)
}

/// Read the 4-byte status word sent after `request`. `OKAY` is success;
/// `FAIL` carries a framed error message which is classified; anything
/// else means the caller and server disagree about the protocol state.
pub async fn read_status<R>(reader: &mut R, request: &str) -> AdbResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut status = [0u8; 4];
    read_exact(reader, &mut status, "status word").await?;
    match &status {
        b"OKAY" => Ok(()),
        b"FAIL" => {
            let message = read_message(reader).await?;
            Err(AdbError::server_error(
                request,
                String::from_utf8_lossy(&message).into_owned(),
            ))
        }
        other => Err(AdbError::Assertion(format!(
            "unexpected status word {:?} for {} request",
            String::from_utf8_lossy(other),
            request
        ))),
    }
}

/// Drain the stream until the peer closes it.
pub async fn read_to_eof<R>(reader: &mut R) -> AdbResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .await
        .map_err(|err| AdbError::ConnectionReset(err.to_string()))?;
    Ok(data)
}

/// Fill `buf` completely. EOF before that is a connection reset, reported
/// with the byte counts so truncation points are diagnosable.
pub(crate) async fn read_exact<R>(reader: &mut R, buf: &mut [u8], what: &str) -> AdbResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|err| AdbError::ConnectionReset(err.to_string()))?;
        if n == 0 {
            return Err(incomplete(what, filled, buf.len()));
        }
        filled += n;
    }
    Ok(())
}

pub(crate) async fn write_all<W>(writer: &mut W, data: &[u8]) -> AdbResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(data)
        .await
        .map_err(|err| AdbError::Network(format!("error writing {} bytes: {}", data.len(), err)))
}

pub(crate) fn incomplete(what: &str, actual: usize, expected: usize) -> AdbError {
    AdbError::ConnectionReset(format!(
        "incomplete {}: read {} bytes, expecting {}",
        what, actual, expected
    ))
}
