use std::io::Write;

use crate::error::{AdbError, AdbResult};

// The v2 shell stream is a flat concatenation of packets:
//
//   [u8 packetId][u32 LE length][length bytes payload]
//
// Legacy shell output has no framing at all; the whole stream is stdout.

const ID_STDOUT: u8 = 1;
const ID_STDERR: u8 = 2;
const ID_EXIT: u8 = 3;

const HEADER_LEN: usize = 5;

/// Demultiplexed output of one v2 shell invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the stream ended without an exit packet.
    pub exit_status: Option<u8>,
}

impl ShellOutput {
    /// The exit code, defaulting to 0 when no exit packet was observed.
    pub fn exit_code(&self) -> u8 {
        self.exit_status.unwrap_or(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Decode a complete v2 stream. A trailing partial packet (short header,
/// or a header claiming more body than remains) is appended to stdout
/// verbatim; servers are known to close mid-packet.
pub fn decode_v2(data: &[u8]) -> AdbResult<ShellOutput> {
    decode(data, false)
}

/// Like [`decode_v2`], but a truncated tail is a parse error instead of
/// stdout bytes. Useful when validating a server rather than talking to
/// one.
pub fn decode_v2_strict(data: &[u8]) -> AdbResult<ShellOutput> {
    decode(data, true)
}

fn decode(data: &[u8], strict: bool) -> AdbResult<ShellOutput> {
    let mut output = ShellOutput::default();
    let exit_status = decode_v2_into(data, &mut output.stdout, &mut output.stderr, strict)?;
    output.exit_status = exit_status;
    Ok(output)
}

/// Sink-based decoder core: forwards stdout/stderr payloads to the given
/// writers and returns the exit status, if any packet carried one.
pub fn decode_v2_into<O, E>(
    data: &[u8],
    stdout: &mut O,
    stderr: &mut E,
    strict: bool,
) -> AdbResult<Option<u8>>
where
    O: Write,
    E: Write,
{
    let mut exit_status = None;
    let mut offset = 0;

    while offset < data.len() {
        if data.len() - offset < HEADER_LEN {
            return tail(&data[offset..], stdout, strict).map(|()| exit_status);
        }

        let id = data[offset];
        let len = u32::from_le_bytes([
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
            data[offset + 4],
        ]) as usize;

        if data.len() - offset - HEADER_LEN < len {
            return tail(&data[offset..], stdout, strict).map(|()| exit_status);
        }

        let payload = &data[offset + HEADER_LEN..offset + HEADER_LEN + len];
        offset += HEADER_LEN + len;

        match id {
            ID_STDOUT => write_sink(stdout, payload)?,
            ID_STDERR => write_sink(stderr, payload)?,
            ID_EXIT => {
                if let Some(&status) = payload.first() {
                    exit_status = Some(status);
                }
            }
            other => {
                return Err(AdbError::Parse(format!("unknown shell packet id: {}", other)));
            }
        }
    }

    Ok(exit_status)
}

fn tail<O: Write>(rest: &[u8], stdout: &mut O, strict: bool) -> AdbResult<()> {
    if strict {
        return Err(AdbError::Parse(format!(
            "truncated shell packet: {} trailing bytes",
            rest.len()
        )));
    }
    write_sink(stdout, rest)
}

fn write_sink<W: Write>(sink: &mut W, data: &[u8]) -> AdbResult<()> {
    sink.write_all(data)
        .map_err(|err| AdbError::Network(format!("error writing shell output: {}", err)))
}
