use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;

use crate::error::{AdbError, AdbResult};
use crate::host::BoxConn;
use crate::protocol;

/// Maximum payload of a single DATA frame (64 KiB), imposed by adbd.
pub const SYNC_DATA_MAX: u32 = 64 * 1024;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;

/// Sync sub-protocol tags. Every frame starts with one of these 4-byte
/// ASCII tags followed by a little-endian u32, unlike the hex-length
/// host framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncId {
    /// Query file metadata.
    Stat,
    /// List directory contents.
    List,
    /// Push a file to the device.
    Send,
    /// Pull a file from the device.
    Recv,
    /// Payload chunk within a transfer.
    Data,
    /// End of a listing or transfer.
    Done,
    /// Success acknowledgment.
    Okay,
    /// Error response.
    Fail,
    /// One directory entry in a LIST response.
    Dent,
}

impl SyncId {
    pub fn as_bytes(&self) -> &[u8; 4] {
        match self {
            SyncId::Stat => b"STAT",
            SyncId::List => b"LIST",
            SyncId::Send => b"SEND",
            SyncId::Recv => b"RECV",
            SyncId::Data => b"DATA",
            SyncId::Done => b"DONE",
            SyncId::Okay => b"OKAY",
            SyncId::Fail => b"FAIL",
            SyncId::Dent => b"DENT",
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> AdbResult<SyncId> {
        if bytes.len() < 4 {
            return Err(AdbError::Parse(format!(
                "sync tag too short: {} bytes, need 4",
                bytes.len()
            )));
        }
        match &bytes[..4] {
            b"STAT" => Ok(SyncId::Stat),
            b"LIST" => Ok(SyncId::List),
            b"SEND" => Ok(SyncId::Send),
            b"RECV" => Ok(SyncId::Recv),
            b"DATA" => Ok(SyncId::Data),
            b"DONE" => Ok(SyncId::Done),
            b"OKAY" => Ok(SyncId::Okay),
            b"FAIL" => Ok(SyncId::Fail),
            b"DENT" => Ok(SyncId::Dent),
            other => Err(AdbError::Parse(format!(
                "unknown sync tag: {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Frame a sync request: tag + LE payload length + payload.
pub fn encode_request(id: SyncId, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(id.as_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Modification time to stamp on a pushed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mtime {
    /// Use the wall-clock time at which the writer is closed.
    TimeOfClose,
    /// A fixed Unix timestamp in seconds.
    At(u32),
}

impl Mtime {
    fn resolve(self) -> u32 {
        match self {
            Mtime::At(seconds) => seconds,
            Mtime::TimeOfClose => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or_default(),
        }
    }
}

/// One file or directory on the device. `stat` responses carry no name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

impl DirEntry {
    pub fn is_file(&self) -> bool {
        (self.mode & S_IFMT) == S_IFREG
    }

    pub fn is_directory(&self) -> bool {
        (self.mode & S_IFMT) == S_IFDIR
    }

    /// The permission bits (lower 12 bits of the mode).
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// A connection switched into sync mode. The session owns the connection
/// exclusively; closing the session closes the socket. Requests and
/// responses are strictly serial: one request must be fully drained
/// before the next is issued.
pub struct SyncSession {
    conn: BoxConn,
    close_result: Option<AdbResult<()>>,
}

impl SyncSession {
    /// Wrap a connection that has already been switched into sync mode
    /// (transport selected, `sync:` acknowledged).
    pub fn new(conn: BoxConn) -> SyncSession {
        SyncSession {
            conn,
            close_result: None,
        }
    }

    /// Send `STAT` for `path`. The response carries mode, size and mtime
    /// but no name; a nonexistent path yields all-zero fields.
    pub async fn stat(&mut self, path: &str) -> AdbResult<DirEntry> {
        self.send_frame(SyncId::Stat, path.as_bytes()).await?;
        match self.read_tag().await? {
            SyncId::Stat => {
                let mode = self.read_le_u32("stat mode").await?;
                let size = self.read_le_u32("stat size").await?;
                let mtime = self.read_le_u32("stat mtime").await?;
                Ok(DirEntry {
                    name: String::new(),
                    mode,
                    size,
                    mtime,
                })
            }
            SyncId::Fail => Err(self.read_fail("stat").await?),
            other => Err(unexpected_tag("STAT", other)),
        }
    }

    /// Send `LIST` for `path` and hand back a cursor over the DENT frames.
    pub async fn list_dir(mut self, path: &str) -> AdbResult<DirEntries> {
        self.send_frame(SyncId::List, path.as_bytes()).await?;
        Ok(DirEntries {
            session: self,
            finished: false,
        })
    }

    /// Send `RECV` for `path` and hand back a reader over the DATA frames.
    pub async fn open_read(mut self, path: &str) -> AdbResult<SyncFileReader> {
        self.send_frame(SyncId::Recv, path.as_bytes()).await?;
        Ok(SyncFileReader {
            session: self,
            pending: Vec::new(),
            offset: 0,
            eof: false,
        })
    }

    /// Send `SEND` for `path` and hand back a writer. `perms` is a Unix
    /// permission set; the regular-file type bits are added when no type
    /// bits are present.
    pub async fn open_write(
        mut self,
        path: &str,
        perms: u32,
        mtime: Mtime,
    ) -> AdbResult<SyncFileWriter> {
        let mode = if perms & S_IFMT == 0 {
            perms | S_IFREG
        } else {
            perms
        };
        let request = format!("{},{}", path, mode);
        self.send_frame(SyncId::Send, request.as_bytes()).await?;
        Ok(SyncFileWriter {
            session: self,
            mtime,
            close_result: None,
        })
    }

    pub async fn close(&mut self) -> AdbResult<()> {
        if let Some(result) = &self.close_result {
            return result.clone();
        }
        let result = self
            .conn
            .shutdown()
            .await
            .map_err(|err| AdbError::Network(format!("error closing sync connection: {}", err)));
        self.close_result = Some(result.clone());
        result
    }

    async fn send_frame(&mut self, id: SyncId, payload: &[u8]) -> AdbResult<()> {
        protocol::write_all(&mut self.conn, &encode_request(id, payload)).await
    }

    async fn read_tag(&mut self) -> AdbResult<SyncId> {
        let mut tag = [0u8; 4];
        protocol::read_exact(&mut self.conn, &mut tag, "sync tag").await?;
        SyncId::from_bytes(&tag)
    }

    async fn read_le_u32(&mut self, what: &str) -> AdbResult<u32> {
        let mut buf = [0u8; 4];
        protocol::read_exact(&mut self.conn, &mut buf, what).await?;
        Ok(u32::from_le_bytes(buf))
    }

    async fn read_payload(&mut self, len: usize, what: &str) -> AdbResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        if len > 0 {
            protocol::read_exact(&mut self.conn, &mut buf, what).await?;
        }
        Ok(buf)
    }

    /// Reads the message of a FAIL frame and builds the classified error.
    async fn read_fail(&mut self, request: &str) -> AdbResult<AdbError> {
        let len = self.read_le_u32("failure length").await? as usize;
        let message = self.read_payload(len, "failure message").await?;
        Ok(AdbError::server_error(
            request,
            String::from_utf8_lossy(&message).into_owned(),
        ))
    }
}

fn unexpected_tag(expected: &str, actual: SyncId) -> AdbError {
    AdbError::Parse(format!(
        "expected {} response, got {:?}",
        expected,
        String::from_utf8_lossy(actual.as_bytes())
    ))
}

/// Lazy cursor over one LIST response. Owns the session for its lifetime;
/// dropping it mid-listing closes the socket, which releases the
/// server side of the LIST.
pub struct DirEntries {
    session: SyncSession,
    finished: bool,
}

impl DirEntries {
    /// Next entry, or `None` once the terminating DONE frame is seen.
    pub async fn next_entry(&mut self) -> AdbResult<Option<DirEntry>> {
        if self.finished {
            return Ok(None);
        }
        match self.session.read_tag().await? {
            SyncId::Dent => {
                let mode = self.session.read_le_u32("dent mode").await?;
                let size = self.session.read_le_u32("dent size").await?;
                let mtime = self.session.read_le_u32("dent mtime").await?;
                let name_len = self.session.read_le_u32("dent name length").await? as usize;
                let name = self.session.read_payload(name_len, "dent name").await?;
                Ok(Some(DirEntry {
                    name: String::from_utf8_lossy(&name).into_owned(),
                    mode,
                    size,
                    mtime,
                }))
            }
            SyncId::Done => {
                // The DONE terminator carries the dent field layout with
                // zeroed values; consume and discard them.
                for what in ["done mode", "done size", "done mtime", "done name length"] {
                    self.session.read_le_u32(what).await?;
                }
                self.finished = true;
                let _ = self.session.close().await;
                Ok(None)
            }
            SyncId::Fail => {
                self.finished = true;
                Err(self.session.read_fail("list").await?)
            }
            other => {
                self.finished = true;
                Err(unexpected_tag("DENT or DONE", other))
            }
        }
    }

    /// Drain the remaining entries into a vector.
    pub async fn collect(mut self) -> AdbResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry().await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    pub async fn close(&mut self) -> AdbResult<()> {
        self.session.close().await
    }
}

/// Streams the DATA frames of a RECV response. Frame payloads are
/// buffered across reads, so callers may consume them in any chunk size.
pub struct SyncFileReader {
    session: SyncSession,
    pending: Vec<u8>,
    offset: usize,
    eof: bool,
}

impl SyncFileReader {
    /// Read up to `out.len()` bytes. Returns 0 only at end of file.
    pub async fn read(&mut self, out: &mut [u8]) -> AdbResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.offset == self.pending.len() {
            if self.eof {
                return Ok(0);
            }
            self.fill().await?;
        }
        let available = &self.pending[self.offset..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }

    /// Drain the whole stream into a vector.
    pub async fn read_to_end(&mut self) -> AdbResult<Vec<u8>> {
        let mut data = Vec::new();
        loop {
            let chunk = self.next_chunk().await?;
            match chunk {
                Some(bytes) => data.extend_from_slice(&bytes),
                None => return Ok(data),
            }
        }
    }

    /// The next unconsumed span of payload bytes, or `None` at EOF.
    pub(crate) async fn next_chunk(&mut self) -> AdbResult<Option<Vec<u8>>> {
        while self.offset == self.pending.len() {
            if self.eof {
                return Ok(None);
            }
            self.fill().await?;
        }
        let chunk = self.pending.split_off(self.offset);
        self.pending.clear();
        self.offset = 0;
        Ok(Some(chunk))
    }

    async fn fill(&mut self) -> AdbResult<()> {
        match self.session.read_tag().await? {
            SyncId::Data => {
                let len = self.session.read_le_u32("data length").await?;
                if len > SYNC_DATA_MAX {
                    return Err(AdbError::Parse(format!(
                        "data chunk of {} bytes exceeds the {} byte limit",
                        len, SYNC_DATA_MAX
                    )));
                }
                self.pending = self.session.read_payload(len as usize, "data chunk").await?;
                self.offset = 0;
                Ok(())
            }
            SyncId::Done => {
                // DONE carries a zeroed length field.
                self.session.read_le_u32("done length").await?;
                self.eof = true;
                let _ = self.session.close().await;
                Ok(())
            }
            SyncId::Fail => {
                self.eof = true;
                Err(self.session.read_fail("recv").await?)
            }
            other => {
                self.eof = true;
                Err(unexpected_tag("DATA or DONE", other))
            }
        }
    }

    pub async fn close(&mut self) -> AdbResult<()> {
        self.session.close().await
    }
}

/// Writes a file as a stream of DATA frames, finished by DONE + mtime and
/// the server's OKAY/FAIL verdict.
pub struct SyncFileWriter {
    session: SyncSession,
    mtime: Mtime,
    close_result: Option<AdbResult<()>>,
}

impl SyncFileWriter {
    /// Append bytes to the remote file. Splits into frames of at most
    /// 64 KiB; an empty slice writes nothing.
    pub async fn write(&mut self, data: &[u8]) -> AdbResult<()> {
        if self.close_result.is_some() {
            return Err(AdbError::Assertion("write after close".into()));
        }
        for chunk in data.chunks(SYNC_DATA_MAX as usize) {
            self.session.send_frame(SyncId::Data, chunk).await?;
        }
        Ok(())
    }

    /// Finish the transfer: send DONE with the modification time, then
    /// read the server's verdict. Idempotent; the first result is cached.
    pub async fn close(&mut self) -> AdbResult<()> {
        if let Some(result) = &self.close_result {
            return result.clone();
        }
        let result = self.finish().await;
        self.close_result = Some(result.clone());
        let _ = self.session.close().await;
        result
    }

    async fn finish(&mut self) -> AdbResult<()> {
        let mut done = Vec::with_capacity(8);
        done.extend_from_slice(SyncId::Done.as_bytes());
        done.extend_from_slice(&self.mtime.resolve().to_le_bytes());
        protocol::write_all(&mut self.session.conn, &done).await?;

        match self.session.read_tag().await? {
            SyncId::Okay => {
                // OKAY carries a zeroed length field.
                self.session.read_le_u32("okay length").await?;
                Ok(())
            }
            SyncId::Fail => Err(self.session.read_fail("send").await?),
            other => Err(unexpected_tag("OKAY", other)),
        }
    }
}
