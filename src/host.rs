use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::device::DeviceDescriptor;
use crate::error::{AdbError, AdbResult};
use crate::protocol;

/// A bidirectional byte stream to the ADB server.
pub trait ConnStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnStream for T {}

pub type BoxConn = Box<dyn ConnStream>;

/// Capability to open a fresh connection to the ADB server. The default
/// implementation dials TCP; tests substitute scripted streams.
pub trait TransportDialer: Send + Sync {
    fn dial(&self) -> BoxFuture<'_, AdbResult<BoxConn>>;
}

/// Capability to (re)start the ADB server daemon. Process management is
/// the caller's concern; the watcher only invokes this when the server
/// socket is unreachable.
pub trait ServerStarter: Send + Sync {
    fn start_server(&self) -> BoxFuture<'_, AdbResult<()>>;
}

/// Address of the ADB server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 5037)
    }
}

/// Dials the ADB server over TCP.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    config: ServerConfig,
}

impl TcpDialer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }
}

impl TransportDialer for TcpDialer {
    fn dial(&self) -> BoxFuture<'_, AdbResult<BoxConn>> {
        Box::pin(async move {
            let addr = self.config.addr();
            debug!("connecting to ADB server at {}", addr);
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|err| AdbError::ServerNotAvailable(format!("{}: {}", addr, err)))?;
            Ok(Box::new(stream) as BoxConn)
        })
    }
}

/// One connection to the ADB server, good for a single request/response
/// cycle unless switched into a raw stream mode.
pub struct HostSession {
    conn: BoxConn,
    close_result: Option<AdbResult<()>>,
}

impl HostSession {
    pub async fn open(dialer: &dyn TransportDialer) -> AdbResult<HostSession> {
        let conn = dialer.dial().await?;
        Ok(Self::from_conn(conn))
    }

    pub(crate) fn from_conn(conn: BoxConn) -> HostSession {
        HostSession {
            conn,
            close_result: None,
        }
    }

    /// Send `request` and read the status word; on FAIL the framed error
    /// message is read and classified.
    pub async fn send(&mut self, request: &str) -> AdbResult<()> {
        debug!("sending request {:?}", request);
        protocol::write_message(&mut self.conn, request).await?;
        protocol::read_status(&mut self.conn, request).await
    }

    /// Send `request`, read the status, then read one framed response body.
    pub async fn round_trip(&mut self, request: &str) -> AdbResult<Vec<u8>> {
        self.send(request).await?;
        protocol::read_message(&mut self.conn).await
    }

    /// Give up host framing: after the status acknowledgement the caller
    /// owns the raw byte stream (shell output, sync mode, track-devices).
    pub fn into_stream(self) -> BoxConn {
        self.conn
    }

    /// Close the underlying socket. Safe to call more than once; the
    /// socket is shut down at most once and the first result is cached.
    pub async fn close(&mut self) -> AdbResult<()> {
        if let Some(result) = &self.close_result {
            return result.clone();
        }
        let result = self
            .conn
            .shutdown()
            .await
            .map_err(|err| AdbError::Network(format!("error closing connection: {}", err)));
        self.close_result = Some(result.clone());
        result
    }
}

/// Open a session and pin it to the device selected by `descriptor`.
/// Afterwards the connection speaks the device-level protocol
/// (`shell:`, `sync:`, `remount`).
pub async fn dial_device(
    dialer: &dyn TransportDialer,
    descriptor: &DeviceDescriptor,
) -> AdbResult<HostSession> {
    let mut session = HostSession::open(dialer).await?;
    let request = format!("host:{}", descriptor.transport_descriptor());
    if let Err(err) = session.send(&request).await {
        let _ = session.close().await;
        return Err(err);
    }
    Ok(session)
}
