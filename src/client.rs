use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::device::{DeviceDescriptor, DeviceInfo, DeviceState};
use crate::error::{AdbError, AdbResult, ErrorKind};
use crate::host::{
    dial_device, HostSession, ServerConfig, ServerStarter, TcpDialer, TransportDialer,
};
use crate::shell::{self, ShellOutput};
use crate::sync::{DirEntries, DirEntry, Mtime, SyncFileReader, SyncFileWriter, SyncSession, SYNC_DATA_MAX};
use crate::watcher::DeviceWatcher;
use crate::protocol;

/// Client for the ADB server's host protocol.
///
/// Every operation opens a fresh connection to the server; connections
/// are one-shot, matching the real adb client. The handle itself is
/// cheap to clone and safe to share across tasks.
#[derive(Clone)]
pub struct AdbClient {
    dialer: Arc<dyn TransportDialer>,
    starter: Option<Arc<dyn ServerStarter>>,
}

impl AdbClient {
    /// Client for the default server at `127.0.0.1:5037`.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_address(host: &str, port: u16) -> Self {
        Self::with_config(ServerConfig::new(host, port))
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self::with_dialer(Arc::new(TcpDialer::new(config)))
    }

    /// Client over a custom transport capability.
    pub fn with_dialer(dialer: Arc<dyn TransportDialer>) -> Self {
        Self {
            dialer,
            starter: None,
        }
    }

    /// Install the capability the device watcher uses to restart an
    /// unreachable server.
    pub fn server_starter(mut self, starter: Arc<dyn ServerStarter>) -> Self {
        self.starter = Some(starter);
        self
    }

    async fn round_trip(&self, request: &str) -> AdbResult<Vec<u8>> {
        let mut session = HostSession::open(self.dialer.as_ref()).await?;
        let result = session.round_trip(request).await;
        let _ = session.close().await;
        result
    }

    /// The ADB server's protocol version.
    pub async fn server_version(&self) -> AdbResult<u32> {
        let body = self.round_trip("host:version").await?;
        let hex = std::str::from_utf8(&body)
            .map_err(|_| AdbError::Parse(format!("invalid UTF-8 in version response: {:?}", body)))?;
        u32::from_str_radix(hex, 16)
            .map_err(|_| AdbError::Parse(format!("invalid version hex: {:?}", hex)))
    }

    /// Serial numbers of all known devices.
    pub async fn list_device_serials(&self) -> AdbResult<Vec<String>> {
        let body = self.round_trip("host:devices").await?;
        let text = String::from_utf8_lossy(&body);
        let mut serials = Vec::new();
        for line in text.lines().filter(|line| !line.is_empty()) {
            let Some((serial, _state)) = line.split_once('\t') else {
                return Err(AdbError::Parse(format!("invalid device line: {}", line)));
            };
            serials.push(serial.to_string());
        }
        Ok(serials)
    }

    /// All known devices, with the extended fields of `host:devices-l`.
    pub async fn list_devices(&self) -> AdbResult<Vec<DeviceInfo>> {
        list_devices(self.dialer.as_ref()).await
    }

    /// Ask the server to exit. The server often dies before finishing the
    /// goodbye, so a reset connection counts as success.
    pub async fn kill(&self) -> AdbResult<()> {
        let mut session = HostSession::open(self.dialer.as_ref()).await?;
        let result = match session.send("host:kill").await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::ConnectionReset => Ok(()),
            Err(err) => Err(err),
        };
        let _ = session.close().await;
        result
    }

    /// A handle for the device selected by `descriptor`.
    pub fn device(&self, descriptor: DeviceDescriptor) -> Device {
        Device {
            dialer: self.dialer.clone(),
            descriptor,
        }
    }

    /// Start tracking device connect/disconnect/state-change events.
    pub fn track_devices(&self) -> DeviceWatcher {
        DeviceWatcher::spawn(self.dialer.clone(), self.starter.clone())
    }
}

impl Default for AdbClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn list_devices(dialer: &dyn TransportDialer) -> AdbResult<Vec<DeviceInfo>> {
    let mut session = HostSession::open(dialer).await?;
    let result = session.round_trip("host:devices-l").await;
    let _ = session.close().await;
    let body = result?;
    DeviceInfo::parse_device_list(&String::from_utf8_lossy(&body))
}

/// Handle for one device. Stateless: every call dials the server anew,
/// so concurrent operations on the same device never share a connection.
#[derive(Clone)]
pub struct Device {
    dialer: Arc<dyn TransportDialer>,
    descriptor: DeviceDescriptor,
}

impl Device {
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Run `<host-prefix>:<attr>` and return the body as text.
    async fn attribute(&self, attr: &str) -> AdbResult<String> {
        let request = format!("{}:{}", self.descriptor.host_prefix(), attr);
        let mut session = HostSession::open(self.dialer.as_ref()).await?;
        let result = session.round_trip(&request).await;
        let _ = session.close().await;
        let body = result?;
        String::from_utf8(body)
            .map_err(|err| AdbError::Parse(format!("attribute {} is not UTF-8: {}", attr, err)))
    }

    fn wrap<T>(&self, operation: &str, result: AdbResult<T>) -> AdbResult<T> {
        result.map_err(|err| err.context(operation, &self.descriptor))
    }

    pub async fn serial(&self) -> AdbResult<String> {
        let result = self.attribute("get-serialno").await;
        self.wrap("Serial", result)
    }

    pub async fn device_path(&self) -> AdbResult<String> {
        let result = self.attribute("get-devpath").await;
        self.wrap("DevicePath", result)
    }

    /// The device's current state. An unauthorized device makes the
    /// server FAIL the query; that specific failure is a state, not an
    /// error.
    pub async fn state(&self) -> AdbResult<DeviceState> {
        match self.attribute("get-state").await {
            Ok(token) => Ok(DeviceState::parse(&token)),
            Err(err) if err.to_string().contains("unauthorized") => {
                Ok(DeviceState::Unauthorized)
            }
            Err(err) => Err(err.context("State", &self.descriptor)),
        }
    }

    /// Full info for this device. The server has no per-device query for
    /// this, so we list all devices and find ourselves.
    pub async fn device_info(&self) -> AdbResult<DeviceInfo> {
        let result = self.device_info_inner().await;
        self.wrap("DeviceInfo", result)
    }

    async fn device_info_inner(&self) -> AdbResult<DeviceInfo> {
        let serial = self.attribute("get-serialno").await?;
        let devices = list_devices(self.dialer.as_ref()).await?;
        devices
            .into_iter()
            .find(|device| device.serial == serial)
            .ok_or_else(|| AdbError::DeviceNotFound {
                request: "host:devices-l".into(),
                message: format!("device list doesn't contain serial {}", serial),
            })
    }

    /// Run a non-interactive shell command and capture its output.
    ///
    /// Arguments are quoted per the server's rules: an argument with
    /// whitespace is wrapped in double quotes, and arguments must not
    /// themselves contain double quotes.
    pub async fn run_command(&self, cmd: &str, args: &[&str]) -> AdbResult<String> {
        let result = self.run_command_inner(cmd, args).await;
        self.wrap("RunCommand", result)
    }

    async fn run_command_inner(&self, cmd: &str, args: &[&str]) -> AdbResult<String> {
        let line = prepare_command_line(cmd, args)?;
        let mut session = dial_device(self.dialer.as_ref(), &self.descriptor).await?;
        session.send(&format!("shell:{}", line)).await?;
        // Shell responses carry no length header; read until the server
        // closes the stream.
        let mut stream = session.into_stream();
        let output = protocol::read_to_eof(&mut stream).await?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Run a shell command over the v2 protocol, which multiplexes
    /// stdout, stderr and the exit status.
    pub async fn run_command_v2(&self, cmd: &str, args: &[&str]) -> AdbResult<ShellOutput> {
        let result = self.run_command_v2_inner(cmd, args).await;
        self.wrap("RunCommandV2", result)
    }

    async fn run_command_v2_inner(&self, cmd: &str, args: &[&str]) -> AdbResult<ShellOutput> {
        let line = prepare_command_line(cmd, args)?;
        let mut session = dial_device(self.dialer.as_ref(), &self.descriptor).await?;
        session
            .send(&format!("shell,v2,TERM=xterm-256color,raw:{}", line))
            .await?;
        let mut stream = session.into_stream();
        let output = protocol::read_to_eof(&mut stream).await?;
        shell::decode_v2(&output)
    }

    /// Remount the device's filesystem read-write. May be refused by
    /// builds that don't allow it; the server's answer is returned as-is.
    pub async fn remount(&self) -> AdbResult<String> {
        let result = self.remount_inner().await;
        self.wrap("Remount", result)
    }

    async fn remount_inner(&self) -> AdbResult<String> {
        let mut session = dial_device(self.dialer.as_ref(), &self.descriptor).await?;
        let result = session.round_trip("remount").await;
        let _ = session.close().await;
        Ok(String::from_utf8_lossy(&result?).into_owned())
    }

    async fn sync_session(&self) -> AdbResult<SyncSession> {
        let mut session = dial_device(self.dialer.as_ref(), &self.descriptor).await?;
        if let Err(err) = session.send("sync:").await {
            let _ = session.close().await;
            return Err(err);
        }
        Ok(SyncSession::new(session.into_stream()))
    }

    pub async fn stat(&self, path: &str) -> AdbResult<DirEntry> {
        let result = self.stat_inner(path).await;
        self.wrap(&format!("Stat({})", path), result)
    }

    async fn stat_inner(&self, path: &str) -> AdbResult<DirEntry> {
        check_remote_path(path)?;
        let mut sync = self.sync_session().await?;
        let result = sync.stat(path).await;
        let _ = sync.close().await;
        result
    }

    /// Lazily list a directory. The returned cursor owns its connection.
    pub async fn list_dir_entries(&self, path: &str) -> AdbResult<DirEntries> {
        let result = self.list_dir_entries_inner(path).await;
        self.wrap(&format!("ListDirEntries({})", path), result)
    }

    async fn list_dir_entries_inner(&self, path: &str) -> AdbResult<DirEntries> {
        check_remote_path(path)?;
        let sync = self.sync_session().await?;
        sync.list_dir(path).await
    }

    /// Open a remote file for reading.
    pub async fn open_read(&self, path: &str) -> AdbResult<SyncFileReader> {
        let result = self.open_read_inner(path).await;
        self.wrap(&format!("OpenRead({})", path), result)
    }

    async fn open_read_inner(&self, path: &str) -> AdbResult<SyncFileReader> {
        check_remote_path(path)?;
        let sync = self.sync_session().await?;
        sync.open_read(path).await
    }

    /// Open a remote file for writing, creating it with `perms` if
    /// needed. The file's modification time is set from `mtime` when the
    /// writer is closed.
    pub async fn open_write(
        &self,
        path: &str,
        perms: u32,
        mtime: Mtime,
    ) -> AdbResult<SyncFileWriter> {
        let result = self.open_write_inner(path, perms, mtime).await;
        self.wrap(&format!("OpenWrite({})", path), result)
    }

    async fn open_write_inner(
        &self,
        path: &str,
        perms: u32,
        mtime: Mtime,
    ) -> AdbResult<SyncFileWriter> {
        check_remote_path(path)?;
        let sync = self.sync_session().await?;
        sync.open_write(path, perms, mtime).await
    }

    /// Copy a remote file into `writer`.
    pub async fn pull<W>(&self, path: &str, writer: &mut W) -> AdbResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let result = self.pull_inner(path, writer).await;
        self.wrap(&format!("Pull({})", path), result)
    }

    async fn pull_inner<W>(&self, path: &str, writer: &mut W) -> AdbResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        check_remote_path(path)?;
        let mut reader = self.open_read_inner(path).await?;
        loop {
            match reader.next_chunk().await? {
                Some(chunk) => {
                    writer.write_all(&chunk).await.map_err(|err| {
                        AdbError::Network(format!("error writing pulled data: {}", err))
                    })?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Copy `reader` into a remote file, created with mode 0644 and the
    /// close time as its modification time.
    pub async fn push<R>(&self, reader: &mut R, path: &str) -> AdbResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let result = self.push_inner(reader, path).await;
        self.wrap(&format!("Push({})", path), result)
    }

    async fn push_inner<R>(&self, reader: &mut R, path: &str) -> AdbResult<()>
    where
        R: AsyncRead + Unpin,
    {
        check_remote_path(path)?;
        let mut writer = self
            .open_write_inner(path, 0o644, Mtime::TimeOfClose)
            .await?;
        let mut buf = vec![0u8; SYNC_DATA_MAX as usize];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|err| AdbError::Network(format!("error reading push source: {}", err)))?;
            if n == 0 {
                break;
            }
            writer.write(&buf[..n]).await?;
        }
        writer.close().await
    }
}

/// Validate and join a command line the way the server expects:
/// arguments are space-separated, whitespace-bearing arguments are
/// double-quoted, and double quotes themselves are forbidden.
fn prepare_command_line(cmd: &str, args: &[&str]) -> AdbResult<String> {
    if cmd.trim().is_empty() {
        return Err(AdbError::Assertion("command cannot be empty".into()));
    }
    let mut line = String::from(cmd);
    for (index, arg) in args.iter().enumerate() {
        if arg.contains('"') {
            return Err(AdbError::Parse(format!(
                "arg at index {} contains an invalid double quote: {}",
                index, arg
            )));
        }
        line.push(' ');
        if arg.chars().any(|c| c.is_ascii_whitespace()) {
            line.push('"');
            line.push_str(arg);
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }
    Ok(line)
}

fn check_remote_path(path: &str) -> AdbResult<()> {
    if path.is_empty() {
        return Err(AdbError::Assertion("remote path cannot be empty".into()));
    }
    Ok(())
}
