mod client;
mod device;
mod error;
mod host;
mod protocol;
mod shell;
mod sync;
mod watcher;

pub use client::{AdbClient, Device};
pub use device::{DeviceDescriptor, DeviceInfo, DeviceState, DeviceStateChangedEvent};
pub use error::{AdbError, AdbResult, ErrorKind};
pub use host::{
    dial_device, BoxConn, ConnStream, HostSession, ServerConfig, ServerStarter, TcpDialer,
    TransportDialer,
};
pub use protocol::{encode_message, parse_hex_length};
pub use shell::{decode_v2, decode_v2_into, decode_v2_strict, ShellOutput};
pub use sync::{
    encode_request, DirEntries, DirEntry, Mtime, SyncFileReader, SyncFileWriter, SyncId,
    SyncSession, SYNC_DATA_MAX,
};
pub use watcher::{diff_states, parse_device_states, DeviceWatcher};
