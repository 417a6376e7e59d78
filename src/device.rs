use std::fmt;

use crate::error::{AdbError, AdbResult};

/// Selects which device a connection should be pinned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDescriptor {
    /// Whichever single device is connected.
    Any,
    /// Whichever single USB device is connected.
    AnyUsb,
    /// Whichever single emulator is connected.
    AnyLocal,
    /// The device with this serial number.
    Serial(String),
}

impl DeviceDescriptor {
    /// Prefix for attribute queries (`<prefix>:get-serialno` etc).
    pub fn host_prefix(&self) -> String {
        match self {
            DeviceDescriptor::Any => "host".to_string(),
            DeviceDescriptor::AnyUsb => "host-usb".to_string(),
            DeviceDescriptor::AnyLocal => "host-local".to_string(),
            DeviceDescriptor::Serial(serial) => format!("host-serial:{}", serial),
        }
    }

    /// Argument for the `host:<transport>` request that pins a connection
    /// to one device.
    pub fn transport_descriptor(&self) -> String {
        match self {
            DeviceDescriptor::Any => "transport-any".to_string(),
            DeviceDescriptor::AnyUsb => "transport-usb".to_string(),
            DeviceDescriptor::AnyLocal => "transport-local".to_string(),
            DeviceDescriptor::Serial(serial) => format!("transport:{}", serial),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceDescriptor::Any => write!(f, "any"),
            DeviceDescriptor::AnyUsb => write!(f, "any-usb"),
            DeviceDescriptor::AnyLocal => write!(f, "any-local"),
            DeviceDescriptor::Serial(serial) => write!(f, "{}", serial),
        }
    }
}

/// State of a device as reported by the ADB server.
///
/// `Disconnected` is synthetic: the server never emits it, the watcher
/// uses it to mean "absent from the snapshot".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Disconnected,
    Offline,
    Online,
    Unauthorized,
    Invalid,
}

impl DeviceState {
    /// Case-sensitive token parsing. Unknown tokens map to `Invalid`
    /// rather than an error so newer servers don't break tracking.
    pub fn parse(token: &str) -> DeviceState {
        match token {
            "offline" => DeviceState::Offline,
            "device" => DeviceState::Online,
            "unauthorized" => DeviceState::Unauthorized,
            _ => DeviceState::Invalid,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Wire tokens where the server has one.
        match self {
            DeviceState::Disconnected => write!(f, "disconnected"),
            DeviceState::Offline => write!(f, "offline"),
            DeviceState::Online => write!(f, "device"),
            DeviceState::Unauthorized => write!(f, "unauthorized"),
            DeviceState::Invalid => write!(f, "invalid"),
        }
    }
}

/// Information about one connected device, from a `host:devices-l` row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub serial: String,
    pub product: String,
    pub model: String,
    pub device: String,
    pub usb: String,
}

impl DeviceInfo {
    /// Parse one long-format row: `serial<ws>state key:value key:value ...`
    fn parse_long(line: &str) -> AdbResult<DeviceInfo> {
        let mut fields = line.split_whitespace();
        let serial = fields
            .next()
            .ok_or_else(|| AdbError::Parse(format!("device list row missing serial: {:?}", line)))?;

        let mut info = DeviceInfo {
            serial: serial.to_string(),
            ..DeviceInfo::default()
        };
        for field in fields {
            if let Some((key, value)) = field.split_once(':') {
                match key {
                    "product" => info.product = value.to_string(),
                    "model" => info.model = value.to_string(),
                    "device" => info.device = value.to_string(),
                    "usb" => info.usb = value.to_string(),
                    _ => {}
                }
            }
        }
        Ok(info)
    }

    pub(crate) fn parse_device_list(text: &str) -> AdbResult<Vec<DeviceInfo>> {
        text.lines()
            .filter(|line| !line.is_empty())
            .map(DeviceInfo::parse_long)
            .collect()
    }
}

/// One observed device-state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStateChangedEvent {
    pub serial: String,
    pub old_state: DeviceState,
    pub new_state: DeviceState,
}

impl DeviceStateChangedEvent {
    pub fn new(serial: impl Into<String>, old_state: DeviceState, new_state: DeviceState) -> Self {
        Self {
            serial: serial.into(),
            old_state,
            new_state,
        }
    }

    pub fn came_online(&self) -> bool {
        self.old_state != DeviceState::Online && self.new_state == DeviceState::Online
    }

    pub fn went_offline(&self) -> bool {
        self.old_state == DeviceState::Online && self.new_state != DeviceState::Online
    }
}
