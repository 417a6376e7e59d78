use adb_host_client::{AdbClient, DeviceDescriptor, DeviceState};

#[tokio::test]
#[ignore] // Requires: adb start-server
async fn test_real_server_version() {
    let client = AdbClient::new();
    let version = client.server_version().await.unwrap();
    assert!(version > 0, "server version should be positive, got {}", version);
    println!("ADB server version: {}", version);
}

#[tokio::test]
#[ignore] // Requires: adb start-server
async fn test_real_list_devices() {
    let client = AdbClient::new();
    let devices = client.list_devices().await.unwrap();
    println!("Found {} device(s):", devices.len());
    for device in &devices {
        println!("  {} product:{} model:{}", device.serial, device.product, device.model);
    }
}

#[tokio::test]
#[ignore] // Requires: adb start-server + connected device
async fn test_real_device_state() {
    let client = AdbClient::new();
    let device = client.device(DeviceDescriptor::Any);
    let state = device.state().await.unwrap();
    assert_eq!(state, DeviceState::Online);
}

#[tokio::test]
#[ignore] // Requires: adb start-server + connected device
async fn test_real_shell_echo() {
    let client = AdbClient::new();
    let device = client.device(DeviceDescriptor::Any);
    let output = device.run_command("echo", &["hello"]).await.unwrap();
    assert!(output.contains("hello"), "expected 'hello' in output, got {:?}", output);
}

#[tokio::test]
#[ignore] // Requires: adb start-server + connected device
async fn test_real_shell_v2_exit_code() {
    let client = AdbClient::new();
    let device = client.device(DeviceDescriptor::Any);
    let output = device.run_command_v2("sh", &["-c", "exit 42"]).await.unwrap();
    assert_eq!(output.exit_status, Some(42));
}

#[tokio::test]
#[ignore] // Requires: adb start-server + connected device
async fn test_real_stat_sdcard() {
    let client = AdbClient::new();
    let device = client.device(DeviceDescriptor::Any);
    // /sdcard should exist on any Android device.
    let entry = device.stat("/sdcard").await.unwrap();
    assert!(entry.is_directory(), "expected /sdcard to be a directory");
}

#[tokio::test]
#[ignore] // Requires: adb start-server + connected device
async fn test_real_list_dir() {
    let client = AdbClient::new();
    let device = client.device(DeviceDescriptor::Any);
    let entries = device
        .list_dir_entries("/sdcard")
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert!(!entries.is_empty(), "expected /sdcard to have entries");
    for entry in &entries {
        println!("  {:o} {:>8} {}", entry.mode, entry.size, entry.name);
    }
}

#[tokio::test]
#[ignore] // Requires: adb start-server + connected device
async fn test_real_track_devices_sees_current_device() {
    let client = AdbClient::new();
    let mut watcher = client.track_devices();
    // The first snapshot reports every already-connected device.
    let event = watcher.next_event().await.expect("tracking event");
    assert_eq!(event.old_state, DeviceState::Disconnected);
    watcher.shutdown();
}
