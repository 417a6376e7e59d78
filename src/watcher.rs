use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::device::{DeviceState, DeviceStateChangedEvent};
use crate::error::{AdbError, AdbResult, ErrorKind};
use crate::host::{BoxConn, HostSession, ServerStarter, TransportDialer};
use crate::protocol;

/// Watches `host:track-devices` and publishes one event per observed
/// state transition. Reconnects when the server drops the connection;
/// any other failure terminates the stream and parks the error in the
/// last-error slot.
pub struct DeviceWatcher {
    events: mpsc::UnboundedReceiver<DeviceStateChangedEvent>,
    last_error: Arc<Mutex<Option<AdbError>>>,
    task: JoinHandle<()>,
}

impl DeviceWatcher {
    pub(crate) fn spawn(
        dialer: Arc<dyn TransportDialer>,
        starter: Option<Arc<dyn ServerStarter>>,
    ) -> DeviceWatcher {
        let (tx, rx) = mpsc::unbounded_channel();
        let last_error = Arc::new(Mutex::new(None));
        let error_slot = last_error.clone();
        let task = tokio::spawn(async move {
            publish_devices(dialer.as_ref(), starter.as_deref(), &tx, &error_slot).await;
        });
        DeviceWatcher {
            events: rx,
            last_error,
            task,
        }
    }

    /// The next state-change event, or `None` once tracking has
    /// terminated (check [`last_error`](Self::last_error) to see why).
    pub async fn next_event(&mut self) -> Option<DeviceStateChangedEvent> {
        self.events.recv().await
    }

    /// The error that terminated tracking, if any.
    pub fn last_error(&self) -> Option<AdbError> {
        self.last_error
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or(None)
    }

    /// Stop tracking: the worker is aborted, which drops (closes) its
    /// connection and closes the event channel.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn publish_devices(
    dialer: &dyn TransportDialer,
    starter: Option<&dyn ServerStarter>,
    events: &mpsc::UnboundedSender<DeviceStateChangedEvent>,
    error_slot: &Mutex<Option<AdbError>>,
) {
    // Retained across reconnects so devices that vanish while we are
    // disconnected still produce a Disconnected event.
    let mut last_states: HashMap<String, DeviceState> = HashMap::new();

    loop {
        let conn = match connect_to_tracker(dialer, starter).await {
            Ok(conn) => conn,
            Err(err) => {
                report(error_slot, err);
                return;
            }
        };

        match publish_until_error(conn, &mut last_states, events).await {
            Ok(()) => return,
            Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                warn!("device tracking connection lost, reconnecting: {}", err);
            }
            Err(err) => {
                report(error_slot, err);
                return;
            }
        }
    }
}

/// Dial and switch the connection into tracking mode. When the server
/// socket is unreachable the starter capability is invoked, once per
/// dialing episode, and the dial retried.
async fn connect_to_tracker(
    dialer: &dyn TransportDialer,
    starter: Option<&dyn ServerStarter>,
) -> AdbResult<BoxConn> {
    let mut started = false;
    loop {
        match track_devices(dialer).await {
            Ok(conn) => return Ok(conn),
            Err(err) if err.kind() == ErrorKind::ServerNotAvailable && !started => {
                let Some(starter) = starter else {
                    return Err(err);
                };
                started = true;
                debug!("ADB server not reachable, starting it");
                starter.start_server().await?;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn track_devices(dialer: &dyn TransportDialer) -> AdbResult<BoxConn> {
    let mut session = HostSession::open(dialer).await?;
    session.send("host:track-devices").await?;
    Ok(session.into_stream())
}

/// Read snapshots until the connection or the receiver goes away.
/// `Ok(())` means the receiver was dropped and tracking is finished.
async fn publish_until_error(
    mut conn: BoxConn,
    last_states: &mut HashMap<String, DeviceState>,
    events: &mpsc::UnboundedSender<DeviceStateChangedEvent>,
) -> AdbResult<()> {
    loop {
        let snapshot = protocol::read_message(&mut conn).await?;
        let new_states = parse_device_states(&String::from_utf8_lossy(&snapshot))?;
        for event in diff_states(last_states, &new_states) {
            if events.send(event).is_err() {
                return Ok(());
            }
        }
        *last_states = new_states;
    }
}

/// Parse one tracking snapshot: `<serial>\t<state>` per line. A line
/// without a tab is malformed and reported with its 0-based index.
pub fn parse_device_states(text: &str) -> AdbResult<HashMap<String, DeviceState>> {
    let mut states = HashMap::new();
    for (index, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let Some((serial, state)) = line.split_once('\t') else {
            return Err(AdbError::Parse(format!(
                "invalid device state line {}: {}",
                index, line
            )));
        };
        states.insert(serial.to_string(), DeviceState::parse(state));
    }
    Ok(states)
}

/// Pure diff between two snapshots. Serials that appear map from
/// `Disconnected`; serials that vanish map to it. Order within one diff
/// is unspecified.
pub fn diff_states(
    old: &HashMap<String, DeviceState>,
    new: &HashMap<String, DeviceState>,
) -> Vec<DeviceStateChangedEvent> {
    let mut events = Vec::new();
    for (serial, new_state) in new {
        match old.get(serial) {
            None => events.push(DeviceStateChangedEvent::new(
                serial.clone(),
                DeviceState::Disconnected,
                *new_state,
            )),
            Some(old_state) if old_state != new_state => events.push(
                DeviceStateChangedEvent::new(serial.clone(), *old_state, *new_state),
            ),
            Some(_) => {}
        }
    }
    for (serial, old_state) in old {
        if !new.contains_key(serial) {
            events.push(DeviceStateChangedEvent::new(
                serial.clone(),
                *old_state,
                DeviceState::Disconnected,
            ));
        }
    }
    events
}

fn report(error_slot: &Mutex<Option<AdbError>>, err: AdbError) {
    if let Ok(mut slot) = error_slot.lock() {
        *slot = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::device::DeviceState::{Disconnected, Offline, Online};

    fn states(pairs: &[(&str, DeviceState)]) -> HashMap<String, DeviceState> {
        pairs
            .iter()
            .map(|(serial, state)| (serial.to_string(), *state))
            .collect()
    }

    fn assert_contains_only(expected: &[DeviceStateChangedEvent], actual: &[DeviceStateChangedEvent]) {
        assert_eq!(
            actual.len(),
            expected.len(),
            "expected {:?}, got {:?}",
            expected,
            actual
        );
        for event in expected {
            assert!(actual.contains(event), "missing {:?} in {:?}", event, actual);
        }
    }

    #[test]
    fn test_parse_device_states_single() {
        let states = parse_device_states("192.168.56.101:5555\toffline\n").unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states["192.168.56.101:5555"], Offline);
    }

    #[test]
    fn test_parse_device_states_multiple() {
        let states = parse_device_states("192.168.56.101:5555\toffline\n0x0x0x0x\tdevice\n").unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states["192.168.56.101:5555"], Offline);
        assert_eq!(states["0x0x0x0x"], Online);
    }

    #[test]
    fn test_parse_device_states_unknown_token_is_invalid() {
        let states = parse_device_states("serial\tbootloader\n").unwrap();
        assert_eq!(states["serial"], DeviceState::Invalid);
    }

    #[test]
    fn test_parse_device_states_malformed() {
        let err = parse_device_states("192.168.56.101:5555\toffline\n0x0x0x0x\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(
            err.to_string().contains("invalid device state line 1: 0x0x0x0x"),
            "got: {}",
            err
        );
    }

    #[test]
    fn test_diff_empty_unchanged() {
        assert!(diff_states(&states(&[]), &states(&[])).is_empty());
    }

    #[test]
    fn test_diff_nonempty_unchanged() {
        let snapshot = states(&[("1", Online), ("2", Online)]);
        assert!(diff_states(&snapshot, &snapshot).is_empty());
    }

    #[test]
    fn test_diff_one_added() {
        let diffs = diff_states(&states(&[]), &states(&[("serial", Offline)]));
        assert_contains_only(
            &[DeviceStateChangedEvent::new("serial", Disconnected, Offline)],
            &diffs,
        );
    }

    #[test]
    fn test_diff_one_removed() {
        let diffs = diff_states(&states(&[("serial", Offline)]), &states(&[]));
        assert_contains_only(
            &[DeviceStateChangedEvent::new("serial", Offline, Disconnected)],
            &diffs,
        );
    }

    #[test]
    fn test_diff_one_added_one_unchanged() {
        let diffs = diff_states(
            &states(&[("1", Online)]),
            &states(&[("1", Online), ("2", Offline)]),
        );
        assert_contains_only(
            &[DeviceStateChangedEvent::new("2", Disconnected, Offline)],
            &diffs,
        );
    }

    #[test]
    fn test_diff_one_changed_one_unchanged() {
        let diffs = diff_states(
            &states(&[("1", Offline), ("2", Online)]),
            &states(&[("1", Online), ("2", Online)]),
        );
        assert_contains_only(&[DeviceStateChangedEvent::new("1", Offline, Online)], &diffs);
    }

    #[test]
    fn test_diff_add_remove_change() {
        let diffs = diff_states(
            &states(&[("1", Offline), ("2", Offline)]),
            &states(&[("1", Online), ("3", Offline)]),
        );
        assert_contains_only(
            &[
                DeviceStateChangedEvent::new("1", Offline, Online),
                DeviceStateChangedEvent::new("2", Offline, Disconnected),
                DeviceStateChangedEvent::new("3", Disconnected, Offline),
            ],
            &diffs,
        );
    }

    #[test]
    fn test_diff_is_its_own_inverse() {
        let a = states(&[("1", Offline), ("2", Online)]);
        let b = states(&[("2", Offline), ("3", Online)]);
        let forward = diff_states(&a, &b);
        let backward = diff_states(&b, &a);
        assert_eq!(forward.len(), backward.len());
        for event in &forward {
            let inverse = DeviceStateChangedEvent::new(
                event.serial.clone(),
                event.new_state,
                event.old_state,
            );
            assert!(backward.contains(&inverse), "missing inverse of {:?}", event);
        }
    }

    /// Hands out a scripted sequence of connections or errors.
    struct ScriptDialer {
        script: Mutex<VecDeque<AdbResult<BoxConn>>>,
    }

    impl ScriptDialer {
        fn new(script: Vec<AdbResult<BoxConn>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    impl TransportDialer for ScriptDialer {
        fn dial(&self) -> BoxFuture<'_, AdbResult<BoxConn>> {
            Box::pin(async move {
                self.script
                    .lock()
                    .expect("script lock")
                    .pop_front()
                    .unwrap_or_else(|| Err(AdbError::ServerNotAvailable("script exhausted".into())))
            })
        }
    }

    struct CountingStarter {
        count: AtomicUsize,
        result: AdbResult<()>,
    }

    impl CountingStarter {
        fn ok() -> Self {
            Self {
                count: AtomicUsize::new(0),
                result: Ok(()),
            }
        }
    }

    impl ServerStarter for CountingStarter {
        fn start_server(&self) -> BoxFuture<'_, AdbResult<()>> {
            self.count.fetch_add(1, Ordering::SeqCst);
            let result = self.result.clone();
            Box::pin(async move { result })
        }
    }

    /// Builds one scripted tracker connection: the server side has already
    /// written `canned` and is returned so the test controls when it closes.
    async fn scripted_conn(canned: &[u8]) -> (BoxConn, tokio::io::DuplexStream) {
        let (client, mut server) = tokio::io::duplex(4096);
        // Pre-load the response; duplex buffers it until the watcher reads.
        protocol::write_all(&mut server, canned).await.unwrap();
        (Box::new(client) as BoxConn, server)
    }

    fn snapshot_message(table: &str) -> Vec<u8> {
        protocol::encode_message(table)
    }

    #[tokio::test]
    async fn test_watcher_restarts_server_and_resumes() {
        // First connection: accepts tracking, emits one snapshot, dies.
        let mut first = b"OKAY".to_vec();
        first.extend_from_slice(&snapshot_message("A\tdevice\n"));
        let (conn1, server1) = scripted_conn(&first).await;

        // Second dial fails; the starter brings the server back and the
        // third connection reports an empty table.
        let mut second = b"OKAY".to_vec();
        second.extend_from_slice(&snapshot_message(""));
        let (conn2, server2) = scripted_conn(&second).await;

        let dialer = Arc::new(ScriptDialer::new(vec![
            Ok(conn1),
            Err(AdbError::ServerNotAvailable("connection refused".into())),
            Ok(conn2),
        ]));
        let starter = Arc::new(CountingStarter::ok());

        let mut watcher =
            DeviceWatcher::spawn(dialer, Some(starter.clone() as Arc<dyn ServerStarter>));

        let event = watcher.next_event().await.expect("first event");
        assert_eq!(event, DeviceStateChangedEvent::new("A", Disconnected, Online));

        // Kill the first connection; the watcher reconnects, and the
        // retained snapshot reports the now-absent device as disconnected.
        drop(server1);
        let event = watcher.next_event().await.expect("second event");
        assert_eq!(event, DeviceStateChangedEvent::new("A", Online, Disconnected));
        assert!(event.went_offline());

        assert_eq!(starter.count.load(Ordering::SeqCst), 1);
        drop(server2);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn test_watcher_without_starter_terminates() {
        let mut first = b"OKAY".to_vec();
        first.extend_from_slice(&snapshot_message("A\tdevice\n"));
        let (conn1, server1) = scripted_conn(&first).await;

        let dialer = Arc::new(ScriptDialer::new(vec![
            Ok(conn1),
            Err(AdbError::ServerNotAvailable("connection refused".into())),
        ]));

        let mut watcher = DeviceWatcher::spawn(dialer, None);

        let event = watcher.next_event().await.expect("event");
        assert!(event.came_online());
        drop(server1);

        // Channel closes once the redial fails terminally.
        assert_eq!(watcher.next_event().await, None);
        let err = watcher.last_error().expect("terminal error");
        assert_eq!(err.kind(), ErrorKind::ServerNotAvailable);
    }

    #[tokio::test]
    async fn test_watcher_identical_snapshots_emit_nothing() {
        let mut canned = b"OKAY".to_vec();
        canned.extend_from_slice(&snapshot_message("A\tdevice\n"));
        canned.extend_from_slice(&snapshot_message("A\tdevice\n"));
        canned.extend_from_slice(&snapshot_message("A\toffline\n"));
        let (conn, server) = scripted_conn(&canned).await;

        let dialer = Arc::new(ScriptDialer::new(vec![Ok(conn)]));
        let mut watcher = DeviceWatcher::spawn(dialer, None);

        let first = watcher.next_event().await.expect("first event");
        assert_eq!(first, DeviceStateChangedEvent::new("A", Disconnected, Online));
        // The repeated snapshot produced nothing; the next event comes
        // from the third snapshot.
        let second = watcher.next_event().await.expect("second event");
        assert_eq!(second, DeviceStateChangedEvent::new("A", Online, Offline));

        drop(server);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn test_watcher_failed_tracking_request_is_terminal() {
        let mut canned = b"FAIL".to_vec();
        canned.extend_from_slice(&protocol::encode_message("unknown host service"));
        let (conn, _server) = scripted_conn(&canned).await;

        let dialer = Arc::new(ScriptDialer::new(vec![Ok(conn)]));
        let mut watcher = DeviceWatcher::spawn(dialer, None);

        assert_eq!(watcher.next_event().await, None);
        let err = watcher.last_error().expect("terminal error");
        assert_eq!(err.kind(), ErrorKind::Adb);
    }
}
