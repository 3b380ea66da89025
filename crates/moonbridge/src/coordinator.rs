//! Synchronization coordinator: decides when state is fetched, reconciles
//! the two transport modes, and publishes snapshots to observers.
//!
//! The coordinator owns the one [`PrinterState`] per device. Observers
//! never touch the authoritative instance; they watch a channel of
//! immutable `Arc<PrinterState>` snapshots, re-read on every
//! notification.
//!
//! The host framework drives the poll path by calling [`Coordinator::refresh`]
//! on its own cadence; the bridge schedules nothing itself. In socket mode
//! the host calls [`Coordinator::start_socket`] once and deltas are pushed
//! as they arrive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::config::PrinterConfig;
use crate::error::{CommandError, ConfigError, ConnectionError, FetchFailure, UpdateError};
use crate::printer::{DeviceInfo, PrinterState, ProcStats};
use crate::protocol::{self, ClientIdentity, Frame, RpcEnvelopes};
use crate::transport::{HttpTransport, Socket, SocketFactory, WsSocketFactory};

/// Where the session currently stands.
///
/// `Degraded` is not a crash state: the next external trigger (scheduled
/// refresh or socket restart) re-enters `Probing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Probing,
    Subscribing,
    Synced,
    Degraded,
}

struct Inner {
    http: HttpTransport,
    printer: Mutex<PrinterState>,
    proc_stats: std::sync::Mutex<ProcStats>,
    phase: std::sync::Mutex<SyncPhase>,
    published: watch::Sender<Arc<PrinterState>>,
    envelopes: RpcEnvelopes,
    identity: ClientIdentity,
    objects: Vec<String>,
    connection_id: std::sync::Mutex<Option<u64>>,
    subscribed: AtomicBool,
    socket_active: AtomicBool,
}

/// One coordinator per configured printer.
pub struct Coordinator<F: SocketFactory> {
    inner: Arc<Inner>,
    factory: Arc<F>,
    socket_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator<WsSocketFactory> {
    /// Build a coordinator talking to a real Moonraker endpoint.
    pub fn from_config(config: &PrinterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_factory(
            config,
            WsSocketFactory::new(config.ws_url()),
        ))
    }
}

impl<F: SocketFactory> Coordinator<F> {
    /// Build a coordinator with an injected socket factory. Tests use
    /// this with a scripted mock.
    pub fn with_factory(config: &PrinterConfig, factory: F) -> Self {
        let printer = PrinterState::new(
            config.printer_id(),
            config.name.clone(),
            &config.extruders,
        );
        let objects = printer.subsystem_names();
        let (published, _) = watch::channel(Arc::new(printer.clone()));

        Self {
            inner: Arc::new(Inner {
                http: HttpTransport::new(config.base_url()),
                printer: Mutex::new(printer),
                proc_stats: std::sync::Mutex::new(ProcStats::default()),
                phase: std::sync::Mutex::new(SyncPhase::Idle),
                published,
                envelopes: RpcEnvelopes::new(),
                identity: ClientIdentity {
                    url: config.instance_url.clone(),
                    ..ClientIdentity::default()
                },
                objects,
                connection_id: std::sync::Mutex::new(None),
                subscribed: AtomicBool::new(false),
                socket_active: AtomicBool::new(false),
            }),
            factory: Arc::new(factory),
            socket_task: std::sync::Mutex::new(None),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.inner.phase()
    }

    /// Attach an observer. The receiver holds the latest published
    /// snapshot; `changed()` wakes on every publication.
    pub fn subscribe_state(&self) -> watch::Receiver<Arc<PrinterState>> {
        self.inner.published.subscribe()
    }

    /// Latest published snapshot; cloning the `Arc` is essentially free.
    pub fn state_snapshot(&self) -> Arc<PrinterState> {
        self.inner.published.borrow().clone()
    }

    /// Device-registry metadata for the host.
    pub fn device_info(&self) -> DeviceInfo {
        self.state_snapshot().device_info()
    }

    /// Last process-telemetry sample from the push channel.
    pub fn proc_stats(&self) -> ProcStats {
        self.inner.proc_stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Poll-path entrypoint, called by the host scheduler.
    ///
    /// Probes liveness first whenever the firmware is not known to be
    /// connected, then fetches and merges a full snapshot. Rejected
    /// outright while the socket session is active so the two transports
    /// never write concurrently.
    pub async fn refresh(&self) -> Result<Arc<PrinterState>, UpdateError> {
        if self.inner.socket_active.load(Ordering::SeqCst) {
            return Err(UpdateError::DualMode);
        }

        let needs_probe = {
            let printer = self.inner.printer.lock().await;
            !printer.klippy.is_ready()
        };
        if needs_probe {
            self.inner.set_phase(SyncPhase::Probing);
            if let Err(e) = self.inner.probe().await {
                warn!("liveness probe failed: {}", e);
                return Err(UpdateError::NotReady(e));
            }
        }

        match self.inner.fetch_snapshot().await {
            Ok(snapshot) => {
                self.inner.set_phase(SyncPhase::Synced);
                Ok(snapshot)
            }
            Err(e) => {
                self.inner.set_phase(SyncPhase::Degraded);
                Err(UpdateError::Fetch(e))
            }
        }
    }

    /// Submit a single G-code line. Never retried; printer state is only
    /// updated by the next refresh or push, not by this call.
    pub async fn send_gcode(&self, script: &str) -> Result<(), CommandError> {
        let body = serde_json::json!({ "script": script });
        self.inner
            .http
            .post_json(protocol::GCODE_SCRIPT_PATH, &body)
            .await?;
        info!("submitted gcode: {}", script);
        Ok(())
    }

    pub async fn send_command(&self, command: &Command) -> Result<(), CommandError> {
        debug!("dispatching command: {}", command.purpose);
        self.send_gcode(&command.gcode).await
    }

    /// Start the socket session in a background task. One connection
    /// attempt per call: when the session ends (peer closed, error, or no
    /// observers remain) the host decides whether to call this again.
    pub fn start_socket(&self) {
        let mut guard = self.socket_task.lock().unwrap_or_else(|e| e.into_inner());
        if guard.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("socket session already running");
            return;
        }

        self.inner.socket_active.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let factory = self.factory.clone();
        *guard = Some(tokio::spawn(async move {
            if let Err(e) = inner.socket_session(factory.as_ref()).await {
                warn!("socket session ended: {}", e);
            }
            inner.socket_active.store(false, Ordering::SeqCst);
        }));
    }

    /// Tear the socket session down, if one is running.
    pub fn stop_socket(&self) {
        let mut guard = self.socket_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = guard.take() {
            task.abort();
            self.inner.socket_active.store(false, Ordering::SeqCst);
            self.inner.mark_disconnected();
        }
    }
}

impl<F: SocketFactory> Drop for Coordinator<F> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.socket_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

impl Inner {
    fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    /// Liveness probe. Succeeds only on a 2xx status *and* a parsable
    /// `result` object; an unparsable body is not "ready".
    async fn probe(&self) -> Result<(), FetchFailure> {
        let body = self.http.get(protocol::SERVER_INFO_PATH, None).await?;
        let info = protocol::parse_server_info(&body)?;
        let mut printer = self.printer.lock().await;
        printer.klippy.update(&info);
        Ok(())
    }

    async fn fetch_snapshot(&self) -> Result<Arc<PrinterState>, FetchFailure> {
        let query = protocol::objects_query_string(&self.objects);
        let body = self
            .http
            .get(protocol::OBJECTS_QUERY_PATH, Some(&query))
            .await?;
        let status = protocol::parse_query_status(&body)?;

        let mut printer = self.printer.lock().await;
        printer.apply_snapshot(&status);
        Ok(self.publish(&printer))
    }

    fn publish(&self, printer: &PrinterState) -> Arc<PrinterState> {
        let snapshot = Arc::new(printer.clone());
        self.published.send_replace(snapshot.clone());
        snapshot
    }

    fn mark_disconnected(&self) {
        *self
            .connection_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        self.subscribed.store(false, Ordering::SeqCst);
        self.set_phase(SyncPhase::Degraded);
    }

    fn connection_id(&self) -> Option<u64> {
        *self
            .connection_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// One socket session: probe, connect, identify + subscribe once per
    /// socket lifetime, then receive until the peer closes or no
    /// observers remain.
    async fn socket_session<F: SocketFactory>(
        &self,
        factory: &F,
    ) -> Result<(), ConnectionError> {
        self.set_phase(SyncPhase::Probing);
        if let Err(e) = self.probe().await {
            // Recoverable: stay in Probing, the host retries the session.
            warn!("liveness probe failed before socket connect: {}", e);
            return Ok(());
        }

        self.set_phase(SyncPhase::Subscribing);
        let mut socket = match factory.connect().await {
            Ok(socket) => socket,
            Err(e) => {
                self.mark_disconnected();
                return Err(e);
            }
        };

        if self.connection_id().is_none() {
            socket.send(self.envelopes.identify(&self.identity)).await?;
        }

        loop {
            // Observer check once per receive, not preemptively mid-frame.
            if self.published.receiver_count() == 0 {
                info!("no observers remain, closing socket session");
                socket.close().await;
                self.set_phase(SyncPhase::Idle);
                return Ok(());
            }

            match socket.recv().await {
                Ok(Some(text)) => self.handle_frame(&mut socket, &text).await?,
                Ok(None) => {
                    info!("socket closed by peer");
                    self.mark_disconnected();
                    return Ok(());
                }
                Err(e) => {
                    self.mark_disconnected();
                    return Err(e);
                }
            }
        }
    }

    /// Decode and apply one received frame. Undecodable or unrecognized
    /// frames are logged and discarded; they never end the session.
    async fn handle_frame<S: Socket>(
        &self,
        socket: &mut S,
        raw: &str,
    ) -> Result<(), ConnectionError> {
        let frame = match protocol::decode_frame(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("discarding undecodable frame: {}", e);
                return Ok(());
            }
        };

        match frame {
            Frame::Reply { result, .. } => {
                if self.connection_id().is_none() {
                    match result.get("connection_id").and_then(Value::as_u64) {
                        Some(cid) => {
                            info!("identified with connection id {}", cid);
                            *self
                                .connection_id
                                .lock()
                                .unwrap_or_else(|e| e.into_inner()) = Some(cid);
                            if !self.subscribed.load(Ordering::SeqCst) {
                                socket
                                    .send(self.envelopes.subscribe(&self.objects))
                                    .await?;
                            }
                        }
                        // Handshake is retried against the next reply.
                        None => warn!("connection id not found in reply: {}", result),
                    }
                    return Ok(());
                }

                if !self.subscribed.swap(true, Ordering::SeqCst) {
                    info!("subscription established");
                    self.set_phase(SyncPhase::Synced);
                }
                // Subscribe acks and query replies both carry a snapshot.
                if let Some(status) = result.get("status").and_then(Value::as_object) {
                    let mut printer = self.printer.lock().await;
                    printer.apply_snapshot(status);
                    self.publish(&printer);
                }
            }
            Frame::StatusUpdate(params) => {
                let mut printer = self.printer.lock().await;
                printer.apply_delta(&params);
                self.publish(&printer);
                self.set_phase(SyncPhase::Synced);
            }
            Frame::ProcStat(params) => {
                self.proc_stats
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .update(&params);
            }
            Frame::Other(value) => debug!("ignoring frame: {}", value),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PrinterConfig, TransportMode};
    use crate::transport::mock::{MockSocket, MockSocketFactory};

    fn test_config() -> PrinterConfig {
        PrinterConfig {
            name: "test printer".to_string(),
            // Nothing listens here; HTTP calls fail fast.
            host: "127.0.0.1".to_string(),
            port: 1,
            ssl: false,
            mode: TransportMode::Socket,
            poll_interval_secs: 60,
            extruders: vec!["extruder".to_string()],
            username: None,
            password: None,
            instance_url: None,
        }
    }

    fn mock_coordinator(frames: Vec<&str>) -> (Coordinator<MockSocketFactory>, MockSocket) {
        let (factory, script) = MockSocketFactory::new(frames);
        let coordinator = Coordinator::with_factory(&test_config(), factory);
        (coordinator, MockSocket { script })
    }

    #[tokio::test]
    async fn test_initial_phase_is_idle() {
        let (coordinator, _) = mock_coordinator(vec![]);
        assert_eq!(coordinator.phase(), SyncPhase::Idle);
        assert_eq!(coordinator.device_info().id, "test_printer");
    }

    #[tokio::test]
    async fn test_handshake_roundtrip_reaches_synced() {
        let (coordinator, mut socket) = mock_coordinator(vec![]);
        let inner = &coordinator.inner;
        inner.set_phase(SyncPhase::Subscribing);

        inner
            .handle_frame(&mut socket, r#"{"jsonrpc":"2.0","result":{"connection_id":99},"id":1}"#)
            .await
            .unwrap();

        assert_eq!(inner.connection_id(), Some(99));
        let sent = socket.script.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("printer.objects.subscribe"));
        assert_eq!(inner.phase(), SyncPhase::Subscribing);

        inner
            .handle_frame(
                &mut socket,
                r#"{"jsonrpc":"2.0","result":{"status":{"fan":{"speed":0.5}}},"id":2}"#,
            )
            .await
            .unwrap();

        assert_eq!(inner.phase(), SyncPhase::Synced);
        let snapshot = coordinator.state_snapshot();
        assert_eq!(snapshot.fan.speed, Some(0.5));
    }

    #[tokio::test]
    async fn test_handshake_retries_on_malformed_reply() {
        let (coordinator, mut socket) = mock_coordinator(vec![]);
        let inner = &coordinator.inner;
        inner.set_phase(SyncPhase::Subscribing);

        // A reply without a connection id does not identify the session
        // and does not abandon the connection.
        inner
            .handle_frame(&mut socket, r#"{"jsonrpc":"2.0","result":{},"id":1}"#)
            .await
            .unwrap();
        assert_eq!(inner.connection_id(), None);
        assert!(socket.script.sent.lock().unwrap().is_empty());

        inner
            .handle_frame(&mut socket, r#"{"jsonrpc":"2.0","result":{"connection_id":7},"id":1}"#)
            .await
            .unwrap();
        assert_eq!(inner.connection_id(), Some(7));
        assert_eq!(socket.script.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_update_publishes_delta_to_observers() {
        let (coordinator, mut socket) = mock_coordinator(vec![]);
        let inner = &coordinator.inner;
        *inner.connection_id.lock().unwrap() = Some(1);
        inner.subscribed.store(true, Ordering::SeqCst);

        let mut observer = coordinator.subscribe_state();

        inner
            .handle_frame(
                &mut socket,
                r#"{"jsonrpc":"2.0","method":"notify_status_update","params":[{"extruder":{"temperature":210.5}},3601.2]}"#,
            )
            .await
            .unwrap();

        assert!(observer.has_changed().unwrap());
        let snapshot = observer.borrow_and_update().clone();
        let extruder = snapshot.extruder("extruder").unwrap();
        assert_eq!(extruder.heater.temperature, Some(210.5));
        // Fields absent from the delta stay unset
        assert_eq!(extruder.heater.target, None);
        assert_eq!(snapshot.heater_bed.temperature, None);
    }

    #[tokio::test]
    async fn test_proc_stat_update_feeds_the_stats_sink_only() {
        let (coordinator, mut socket) = mock_coordinator(vec![]);
        let inner = &coordinator.inner;
        *inner.connection_id.lock().unwrap() = Some(1);
        inner.subscribed.store(true, Ordering::SeqCst);

        let before = coordinator.state_snapshot();
        inner
            .handle_frame(
                &mut socket,
                r#"{"jsonrpc":"2.0","method":"notify_proc_stat_update","params":[{"cpu_temp":51.0}]}"#,
            )
            .await
            .unwrap();

        assert_eq!(coordinator.proc_stats().cpu_temp, Some(51.0));
        assert_eq!(*coordinator.state_snapshot(), *before);
    }

    #[tokio::test]
    async fn test_unknown_frames_are_discarded_without_error() {
        let (coordinator, mut socket) = mock_coordinator(vec![]);
        let inner = &coordinator.inner;
        *inner.connection_id.lock().unwrap() = Some(1);
        inner.subscribed.store(true, Ordering::SeqCst);

        inner
            .handle_frame(&mut socket, r#"{"method":"notify_klippy_shutdown"}"#)
            .await
            .unwrap();
        inner.handle_frame(&mut socket, "garbage").await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_rejected_while_socket_active() {
        let (coordinator, _) = mock_coordinator(vec![]);
        coordinator
            .inner
            .socket_active
            .store(true, Ordering::SeqCst);

        assert!(matches!(
            coordinator.refresh().await,
            Err(UpdateError::DualMode)
        ));
    }

    #[tokio::test]
    async fn test_refresh_probe_failure_reports_not_ready() {
        let (coordinator, _) = mock_coordinator(vec![]);

        let err = coordinator.refresh().await.unwrap_err();
        assert!(matches!(err, UpdateError::NotReady(_)));
        assert_eq!(coordinator.phase(), SyncPhase::Probing);
    }

    #[tokio::test]
    async fn test_socket_session_stays_probing_when_probe_fails() {
        let (coordinator, _) = mock_coordinator(vec![]);
        let result = coordinator
            .inner
            .socket_session(coordinator.factory.as_ref())
            .await;

        assert!(result.is_ok());
        assert_eq!(coordinator.phase(), SyncPhase::Probing);
        assert_eq!(coordinator.inner.connection_id(), None);
    }

    #[tokio::test]
    async fn test_peer_close_degrades_and_clears_session_identity() {
        let (coordinator, mut socket) = mock_coordinator(vec![]);
        let inner = &coordinator.inner;
        *inner.connection_id.lock().unwrap() = Some(12);
        inner.subscribed.store(true, Ordering::SeqCst);

        // Pretend the probe already passed so the session goes straight
        // to the receive loop; the empty script means an immediate close.
        {
            let mut printer = inner.printer.lock().await;
            let info = serde_json::json!({ "klippy_connected": true });
            printer.klippy.update(info.as_object().unwrap());
        }
        let _observer = coordinator.subscribe_state();

        // Drive the receive path directly with a closed socket.
        let received = socket.recv().await.unwrap();
        assert_eq!(received, None);
        inner.mark_disconnected();

        assert_eq!(inner.phase(), SyncPhase::Degraded);
        assert_eq!(inner.connection_id(), None);
        assert!(!inner.subscribed.load(Ordering::SeqCst));
    }
}
