//! One TCP connection to a device: read loop, heartbeat, serialized write
//! path, and request/response multiplexing. A session is an arena: every
//! connection attempt builds a fresh one, and nothing survives into the
//! next attempt except the immutable device descriptor held by the
//! supervisor.

use crate::crypto::{self, VersionCodec};
use crate::device::DeviceEvent;
use crate::dps::{DatapointEvent, decode_dps};
use crate::error::{Result, TuyaError};
use crate::protocol::{
    CommandType, ProtocolVersion, TuyaMessage, Unframed, pack_message, unframe,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant, timeout};
use tokio_util::sync::CancellationToken;

const HEARTBEAT_MISS_LIMIT: u32 = 3;
const MAX_CONSECUTIVE_DECRYPT_FAILURES: u32 = 3;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;
const WRITER_QUEUE: usize = 16;

/// Per-connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// v3.4 only: socket is up, session key not yet negotiated.
    KeyExchange,
    Ready,
    Closing,
}

/// Timing knobs, set by the device builder. Defaults match the doorbell's
/// field behavior: 10s heartbeats with a 5s answer window.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_tolerance: Duration,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_tolerance: Duration::from_secs(5),
        }
    }
}

struct SessionShared {
    device_id: String,
    codec: VersionCodec,
    state: Arc<Mutex<ConnectionState>>,
    seqno: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<TuyaMessage>>>>,
    /// Serializes callers: at most one request in flight per connection.
    request_gate: AsyncMutex<()>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    failure_tx: mpsc::Sender<TuyaError>,
    cancel: CancellationToken,
    tuning: SessionTuning,
}

impl SessionShared {
    fn report_failure(&self, err: TuyaError) {
        // Capacity-1 channel: the first failure wins, the rest are echoes
        // of the same teardown.
        let _ = self.failure_tx.try_send(err);
    }
}

/// Cheap clonable handle for issuing requests against a live session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Force this session to fail as if the link had dropped; the
    /// supervisor observes and tears it down like any other failure.
    pub(crate) fn abort(&self, err: TuyaError) {
        self.shared.report_failure(err);
    }

    /// Send a command and await the response frame with the matching
    /// sequence number. The payload is sealed for the connection's
    /// protocol version; the response arrives already opened.
    pub async fn send_and_await(
        &self,
        cmd: CommandType,
        payload: &Value,
        wait: Duration,
    ) -> Result<TuyaMessage> {
        let shared = &self.shared;
        let _gate = shared.request_gate.lock().await;
        if *shared.state.lock() != ConnectionState::Ready {
            return Err(TuyaError::NotConnected);
        }

        let cmd = shared.codec.version().effective_command(cmd);
        let seqno = shared.seqno.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_vec(payload)?;
        let sealed = shared.codec.seal(cmd, &body)?;
        let packed = pack_message(&TuyaMessage::new(seqno, cmd, sealed), shared.codec.hmac_key())?;

        let (slot_tx, slot_rx) = oneshot::channel();
        shared.pending.lock().insert(seqno, slot_tx);
        debug!(
            "Sending cmd={:?} seqno={} to {}",
            cmd, seqno, shared.device_id
        );

        if shared.writer_tx.send(packed).await.is_err() {
            shared.pending.lock().remove(&seqno);
            return Err(TuyaError::NotConnected);
        }

        match timeout(wait, slot_rx).await {
            Ok(Ok(result)) => result,
            // Slot dropped without completion: the session tore down.
            Ok(Err(_)) => Err(TuyaError::NotConnected),
            Err(_) => {
                // Deregister so the dead slot cannot pile up across requests.
                shared.pending.lock().remove(&seqno);
                Err(TuyaError::Timeout)
            }
        }
    }
}

/// A live connection. Owned by the reconnection supervisor, which awaits
/// [`Session::failed`] and then tears the whole arena down via
/// [`Session::shutdown`].
pub struct Session {
    shared: Arc<SessionShared>,
    failure_rx: mpsc::Receiver<TuyaError>,
}

impl Session {
    /// Connect, run the v3.4 handshake when required, and spawn the
    /// reader, writer, and heartbeat tasks.
    pub async fn establish(
        device_id: &str,
        host: &str,
        port: u16,
        local_key: &[u8],
        version: ProtocolVersion,
        tuning: SessionTuning,
        events: broadcast::Sender<DeviceEvent>,
    ) -> Result<Session> {
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        info!("Connecting to device {device_id} at {host}:{port}");

        let mut stream = timeout(tuning.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TuyaError::Timeout)?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TuyaError::ConnectionFailed,
                _ => TuyaError::Io(e.to_string()),
            })?;

        let seqno = AtomicU32::new(1);
        let key = if version.needs_handshake() {
            *state.lock() = ConnectionState::KeyExchange;
            timeout(
                tuning.connect_timeout,
                negotiate_session_key(&mut stream, local_key, &seqno),
            )
            .await
            .map_err(|_| TuyaError::HandshakeFailed)??
        } else {
            local_key.to_vec()
        };

        let codec = VersionCodec::new(version, &key)?;
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE);
        let (failure_tx, failure_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        *state.lock() = ConnectionState::Ready;
        let shared = Arc::new(SessionShared {
            device_id: device_id.to_string(),
            codec,
            state,
            seqno,
            pending: Mutex::new(HashMap::new()),
            request_gate: AsyncMutex::new(()),
            writer_tx,
            failure_tx,
            cancel,
            tuning,
        });

        tokio::spawn(run_writer(shared.clone(), write_half, writer_rx));
        tokio::spawn(run_reader(shared.clone(), read_half, events));
        tokio::spawn(run_heartbeat(shared.clone()));

        info!("Device {device_id} session ready ({version})");
        Ok(Session {
            shared,
            failure_rx,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.shared.clone(),
        }
    }

    /// Wait for the first connection-level failure. Frame-level errors are
    /// absorbed by the read loop and never show up here.
    pub async fn failed(&mut self) -> TuyaError {
        match self.failure_rx.recv().await {
            Some(err) => err,
            None => TuyaError::NotConnected,
        }
    }

    /// Tear the session down: cancel all tasks and release every pending
    /// request slot so no caller is left waiting against a dead socket.
    pub async fn shutdown(self) {
        *self.shared.state.lock() = ConnectionState::Closing;
        self.shared.cancel.cancel();

        let slots: Vec<_> = {
            let mut pending = self.shared.pending.lock();
            pending.drain().collect()
        };
        for (seqno, slot) in slots {
            debug!("Releasing pending request seqno={seqno}");
            let _ = slot.send(Err(TuyaError::NotConnected));
        }

        *self.shared.state.lock() = ConnectionState::Disconnected;
        debug!("Session for {} closed", self.shared.device_id);
    }
}

/// Sole owner of the socket's write half. Every frame, whatever its
/// logical sender, funnels through this task's queue.
async fn run_writer(
    shared: Arc<SessionShared>,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            packed = rx.recv() => {
                let Some(packed) = packed else { break };
                match timeout(WRITE_TIMEOUT, write_half.write_all(&packed)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        shared.report_failure(TuyaError::Io(e.to_string()));
                        break;
                    }
                    Err(_) => {
                        shared.report_failure(TuyaError::Io("write timeout".into()));
                        break;
                    }
                }
            }
        }
    }
    debug!("Writer task for {} stopped", shared.device_id);
}

/// Feeds socket bytes through the streaming decoder and routes each frame
/// to its pending slot or the event path.
async fn run_reader(
    shared: Arc<SessionShared>,
    mut read_half: OwnedReadHalf,
    events: broadcast::Sender<DeviceEvent>,
) {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut decrypt_failures = 0u32;

    'outer: loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            read = read_half.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        shared.report_failure(TuyaError::Io("connection closed by device".into()));
                        break;
                    }
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        shared.report_failure(TuyaError::Io(e.to_string()));
                        break;
                    }
                }

                loop {
                    match unframe(&buf, shared.codec.hmac_key()) {
                        Unframed::NeedMore(discard) => {
                            if discard > 0 {
                                buf.drain(..discard);
                            }
                            break;
                        }
                        Unframed::Corrupt(err, consumed) => {
                            warn!(
                                "Dropping corrupt frame from {}: {err}",
                                shared.device_id
                            );
                            buf.drain(..consumed);
                        }
                        Unframed::Frame(msg, consumed) => {
                            buf.drain(..consumed);
                            match route_frame(&shared, msg, &events) {
                                Ok(()) => decrypt_failures = 0,
                                Err(err) => {
                                    warn!(
                                        "Dropping undecryptable frame from {}: {err}",
                                        shared.device_id
                                    );
                                    decrypt_failures += 1;
                                    if decrypt_failures >= MAX_CONSECUTIVE_DECRYPT_FAILURES {
                                        shared.report_failure(TuyaError::DecryptionFailed);
                                        break 'outer;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    debug!("Reader task for {} stopped", shared.device_id);
}

/// Classify one decoded frame: a pending sequence number completes that
/// request; anything else is an unsolicited device report headed for the
/// event sink. Never both.
fn route_frame(
    shared: &SessionShared,
    msg: TuyaMessage,
    events: &broadcast::Sender<DeviceEvent>,
) -> Result<()> {
    let slot = shared.pending.lock().remove(&msg.seqno);
    if let Some(slot) = slot {
        match shared.codec.open(&msg.payload) {
            Ok(payload) => {
                debug!(
                    "Completing request seqno={} cmd=0x{:02x}",
                    msg.seqno, msg.cmd
                );
                let _ = slot.send(Ok(TuyaMessage { payload, ..msg }));
                Ok(())
            }
            Err(err) => {
                let _ = slot.send(Err(err.clone()));
                Err(err)
            }
        }
    } else {
        let payload = shared.codec.open(&msg.payload)?;
        if payload.is_empty() {
            // Bare ACK, nothing to report.
            return Ok(());
        }
        match decode_dps(&payload) {
            Ok(dps) if !dps.is_empty() => {
                debug!(
                    "Unsolicited report from {}: {} datapoint(s)",
                    shared.device_id,
                    dps.len()
                );
                let _ = events.send(DeviceEvent::Datapoints(DatapointEvent {
                    device_id: shared.device_id.clone(),
                    dps,
                    received_at: SystemTime::now(),
                }));
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) => {
                // Unparseable is per-payload, never a connection problem.
                debug!(
                    "Ignoring unparseable push from {}: {err}",
                    shared.device_id
                );
                Ok(())
            }
        }
    }
}

/// Periodic liveness probe. A response must land within the tolerance
/// window; three consecutive misses declare the connection dead.
async fn run_heartbeat(shared: Arc<SessionShared>) {
    // Spread heartbeats of many devices apart.
    let jitter = Duration::from_millis(u64::from(rand::rng().next_u32() % 1000));
    let period = shared.tuning.heartbeat_interval;
    let mut interval = tokio::time::interval_at(Instant::now() + period + jitter, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let handle = SessionHandle {
        shared: shared.clone(),
    };
    let payload = json!({
        "gwId": shared.device_id,
        "devId": shared.device_id,
    });
    let mut misses = 0u32;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = interval.tick() => {
                match handle
                    .send_and_await(
                        CommandType::HeartBeat,
                        &payload,
                        shared.tuning.heartbeat_tolerance,
                    )
                    .await
                {
                    Ok(_) => misses = 0,
                    Err(TuyaError::Timeout) => {
                        misses += 1;
                        warn!(
                            "Heartbeat {misses}/{HEARTBEAT_MISS_LIMIT} missed for {}",
                            shared.device_id
                        );
                        if misses >= HEARTBEAT_MISS_LIMIT {
                            shared.report_failure(TuyaError::Timeout);
                            break;
                        }
                    }
                    Err(TuyaError::NotConnected) => break,
                    Err(e) => {
                        shared.report_failure(e);
                        break;
                    }
                }
            }
        }
    }
    debug!("Heartbeat task for {} stopped", shared.device_id);
}

/// v3.4 key exchange, run on the raw socket before the session tasks
/// exist. Returns the connection-scoped session key.
async fn negotiate_session_key(
    stream: &mut TcpStream,
    local_key: &[u8],
    seqno: &AtomicU32,
) -> Result<Vec<u8>> {
    let boot = VersionCodec::new(ProtocolVersion::V3_4, local_key)?;
    debug!("Starting session key negotiation");

    let mut local_nonce = [0u8; 16];
    rand::rng().fill_bytes(&mut local_nonce);

    let sealed = boot.seal(CommandType::SessKeyNegStart, &local_nonce)?;
    let start = pack_message(
        &TuyaMessage::new(
            seqno.fetch_add(1, Ordering::Relaxed),
            CommandType::SessKeyNegStart,
            sealed,
        ),
        boot.hmac_key(),
    )?;
    stream.write_all(&start).await?;

    let mut buf = Vec::new();
    let resp = read_frame_blocking(stream, &mut buf, boot.hmac_key()).await?;
    if resp.command() != Some(CommandType::SessKeyNegResp) {
        return Err(TuyaError::HandshakeFailed);
    }
    let opened = boot.open(&resp.payload)?;
    if opened.len() < 48 {
        return Err(TuyaError::HandshakeFailed);
    }
    let remote_nonce = &opened[..16];
    let remote_hmac = &opened[16..48];

    // The device proves key knowledge by MACing our nonce.
    if crypto::hmac_sha256(local_key, &local_nonce)? != remote_hmac {
        return Err(TuyaError::HandshakeFailed);
    }

    let finish_hmac = crypto::hmac_sha256(local_key, remote_nonce)?;
    let sealed = boot.seal(CommandType::SessKeyNegFinish, &finish_hmac)?;
    let finish = pack_message(
        &TuyaMessage::new(
            seqno.fetch_add(1, Ordering::Relaxed),
            CommandType::SessKeyNegFinish,
            sealed,
        ),
        boot.hmac_key(),
    )?;
    stream.write_all(&finish).await?;

    crypto::derive_session_key(local_key, &local_nonce, remote_nonce)
}

/// Read exactly one frame from the socket; handshake-time helper with no
/// tolerance for corrupt frames.
async fn read_frame_blocking(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    hmac_key: Option<&[u8]>,
) -> Result<TuyaMessage> {
    let mut chunk = [0u8; 1024];
    loop {
        match unframe(buf, hmac_key) {
            Unframed::Frame(msg, consumed) => {
                buf.drain(..consumed);
                return Ok(msg);
            }
            Unframed::NeedMore(discard) => {
                if discard > 0 {
                    buf.drain(..discard);
                }
            }
            Unframed::Corrupt(_, _) => return Err(TuyaError::HandshakeFailed),
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TuyaError::HandshakeFailed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const KEY: &[u8; 16] = b"sessiontest_key!";
    const ID: &str = "bf00doorbell";

    fn tuning() -> SessionTuning {
        SessionTuning {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            // Long enough that tests never race a heartbeat.
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_tolerance: Duration::from_secs(5),
        }
    }

    /// A scripted v3.3 device end: reads frames, hands each to the
    /// responder, writes whatever pre-sealed frames come back.
    async fn fake_device<F>(listener: TcpListener, mut respond: F)
    where
        F: FnMut(TuyaMessage) -> Vec<TuyaMessage> + Send + 'static,
    {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match sock.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);
            loop {
                match unframe(&buf, None) {
                    Unframed::Frame(msg, consumed) => {
                        buf.drain(..consumed);
                        for reply in respond(msg) {
                            let packed = pack_message(&reply, None).unwrap();
                            if sock.write_all(&packed).await.is_err() {
                                return;
                            }
                        }
                    }
                    Unframed::NeedMore(d) => {
                        if d > 0 {
                            buf.drain(..d);
                        }
                        break;
                    }
                    Unframed::Corrupt(_, consumed) => {
                        buf.drain(..consumed);
                    }
                }
            }
        }
    }

    fn sealed_reply(seqno: u32, cmd: CommandType, body: &[u8]) -> TuyaMessage {
        let codec = VersionCodec::new(ProtocolVersion::V3_3, KEY).unwrap();
        TuyaMessage::new(seqno, cmd, codec.seal(cmd, body).unwrap())
    }

    #[tokio::test]
    async fn matching_response_completes_request_without_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (session, mut events_rx) = connect_with_device(listener).await;

        let reply = session
            .handle()
            .send_and_await(
                CommandType::HeartBeat,
                &json!({"gwId": ID, "devId": ID}),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(reply.seqno, 1);

        // No DP event may surface from a correlated response.
        assert!(
            timeout(Duration::from_millis(200), events_rx.recv())
                .await
                .is_err()
        );
        session.shutdown().await;
    }

    async fn connect_with_device(
        listener: TcpListener,
    ) -> (Session, broadcast::Receiver<DeviceEvent>) {
        let addr = listener.local_addr().unwrap();
        tokio::spawn(fake_device(listener, |msg| {
            vec![sealed_reply(msg.seqno, CommandType::HeartBeat, b"{}")]
        }));
        let (events_tx, events_rx) = broadcast::channel(16);
        let session = Session::establish(
            ID,
            &addr.ip().to_string(),
            addr.port(),
            KEY,
            ProtocolVersion::V3_3,
            tuning(),
            events_tx,
        )
        .await
        .unwrap();
        (session, events_rx)
    }

    #[tokio::test]
    async fn unsolicited_frame_becomes_datapoint_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Respond to any request with an unsolicited seq-0 status push.
        tokio::spawn(fake_device(listener, |_msg| {
            vec![sealed_reply(0, CommandType::Status, b"{\"dps\":{\"185\":true}}")]
        }));

        let (events_tx, mut events_rx) = broadcast::channel(16);
        let session = Session::establish(
            ID,
            &addr.ip().to_string(),
            addr.port(),
            KEY,
            ProtocolVersion::V3_3,
            tuning(),
            events_tx,
        )
        .await
        .unwrap();

        // The request itself times out (the device never echoes our seqno)
        // but the push must arrive as an event.
        let _ = session
            .handle()
            .send_and_await(
                CommandType::DpQuery,
                &json!({"gwId": ID}),
                Duration::from_millis(300),
            )
            .await;

        let event = timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("event should arrive")
            .unwrap();
        match event {
            DeviceEvent::Datapoints(dp) => {
                assert_eq!(dp.device_id, ID);
                assert_eq!(dp.dps.get(&185), Some(&serde_json::json!(true)));
            }
            other => panic!("expected datapoints, got {other:?}"),
        }
        session.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_requests_never_cross_complete() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Echo each request's payload back under its own seqno.
        tokio::spawn(fake_device(listener, |msg| {
            let codec = VersionCodec::new(ProtocolVersion::V3_3, KEY).unwrap();
            let body = codec.open(&msg.payload).unwrap();
            vec![sealed_reply(msg.seqno, CommandType::DpQuery, &body)]
        }));

        let (events_tx, _events_rx) = broadcast::channel(16);
        let session = Session::establish(
            ID,
            &addr.ip().to_string(),
            addr.port(),
            KEY,
            ProtocolVersion::V3_3,
            tuning(),
            events_tx,
        )
        .await
        .unwrap();

        let mut workers = Vec::new();
        for marker in ["alpha", "beta", "gamma"] {
            let handle = session.handle();
            workers.push(tokio::spawn(async move {
                let reply = handle
                    .send_and_await(
                        CommandType::DpQuery,
                        &json!({"marker": marker}),
                        Duration::from_secs(2),
                    )
                    .await
                    .unwrap();
                let echoed: Value = serde_json::from_slice(&reply.payload).unwrap();
                assert_eq!(echoed["marker"], marker);
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }
        session.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_pending_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Device that accepts and then stays silent.
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let (events_tx, _events_rx) = broadcast::channel(16);
        let session = Session::establish(
            ID,
            &addr.ip().to_string(),
            addr.port(),
            KEY,
            ProtocolVersion::V3_3,
            tuning(),
            events_tx,
        )
        .await
        .unwrap();

        let handle = session.handle();
        let waiter = tokio::spawn(async move {
            handle
                .send_and_await(
                    CommandType::DpQuery,
                    &json!({"gwId": ID}),
                    Duration::from_secs(30),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.shutdown().await;

        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(result, Err(TuyaError::NotConnected));
    }

    #[tokio::test]
    async fn send_after_shutdown_is_not_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (session, _events) = connect_with_device(listener).await;
        let handle = session.handle();
        session.shutdown().await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        let result = handle
            .send_and_await(CommandType::DpQuery, &json!({}), Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(TuyaError::NotConnected));
    }

    #[tokio::test]
    async fn socket_close_reports_failure_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
        });

        let (events_tx, _events_rx) = broadcast::channel(16);
        let mut session = Session::establish(
            ID,
            &addr.ip().to_string(),
            addr.port(),
            KEY,
            ProtocolVersion::V3_3,
            tuning(),
            events_tx,
        )
        .await
        .unwrap();

        let err = timeout(Duration::from_secs(2), session.failed())
            .await
            .expect("failure should be reported");
        assert!(matches!(err, TuyaError::Io(_)));
        session.shutdown().await;
    }
}
