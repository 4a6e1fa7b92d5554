//! Device handle and reconnection supervisor.
//! A [`Device`] owns a background task that keeps one session alive against
//! a doorbell whose IP may change: connect, stream events, tear down fully
//! on failure, back off, optionally re-resolve the address, retry.

use crate::dps::{DatapointEvent, DpsMap, decode_dps};
use crate::error::{Result, TuyaError};
use crate::protocol::{CommandType, ProtocolVersion, TuyaMessage};
use crate::resolve::{IpResolver, NullResolver};
use crate::session::{ConnectionState, Session, SessionHandle, SessionTuning};
use futures_core::Stream;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PORT: u16 = 6668;

const RECONNECT_FLOOR: Duration = Duration::from_secs(10);
const RECONNECT_CAP: Duration = Duration::from_secs(300);
/// A session that held this long counts as a recovery; the next failure
/// starts over at the backoff floor.
const STABLE_UPTIME: Duration = Duration::from_secs(60);

/// Device descriptor as it comes from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    pub local_key: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_version")]
    pub version: ProtocolVersion,
    #[serde(default)]
    pub mac: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_version() -> ProtocolVersion {
    ProtocolVersion::V3_3
}

/// Everything the event sink sees: datapoint batches interleaved with
/// connection lifecycle transitions, in the order they happened.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Connected {
        host: String,
        at: SystemTime,
    },
    Disconnected {
        error: Option<TuyaError>,
        at: SystemTime,
    },
    Datapoints(DatapointEvent),
}

struct DeviceState {
    current_host: Option<String>,
    address_stale: bool,
    session: Option<SessionHandle>,
    failure_count: u32,
}

struct DeviceInner {
    config: DeviceConfig,
    key: Vec<u8>,
    tuning: SessionTuning,
    reconnect_floor: Duration,
    reconnect_cap: Duration,
    stable_uptime: Duration,
    resolver: Arc<dyn IpResolver>,
    state: RwLock<DeviceState>,
    events_tx: broadcast::Sender<DeviceEvent>,
    cancel: CancellationToken,
}

/// Builder for a [`Device`].
pub struct DeviceBuilder {
    config: DeviceConfig,
    tuning: SessionTuning,
    reconnect_floor: Duration,
    reconnect_cap: Duration,
    stable_uptime: Duration,
    resolver: Arc<dyn IpResolver>,
}

impl DeviceBuilder {
    pub fn new<I, K>(device_id: I, local_key: K) -> Self
    where
        I: Into<String>,
        K: Into<String>,
    {
        Self::from_config(DeviceConfig {
            device_id: device_id.into(),
            local_key: local_key.into(),
            host: None,
            port: DEFAULT_PORT,
            version: default_version(),
            mac: None,
        })
    }

    pub fn from_config(config: DeviceConfig) -> Self {
        Self {
            config,
            tuning: SessionTuning::default(),
            reconnect_floor: RECONNECT_FLOOR,
            reconnect_cap: RECONNECT_CAP,
            stable_uptime: STABLE_UPTIME,
            resolver: Arc::new(NullResolver),
        }
    }

    pub fn host<H: Into<String>>(mut self, host: H) -> Self {
        self.config.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn version(mut self, version: ProtocolVersion) -> Self {
        self.config.version = version;
        self
    }

    pub fn mac<M: Into<String>>(mut self, mac: M) -> Self {
        self.config.mac = Some(mac.into());
        self
    }

    /// Wire in the external discovery helper consulted when the last known
    /// address stops answering.
    pub fn resolver(mut self, resolver: Arc<dyn IpResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn tuning(mut self, tuning: SessionTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn reconnect_backoff(mut self, floor: Duration, cap: Duration) -> Self {
        self.reconnect_floor = floor;
        self.reconnect_cap = cap;
        self
    }

    pub fn stable_uptime(mut self, window: Duration) -> Self {
        self.stable_uptime = window;
        self
    }

    /// Build the device and start its background supervisor.
    pub fn build(self) -> Device {
        let (events_tx, _) = broadcast::channel(32);
        let current_host = self.config.host.clone();
        let key = self.config.local_key.clone().into_bytes();

        let inner = Arc::new(DeviceInner {
            config: self.config,
            key,
            tuning: self.tuning,
            reconnect_floor: self.reconnect_floor,
            reconnect_cap: self.reconnect_cap,
            stable_uptime: self.stable_uptime,
            resolver: self.resolver,
            state: RwLock::new(DeviceState {
                current_host,
                address_stale: false,
                session: None,
                failure_count: 0,
            }),
            events_tx,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_supervisor(inner.clone()));
        Device { inner }
    }
}

/// Handle to one doorbell. Clones share the same connection and supervisor.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn builder<I, K>(device_id: I, local_key: K) -> DeviceBuilder
    where
        I: Into<String>,
        K: Into<String>,
    {
        DeviceBuilder::new(device_id, local_key)
    }

    pub fn id(&self) -> &str {
        &self.inner.config.device_id
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .state
            .read()
            .session
            .as_ref()
            .is_some_and(|s| s.state() == ConnectionState::Ready)
    }

    /// Consecutive failed or dropped connection attempts since the last
    /// sustained success; the connection-status consumer's signal for
    /// telling a blip from an outage.
    pub fn failure_count(&self) -> u32 {
        self.inner.state.read().failure_count
    }

    /// Subscribe to lifecycle and datapoint events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Ordered stream of device events. Events already emitted before the
    /// call are not replayed.
    pub fn events(&self) -> impl Stream<Item = DeviceEvent> + Send + 'static {
        let mut rx = self.inner.events_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event subscriber lagged, {n} event(s) dropped");
                        continue;
                    }
                }
            }
        }
    }

    /// Query the device's current datapoint state.
    pub async fn status(&self) -> Result<DpsMap> {
        let resp = self.request(CommandType::DpQuery, None).await?;
        decode_dps(&resp.payload)
    }

    /// Set several datapoints at once, e.g. `json!({"157": 80})`.
    pub async fn set_dps(&self, dps: Value) -> Result<()> {
        self.request(CommandType::Control, Some(dps)).await?;
        Ok(())
    }

    /// Set a single datapoint value.
    pub async fn set_value(&self, index: u32, value: Value) -> Result<()> {
        self.set_dps(json!({ index.to_string(): value })).await
    }

    /// Low-level request against the live session. Fails immediately with
    /// [`TuyaError::NotConnected`] when no session is in the Ready state.
    pub async fn request(&self, cmd: CommandType, data: Option<Value>) -> Result<TuyaMessage> {
        let handle = self
            .inner
            .state
            .read()
            .session
            .clone()
            .ok_or(TuyaError::NotConnected)?;
        let (cmd, payload) = generate_payload(&self.inner.config, cmd, data);
        handle
            .send_and_await(cmd, &payload, self.inner.tuning.request_timeout)
            .await
    }

    /// Drop the current connection. The supervisor reconnects with backoff,
    /// re-resolving the address if needed.
    pub fn close(&self) {
        if let Some(session) = self.inner.state.read().session.clone() {
            session.abort(TuyaError::NotConnected);
        }
    }

    /// Permanently stop the supervisor and tear down any live session.
    pub fn stop(&self) {
        info!("Stopping device {}", self.id());
        self.inner.cancel.cancel();
    }
}

/// Build the JSON body for a command the way this device's firmware
/// generation expects it, and return the command actually sent on the wire.
fn generate_payload(
    config: &DeviceConfig,
    cmd: CommandType,
    data: Option<Value>,
) -> (CommandType, Value) {
    let cmd = config.version.effective_command(cmd);
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    // v3.4 control rides in the nested protocol-5 envelope.
    if cmd == CommandType::ControlNew && config.version == ProtocolVersion::V3_4 {
        let payload = json!({
            "protocol": 5,
            "t": t,
            "data": { "dps": data.unwrap_or_else(|| json!({})) },
        });
        return (cmd, payload);
    }

    let mut payload = json!({
        "gwId": config.device_id,
        "devId": config.device_id,
        "uid": config.device_id,
        "t": t.to_string(),
    });
    if let Some(dps) = data {
        payload["dps"] = dps;
    }
    (cmd, payload)
}

fn backoff_duration(floor: Duration, cap: Duration, attempt: u32) -> Duration {
    let ms = floor.as_millis() as u64;
    Duration::from_millis(ms.saturating_mul(1u64 << attempt.min(6))).min(cap)
}

async fn run_supervisor(inner: Arc<DeviceInner>) {
    let id = inner.config.device_id.clone();
    debug!("Supervisor for device {id} started");

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let failures = inner.state.read().failure_count;
        if failures > 0 {
            let wait = backoff_duration(inner.reconnect_floor, inner.reconnect_cap, failures - 1);
            warn!(
                "Waiting {:?} before reconnecting to {id} (failure count {failures})",
                wait
            );
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let Some(host) = resolve_host(&inner).await else {
            warn!("No address known for device {id}");
            inner.state.write().failure_count += 1;
            continue;
        };

        let session = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            s = Session::establish(
                &id,
                &host,
                inner.config.port,
                &inner.key,
                inner.config.version,
                inner.tuning.clone(),
                inner.events_tx.clone(),
            ) => s,
        };

        let mut session = match session {
            Ok(session) => session,
            Err(err) => {
                warn!("Connection attempt to {id} at {host} failed: {err}");
                {
                    let mut state = inner.state.write();
                    state.failure_count += 1;
                    // The device may have moved; ask the resolver next time.
                    state.address_stale = true;
                }
                let _ = inner.events_tx.send(DeviceEvent::Disconnected {
                    error: Some(err),
                    at: SystemTime::now(),
                });
                continue;
            }
        };

        {
            let mut state = inner.state.write();
            state.session = Some(session.handle());
            state.current_host = Some(host.clone());
            state.address_stale = false;
        }
        let _ = inner.events_tx.send(DeviceEvent::Connected {
            host: host.clone(),
            at: SystemTime::now(),
        });
        let connected_at = Instant::now();

        let error = tokio::select! {
            _ = inner.cancel.cancelled() => None,
            err = session.failed() => Some(err),
        };

        // Full teardown before any new attempt: no two sessions may ever
        // overlap for one device.
        inner.state.write().session = None;
        session.shutdown().await;
        let _ = inner.events_tx.send(DeviceEvent::Disconnected {
            error: error.clone(),
            at: SystemTime::now(),
        });

        let Some(error) = error else {
            break; // cancelled
        };
        info!(
            "Session for {id} ended after {:?}: {error}",
            connected_at.elapsed()
        );

        let mut state = inner.state.write();
        if connected_at.elapsed() >= inner.stable_uptime {
            state.failure_count = 0;
        }
        state.failure_count += 1;
        if state.failure_count > 1 {
            // Same address failed repeatedly; it may be stale.
            state.address_stale = true;
        }
    }

    debug!("Supervisor for device {id} exited");
}

/// Pick the address for the next attempt: the known-good host while it is
/// believed current, otherwise whatever the external resolver can find,
/// falling back to the stale address as a last resort.
async fn resolve_host(inner: &Arc<DeviceInner>) -> Option<String> {
    let (known, stale) = {
        let state = inner.state.read();
        (state.current_host.clone(), state.address_stale)
    };

    if let Some(host) = &known {
        if !stale {
            return Some(host.clone());
        }
    }

    let config = &inner.config;
    if let Some(found) = inner
        .resolver
        .resolve(&config.device_id, config.mac.as_deref())
        .await
    {
        info!("Resolved device {} to {found}", config.device_id);
        let mut state = inner.state.write();
        state.current_host = Some(found.clone());
        state.address_stale = false;
        return Some(found);
    }

    known
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_floor_and_caps() {
        let floor = Duration::from_secs(10);
        let cap = Duration::from_secs(300);
        assert_eq!(backoff_duration(floor, cap, 0), Duration::from_secs(10));
        assert_eq!(backoff_duration(floor, cap, 1), Duration::from_secs(20));
        assert_eq!(backoff_duration(floor, cap, 3), Duration::from_secs(80));
        assert_eq!(backoff_duration(floor, cap, 5), Duration::from_secs(300));
        assert_eq!(backoff_duration(floor, cap, 60), Duration::from_secs(300));
    }

    #[test]
    fn config_parses_with_defaults() {
        let config: DeviceConfig = serde_json::from_str(
            r#"{"device_id": "bf012345", "local_key": "0123456789abcdef"}"#,
        )
        .unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.version, ProtocolVersion::V3_3);
        assert!(config.host.is_none());

        let config: DeviceConfig = serde_json::from_str(
            r#"{"device_id": "x", "local_key": "k", "version": "3.4", "host": "10.0.0.9"}"#,
        )
        .unwrap();
        assert_eq!(config.version, ProtocolVersion::V3_4);
        assert_eq!(config.host.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn query_payload_carries_identity_fields() {
        let config = DeviceConfig {
            device_id: "bell01".into(),
            local_key: "k".into(),
            host: None,
            port: DEFAULT_PORT,
            version: ProtocolVersion::V3_3,
            mac: None,
        };
        let (cmd, payload) = generate_payload(&config, CommandType::DpQuery, None);
        assert_eq!(cmd, CommandType::DpQuery);
        assert_eq!(payload["gwId"], "bell01");
        assert_eq!(payload["devId"], "bell01");
        assert!(payload.get("dps").is_none());
    }

    #[test]
    fn v34_control_uses_nested_envelope() {
        let config = DeviceConfig {
            device_id: "bell01".into(),
            local_key: "k".into(),
            host: None,
            port: DEFAULT_PORT,
            version: ProtocolVersion::V3_4,
            mac: None,
        };
        let (cmd, payload) = generate_payload(
            &config,
            CommandType::Control,
            Some(json!({"157": 80})),
        );
        assert_eq!(cmd, CommandType::ControlNew);
        assert_eq!(payload["protocol"], 5);
        assert_eq!(payload["data"]["dps"]["157"], 80);

        let (cmd, _) = generate_payload(&config, CommandType::DpQuery, None);
        assert_eq!(cmd, CommandType::DpQueryNew);
    }

    #[test]
    fn v33_control_keeps_flat_payload() {
        let config = DeviceConfig {
            device_id: "bell01".into(),
            local_key: "k".into(),
            host: None,
            port: DEFAULT_PORT,
            version: ProtocolVersion::V3_3,
            mac: None,
        };
        let (cmd, payload) =
            generate_payload(&config, CommandType::Control, Some(json!({"1": true})));
        assert_eq!(cmd, CommandType::Control);
        assert_eq!(payload["dps"]["1"], true);
    }
}
