//! Device state manager
//!
//! Tracks every device the host has seen: whether it is physically attached,
//! how it is configured, and which account holds its session. A discovery
//! loop refreshes the attachment state and a checker closes sessions whose
//! owner stopped sending heartbeats.
//!
//! # Example
//! ```rust,no_run
//! # async fn demo() -> Result<(), ioscontrol::IdeviceError> {
//! use std::time::Duration;
//! use ioscontrol::device_state::{DeviceStateManager, ManagerConfig};
//! use ioscontrol::usbmuxd::UsbmuxdAddr;
//!
//! let manager = DeviceStateManager::new();
//! let tasks = manager.start(UsbmuxdAddr::default(), ManagerConfig::from_env());
//!
//! let account = uuid::Uuid::new_v4();
//! let ticket = manager.open("00008030-001A2C", account, Duration::from_secs(60))?;
//! manager.heartbeat("00008030-001A2C", account, ticket.session_key)?;
//! manager.close("00008030-001A2C", account, ticket.session_key, false)?;
//! ticket.completion.await.ok();
//!
//! tasks.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    IdeviceError,
    usbmuxd::{Connection, UsbmuxdDevice},
};

mod session;
mod source;

pub use session::{SessionCompletion, SessionError, SessionKind, SessionState, SessionTicket};
pub use source::{DeviceSource, NAME_ERROR};

use session::Session;

pub const DEVICE_TYPE_IOS: &str = "ios";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Connected,
    #[default]
    Disconnected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalConnectionState {
    pub kind: ConnectionKind,
    pub last_detected: Option<DateTime<Utc>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// What the device is able to do
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigurationState {
    pub supervised: bool,
    pub developer_mode_enabled: bool,
    /// The device answers basic commands
    pub basic_commands_work: bool,
    pub can_install_apps: bool,
    /// Everything needed to run UI tests is installed
    pub device_automation_available: bool,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Point in time copy of one device's state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub serial: String,
    pub name: String,
    pub device_type: &'static str,
    pub configuration_state: ConfigurationState,
    pub session_state: SessionState,
    pub physical_connection_state: PhysicalConnectionState,
}

#[derive(Debug)]
struct DeviceEntity {
    udid: String,
    name: String,
    physical: PhysicalConnectionState,
    configuration: ConfigurationState,
    session: Session,
}

impl DeviceEntity {
    fn new(udid: &str, name: String) -> Self {
        Self {
            udid: udid.to_string(),
            name,
            physical: PhysicalConnectionState::default(),
            configuration: ConfigurationState::default(),
            session: Session::default(),
        }
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            serial: self.udid.clone(),
            name: self.name.clone(),
            device_type: DEVICE_TYPE_IOS,
            configuration_state: self.configuration.clone(),
            session_state: self.session.state().clone(),
            physical_connection_state: self.physical.clone(),
        }
    }

    fn needs_name(&self) -> bool {
        self.name.is_empty() || self.name == NAME_ERROR
    }

    fn set_physical(&mut self, state: PhysicalConnectionState) {
        if self.physical != state {
            if self.physical.kind != state.kind {
                info!(
                    udid = %self.udid,
                    "Device physical connection state change: {:?} -> {:?}",
                    self.physical.kind,
                    state.kind
                );
            }
            self.physical = state;
        }
    }
}

type Entity = Arc<Mutex<DeviceEntity>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Intervals of the background tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    pub discovery_interval: Duration,
    pub session_check_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(Self::DEFAULT_DISCOVERY_INTERVAL_SEC),
            session_check_interval: Duration::from_secs(Self::DEFAULT_SESSION_CHECK_INTERVAL_SEC),
        }
    }
}

impl ManagerConfig {
    pub const DEFAULT_DISCOVERY_INTERVAL_SEC: u64 = 30;
    pub const DEFAULT_SESSION_CHECK_INTERVAL_SEC: u64 = 60;

    /// Reads `DEVICE_DISCOVERY_INTERVAL_SEC` and `SESSION_TIMEOUT_CHECK_INTERVAL_SEC`
    ///
    /// Missing, unparsable or zero values keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let seconds = |key: &str, default: u64| {
            let secs = match get(key).map(|v| v.trim().parse::<u64>()) {
                Some(Ok(s)) if s > 0 => s,
                Some(_) => {
                    warn!("Ignoring invalid {key}, using {default}s");
                    default
                }
                None => default,
            };
            Duration::from_secs(secs)
        };
        Self {
            discovery_interval: seconds(
                "DEVICE_DISCOVERY_INTERVAL_SEC",
                Self::DEFAULT_DISCOVERY_INTERVAL_SEC,
            ),
            session_check_interval: seconds(
                "SESSION_TIMEOUT_CHECK_INTERVAL_SEC",
                Self::DEFAULT_SESSION_CHECK_INTERVAL_SEC,
            ),
        }
    }
}

/// Handle to the state of every known device
///
/// Cloning is cheap, clones share the same devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceStateManager {
    devices: Arc<Mutex<BTreeMap<String, Entity>>>,
}

impl DeviceStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a device without waiting for discovery
    ///
    /// Does nothing if the device is already known.
    pub fn add_device(&self, udid: &str, name: &str) {
        lock(&self.devices)
            .entry(udid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceEntity::new(udid, name.to_string()))));
    }

    fn entity(&self, udid: &str) -> Result<Entity, SessionError> {
        lock(&self.devices)
            .get(udid)
            .cloned()
            .ok_or_else(|| SessionError::DeviceNotFound(udid.to_string()))
    }

    fn entities(&self) -> Vec<Entity> {
        lock(&self.devices).values().cloned().collect()
    }

    /// Allocates the device to `account_id`
    ///
    /// Only a free device can be opened. The ticket's completion fires when
    /// the session is closed or times out.
    pub fn open(
        &self,
        udid: &str,
        account_id: Uuid,
        timeout: Duration,
    ) -> Result<SessionTicket, SessionError> {
        let entity = self.entity(udid)?;
        let ticket = lock(&entity).session.open(account_id, timeout)?;
        info!(udid, %account_id, session_key = %ticket.session_key, "Session opened");
        Ok(ticket)
    }

    /// Keeps a session alive
    pub fn heartbeat(
        &self,
        udid: &str,
        account_id: Uuid,
        session_key: Uuid,
    ) -> Result<(), SessionError> {
        let entity = self.entity(udid)?;
        lock(&entity).session.heartbeat(account_id, session_key)?;
        trace!(udid, %session_key, "Session heartbeat");
        Ok(())
    }

    /// Releases the device
    ///
    /// With `admin_override` the session is closed whoever holds it.
    pub fn close(
        &self,
        udid: &str,
        account_id: Uuid,
        session_key: Uuid,
        admin_override: bool,
    ) -> Result<(), SessionError> {
        let entity = self.entity(udid)?;
        lock(&entity)
            .session
            .close(account_id, session_key, admin_override)?;
        info!(udid, %account_id, admin_override, "Session closed");
        Ok(())
    }

    /// Closes every session whose last heartbeat is older than its timeout
    ///
    /// # Returns
    /// How many sessions were closed
    pub fn check_timeouts(&self) -> usize {
        let now = Instant::now();
        self.entities()
            .iter()
            .filter(|e| lock(e).session.expire(now))
            .count()
    }

    /// Replaces the configuration state of a device
    pub fn update_configuration(
        &self,
        udid: &str,
        state: ConfigurationState,
    ) -> Result<(), SessionError> {
        let entity = self.entity(udid)?;
        let mut entity = lock(&entity);
        if entity.configuration == state {
            trace!(udid, "Device configuration unchanged");
            return Ok(());
        }
        info!(udid, "Device configuration change: {:?} -> {state:?}", entity.configuration);
        entity.configuration = state;
        Ok(())
    }

    pub fn device(&self, udid: &str) -> Option<DeviceInfo> {
        self.entity(udid).ok().map(|e| lock(&e).info())
    }

    /// Every known device, ordered by serial
    pub fn snapshot(&self) -> Vec<DeviceInfo> {
        self.entities().iter().map(|e| lock(e).info()).collect()
    }

    pub fn snapshot_json(&self) -> Result<String, IdeviceError> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Runs one discovery pass against `source`
    ///
    /// Known devices missing from the listing become disconnected. Listed
    /// devices become connected and new ones are added with a free session.
    /// Names are read for new devices and for devices whose name could not
    /// be loaded before.
    pub async fn discover_once<S: DeviceSource>(&self, source: &S) -> Result<(), IdeviceError> {
        debug!("Fetching devices");
        let listed = source.list_devices().await?;
        let now = Utc::now();

        let mut unnamed = Vec::new();
        for entity in self.entities() {
            let mut entity = lock(&entity);
            let mut state = entity.physical.clone();
            match listed.iter().find(|d| d.udid == entity.udid) {
                Some(dev) => {
                    state.kind = ConnectionKind::Connected;
                    state.last_detected = Some(now);
                    state.metadata = metadata(dev);
                    entity.set_physical(state);
                    if entity.needs_name() {
                        unnamed.push(dev.clone());
                    }
                }
                None => {
                    state.kind = ConnectionKind::Disconnected;
                    entity.set_physical(state);
                }
            }
        }

        let new: Vec<&UsbmuxdDevice> = {
            let devices = lock(&self.devices);
            listed
                .iter()
                .filter(|d| !devices.contains_key(&d.udid))
                .collect()
        };
        for dev in new {
            let name = read_name(source, dev).await;
            let mut entity = DeviceEntity::new(&dev.udid, name);
            entity.physical = PhysicalConnectionState {
                kind: ConnectionKind::Connected,
                last_detected: Some(now),
                metadata: metadata(dev),
            };
            info!(udid = %dev.udid, name = %entity.name, "New device detected");
            lock(&self.devices)
                .entry(dev.udid.clone())
                .or_insert_with(|| Arc::new(Mutex::new(entity)));
        }

        for dev in unnamed {
            let name = read_name(source, &dev).await;
            if let Ok(entity) = self.entity(&dev.udid) {
                lock(&entity).name = name;
            }
        }

        debug!("Found {} devices", listed.len());
        Ok(())
    }

    /// Spawns the discovery loop and the session timeout checker
    ///
    /// Discovery runs immediately and then every `discovery_interval`. A
    /// failed pass is logged and retried on the next tick.
    pub fn start<S: DeviceSource + 'static>(
        &self,
        source: S,
        config: ManagerConfig,
    ) -> ManagerTasks {
        let (stop, stopped) = watch::channel(false);

        let manager = self.clone();
        let mut rx = stopped.clone();
        let discovery = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.discovery_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = rx.changed() => break,
                }
                if let Err(e) = manager.discover_once(&source).await {
                    error!("Failed getting devices: {e}");
                }
            }
            debug!("Discovery loop stopped");
        });

        let manager = self.clone();
        let mut rx = stopped;
        let checker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.session_check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = rx.changed() => break,
                }
                let closed = manager.check_timeouts();
                if closed > 0 {
                    info!("Cleaned up {closed} timed out sessions");
                }
            }
            debug!("Session timeout checker stopped");
        });

        ManagerTasks {
            stop,
            handles: vec![discovery, checker],
        }
    }
}

/// The background tasks of a started manager
#[derive(Debug)]
pub struct ManagerTasks {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ManagerTasks {
    /// Stops both tasks and waits for them to finish
    pub async fn shutdown(self) {
        if self.stop.send(true).is_err() {
            debug!("Manager tasks already gone");
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Manager task ended abnormally: {e}");
            }
        }
    }
}

async fn read_name<S: DeviceSource>(source: &S, dev: &UsbmuxdDevice) -> String {
    match source.device_name(dev).await {
        Ok(name) => name,
        Err(e) => {
            warn!(udid = %dev.udid, "Failed reading device name: {e}");
            NAME_ERROR.to_string()
        }
    }
}

fn metadata(dev: &UsbmuxdDevice) -> serde_json::Map<String, serde_json::Value> {
    let mut m = serde_json::Map::new();
    m.insert("deviceId".into(), dev.device_id.into());
    let connection = match &dev.connection_type {
        Connection::Usb => "usb".to_string(),
        Connection::Network(ip) => format!("network {ip}"),
        Connection::Unknown(s) => s.clone(),
    };
    m.insert("connectionType".into(), connection.into());
    if let Some(p) = dev.product_id {
        m.insert("productId".into(), p.into());
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const UDID: &str = "00008030-001A2C";

    #[derive(Default)]
    struct FakeSource {
        devices: Mutex<Vec<UsbmuxdDevice>>,
        names: Mutex<HashMap<String, String>>,
        fail: Mutex<bool>,
    }

    impl FakeSource {
        fn attach(&self, udid: &str, id: u32) {
            lock(&self.devices).push(UsbmuxdDevice {
                connection_type: Connection::Usb,
                udid: udid.to_string(),
                device_id: id,
                product_id: Some(0x12a8),
                location_id: None,
                connection_speed: None,
            });
        }

        fn detach(&self, udid: &str) {
            lock(&self.devices).retain(|d| d.udid != udid);
        }
    }

    impl DeviceSource for FakeSource {
        async fn list_devices(&self) -> Result<Vec<UsbmuxdDevice>, IdeviceError> {
            if *lock(&self.fail) {
                return Err(IdeviceError::NoEstablishedConnection);
            }
            Ok(lock(&self.devices).clone())
        }

        async fn device_name(&self, device: &UsbmuxdDevice) -> Result<String, IdeviceError> {
            lock(&self.names)
                .get(&device.udid)
                .cloned()
                .ok_or(IdeviceError::PasswordProtected)
        }
    }

    #[tokio::test]
    async fn session_happy_path() {
        let manager = DeviceStateManager::new();
        manager.add_device(UDID, "iPhone");
        let account = Uuid::new_v4();

        let ticket = manager
            .open(UDID, account, Duration::from_secs(1))
            .unwrap();
        manager.heartbeat(UDID, account, ticket.session_key).unwrap();
        assert_eq!(
            manager
                .open(UDID, account, Duration::from_secs(1))
                .unwrap_err()
                .to_string(),
            "session already in use by this account"
        );

        manager
            .close(UDID, account, ticket.session_key, false)
            .unwrap();
        assert_eq!(ticket.completion.await.unwrap(), SessionCompletion::Closed);
        assert_eq!(
            manager.device(UDID).unwrap().session_state.kind,
            SessionKind::Free
        );
    }

    #[tokio::test]
    async fn unknown_device() {
        let manager = DeviceStateManager::new();
        assert_eq!(
            manager
                .open("nope", Uuid::new_v4(), Duration::from_secs(1))
                .unwrap_err(),
            SessionError::DeviceNotFound("nope".into())
        );
        assert!(
            manager
                .update_configuration("nope", ConfigurationState::default())
                .is_err()
        );
    }

    #[tokio::test]
    async fn checker_times_out_sessions() {
        let manager = DeviceStateManager::new();
        manager.add_device(UDID, "iPhone");
        let ticket = manager
            .open(UDID, Uuid::new_v4(), Duration::from_millis(1))
            .unwrap();

        let tasks = manager.start(
            FakeSource::default(),
            ManagerConfig {
                discovery_interval: Duration::from_secs(3600),
                session_check_interval: Duration::from_millis(1),
            },
        );
        let completion = tokio::time::timeout(Duration::from_secs(5), ticket.completion)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion, SessionCompletion::TimedOut);
        assert_eq!(
            manager.device(UDID).unwrap().session_state.kind,
            SessionKind::Free
        );
        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn unbounded_timeout_leaves_the_checker_running() {
        let manager = DeviceStateManager::new();
        manager.add_device(UDID, "iPhone");
        manager.add_device("00008101-000E", "iPad");
        manager
            .open(UDID, Uuid::new_v4(), Duration::MAX)
            .unwrap();
        let ticket = manager
            .open("00008101-000E", Uuid::new_v4(), Duration::from_millis(1))
            .unwrap();

        let tasks = manager.start(
            FakeSource::default(),
            ManagerConfig {
                discovery_interval: Duration::from_secs(3600),
                session_check_interval: Duration::from_millis(1),
            },
        );
        let completion = tokio::time::timeout(Duration::from_secs(5), ticket.completion)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion, SessionCompletion::TimedOut);
        assert_eq!(
            manager.device(UDID).unwrap().session_state.kind,
            SessionKind::InUse
        );
        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn discovery_tracks_attachment() {
        let manager = DeviceStateManager::new();
        let source = FakeSource::default();
        source.attach(UDID, 3);
        source.attach("other", 4);
        lock(&source.names).insert(UDID.to_string(), "Test iPhone".to_string());

        manager.discover_once(&source).await.unwrap();
        let devices = manager.snapshot();
        assert_eq!(devices.len(), 2);
        let phone = manager.device(UDID).unwrap();
        assert_eq!(phone.name, "Test iPhone");
        assert_eq!(phone.physical_connection_state.kind, ConnectionKind::Connected);
        assert_eq!(phone.session_state.kind, SessionKind::Free);
        assert_eq!(
            phone.physical_connection_state.metadata.get("deviceId"),
            Some(&serde_json::Value::from(3))
        );
        assert_eq!(manager.device("other").unwrap().name, NAME_ERROR);

        // the name is retried once the device answers
        lock(&source.names).insert("other".to_string(), "iPad".to_string());
        source.detach(UDID);
        manager.discover_once(&source).await.unwrap();
        assert_eq!(manager.device("other").unwrap().name, "iPad");
        let phone = manager.device(UDID).unwrap();
        assert_eq!(
            phone.physical_connection_state.kind,
            ConnectionKind::Disconnected
        );
        assert!(phone.physical_connection_state.last_detected.is_some());
    }

    #[tokio::test]
    async fn failed_listing_keeps_state() {
        let manager = DeviceStateManager::new();
        let source = FakeSource::default();
        source.attach(UDID, 1);
        manager.discover_once(&source).await.unwrap();

        *lock(&source.fail) = true;
        assert!(manager.discover_once(&source).await.is_err());
        assert_eq!(
            manager.device(UDID).unwrap().physical_connection_state.kind,
            ConnectionKind::Connected
        );
    }

    #[tokio::test]
    async fn background_discovery() {
        let manager = DeviceStateManager::new();
        let source = FakeSource::default();
        source.attach(UDID, 1);
        let tasks = manager.start(source, ManagerConfig::default());

        // the first tick fires immediately
        for _ in 0..100 {
            if manager.device(UDID).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.device(UDID).is_some());
        tasks.shutdown().await;
    }

    #[test]
    fn configuration_updates() {
        let manager = DeviceStateManager::new();
        manager.add_device(UDID, "iPhone");
        let state = ConfigurationState {
            developer_mode_enabled: true,
            basic_commands_work: true,
            ..Default::default()
        };
        manager.update_configuration(UDID, state.clone()).unwrap();
        assert_eq!(manager.device(UDID).unwrap().configuration_state, state);

        let json: serde_json::Value =
            serde_json::from_str(&manager.snapshot_json().unwrap()).unwrap();
        assert_eq!(json[0]["serial"], UDID);
        assert_eq!(json[0]["deviceType"], "ios");
        assert_eq!(json[0]["configurationState"]["developerModeEnabled"], true);
        assert_eq!(json[0]["sessionState"]["kind"], "free");
        assert_eq!(json[0]["physicalConnectionState"]["kind"], "disconnected");
    }

    #[test]
    fn config_from_env() {
        let env: HashMap<&str, &str> = [
            ("DEVICE_DISCOVERY_INTERVAL_SEC", "5"),
            ("SESSION_TIMEOUT_CHECK_INTERVAL_SEC", "0"),
        ]
        .into();
        let config = ManagerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.discovery_interval, Duration::from_secs(5));
        assert_eq!(config.session_check_interval, Duration::from_secs(60));

        let config = ManagerConfig::from_lookup(|_| Some("soon".into()));
        assert_eq!(config, ManagerConfig::default());
    }
}
