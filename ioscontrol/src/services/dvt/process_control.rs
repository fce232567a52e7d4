//! Process control service client for the instruments protocol.
//!
//! Launches, kills and manages processes on the device.
//!
//! # Example
//! ```rust,no_run
//! # use ioscontrol::{IdeviceError, IdeviceService, provider::IdeviceProvider};
//! use ioscontrol::dvt::{InstrumentsConnection, process_control::ProcessControlClient};
//!
//! # async fn demo(provider: &dyn IdeviceProvider) -> Result<(), IdeviceError> {
//! let conn = InstrumentsConnection::connect(provider).await?;
//! let process_control = ProcessControlClient::new(&conn).await?;
//!
//! let pid = process_control
//!     .launch_app("com.apple.Preferences", None, &[], false, true)
//!     .await?;
//! process_control.disable_memory_limit(pid).await?;
//! process_control.kill_app(pid).await?;
//! # Ok(())
//! # }
//! ```

use indexmap::IndexMap;
use tracing::{info, warn};

use crate::{
    IdeviceError,
    dtx::{Channel, PrimitiveDictionary},
    nskeyedarchive::ArchiveValue,
};

use super::InstrumentsConnection;

pub const CHANNEL_IDENTIFIER: &str = "com.apple.instruments.server.services.processcontrol";

const LAUNCH_SELECTOR: &str =
    "launchSuspendedProcessWithDevicePath:bundleIdentifier:environment:arguments:options:";
/// The device ignores the path, the bundle identifier decides what runs
const DEVICE_PATH: &str = "/private/";

/// Client for process control operations
#[derive(Debug, Clone)]
pub struct ProcessControlClient {
    channel: Channel,
}

impl ProcessControlClient {
    /// Opens the process control channel
    ///
    /// # Errors
    /// Propagates errors from channel creation
    pub async fn new(conn: &InstrumentsConnection) -> Result<Self, IdeviceError> {
        Ok(Self {
            channel: conn.channel(CHANNEL_IDENTIFIER).await?,
        })
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }

    /// Launches an application
    ///
    /// `NSUnbufferedIO=YES` is always part of the environment so the app's
    /// output is forwarded over the global channel. Entries of `env_vars`
    /// override it.
    ///
    /// # Arguments
    /// * `bundle_id` - The bundle identifier of the app to launch
    /// * `env_vars` - Extra environment variables
    /// * `arguments` - Launch arguments
    /// * `start_suspended` - Whether to start the process suspended
    /// * `kill_existing` - Whether to kill running instances first
    ///
    /// # Returns
    /// The pid of the launched process
    pub async fn launch_app(
        &self,
        bundle_id: &str,
        env_vars: Option<IndexMap<String, ArchiveValue>>,
        arguments: &[String],
        start_suspended: bool,
        kill_existing: bool,
    ) -> Result<u64, IdeviceError> {
        let mut env = IndexMap::new();
        env.insert("NSUnbufferedIO".to_string(), ArchiveValue::from("YES"));
        env.extend(env_vars.unwrap_or_default());

        let mut options = IndexMap::new();
        options.insert(
            "StartSuspendedKey".to_string(),
            ArchiveValue::from(u64::from(start_suspended)),
        );
        options.insert(
            "KillExisting".to_string(),
            ArchiveValue::from(u64::from(kill_existing)),
        );

        let arguments = arguments
            .iter()
            .map(|a| ArchiveValue::from(a.as_str()))
            .collect();
        self.start_process(bundle_id, env, arguments, options).await
    }

    /// Launches `bundle_id` with exactly the given environment, arguments
    /// and options
    ///
    /// # Errors
    /// * `IdeviceError::RemoteError` if the device refused the launch
    /// * `IdeviceError::UnexpectedResponse` if the reply holds no pid
    pub async fn start_process(
        &self,
        bundle_id: &str,
        env: IndexMap<String, ArchiveValue>,
        arguments: Vec<ArchiveValue>,
        options: IndexMap<String, ArchiveValue>,
    ) -> Result<u64, IdeviceError> {
        info!(channel_id = CHANNEL_IDENTIFIER, bundle_id, "Launching process");
        let res = self
            .channel
            .invoke(
                LAUNCH_SELECTOR,
                &[
                    DEVICE_PATH.into(),
                    bundle_id.into(),
                    ArchiveValue::Dictionary(env),
                    ArchiveValue::Array(arguments),
                    ArchiveValue::Dictionary(options),
                ],
            )
            .await?;

        match res.payload.first().and_then(|p| p.as_unsigned()) {
            Some(pid) => {
                info!(channel_id = CHANNEL_IDENTIFIER, pid, "Process started");
                Ok(pid)
            }
            None => {
                warn!("Launch reply did not hold a pid: {res}");
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }

    /// Kills a running process
    pub async fn kill_app(&self, pid: u64) -> Result<(), IdeviceError> {
        self.channel.invoke("killPid:", &[ArchiveValue::from(pid)]).await?;
        Ok(())
    }

    /// Disables memory limits for a process
    ///
    /// # Errors
    /// * `IdeviceError::DisableMemoryLimitFailed` if the device refused
    /// * `IdeviceError::UnexpectedResponse` for a reply that is not a boolean
    pub async fn disable_memory_limit(&self, pid: u64) -> Result<(), IdeviceError> {
        let mut aux = PrimitiveDictionary::new();
        aux.push(pid as u32);
        let res = self
            .channel
            .invoke_with_aux("requestDisableMemoryLimitsForPid:", aux)
            .await?;
        match res.payload.first().and_then(|p| p.as_boolean()) {
            Some(true) => Ok(()),
            Some(false) => {
                warn!("Failed to disable memory limit");
                Err(IdeviceError::DisableMemoryLimitFailed)
            }
            None => {
                warn!("Did not get bool response");
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtx::AuxValue;
    use crate::services::dvt::fake;

    fn unarchived(m: &crate::dtx::DtxMessage, i: usize) -> ArchiveValue {
        m.aux.get(i).and_then(|a| a.unarchive()).unwrap().unwrap()[0].clone()
    }

    #[tokio::test]
    async fn launch_sends_defaults() {
        let (conn, mut device) = fake::instruments(Box::new(|m| match m.selector() {
            Some(LAUNCH_SELECTOR) => Some(ArchiveValue::from(4242u64)),
            _ => None,
        }));
        let pc = ProcessControlClient::new(&conn).await.unwrap();

        let mut env = IndexMap::new();
        env.insert("FOO".to_string(), ArchiveValue::from("bar"));
        let pid = pc
            .launch_app("com.example.app", Some(env), &["-v".to_string()], true, false)
            .await
            .unwrap();
        assert_eq!(pid, 4242);

        let sent = device.next_call().await;
        assert_eq!(sent.selector(), Some(LAUNCH_SELECTOR));
        assert_eq!(unarchived(&sent, 0), ArchiveValue::from("/private/"));
        assert_eq!(unarchived(&sent, 1), ArchiveValue::from("com.example.app"));

        let env = unarchived(&sent, 2);
        let env = env.as_dictionary().unwrap();
        assert_eq!(env.get("NSUnbufferedIO"), Some(&ArchiveValue::from("YES")));
        assert_eq!(env.get("FOO"), Some(&ArchiveValue::from("bar")));

        assert_eq!(
            unarchived(&sent, 3),
            ArchiveValue::Array(vec!["-v".into()])
        );
        let options = unarchived(&sent, 4);
        let options = options.as_dictionary().unwrap();
        assert_eq!(
            options.get("StartSuspendedKey").and_then(|v| v.as_unsigned()),
            Some(1)
        );
        assert_eq!(
            options.get("KillExisting").and_then(|v| v.as_unsigned()),
            Some(0)
        );
    }

    #[tokio::test]
    async fn launch_without_pid() {
        let (conn, _device) = fake::instruments(Box::new(|_| Some("nope".into())));
        let pc = ProcessControlClient::new(&conn).await.unwrap();
        assert!(matches!(
            pc.launch_app("com.example.app", None, &[], false, false).await,
            Err(IdeviceError::UnexpectedResponse)
        ));
    }

    #[tokio::test]
    async fn memory_limit() {
        let (conn, mut device) = fake::instruments(Box::new(|m| {
            let pid = m.aux.get(0).cloned();
            Some(ArchiveValue::Boolean(pid == Some(AuxValue::U32(7))))
        }));
        let pc = ProcessControlClient::new(&conn).await.unwrap();
        pc.disable_memory_limit(7).await.unwrap();
        assert!(matches!(
            pc.disable_memory_limit(8).await,
            Err(IdeviceError::DisableMemoryLimitFailed)
        ));

        let sent = device.next_call().await;
        assert_eq!(sent.selector(), Some("requestDisableMemoryLimitsForPid:"));
        assert_eq!(sent.aux.get(0), Some(&AuxValue::U32(7)));
    }

    #[tokio::test]
    async fn kill() {
        let (conn, mut device) = fake::instruments(Box::new(|_| None));
        let pc = ProcessControlClient::new(&conn).await.unwrap();
        pc.kill_app(99).await.unwrap();
        let sent = device.next_call().await;
        assert_eq!(sent.selector(), Some("killPid:"));
        assert_eq!(unarchived(&sent, 0).as_unsigned(), Some(99));
    }
}
