//! iOS Lockdown Service Client
//!
//! lockdownd listens on a well-known port of every device. It answers
//! questions about the device, opens the TLS session that authenticates this
//! host, and starts the other services, each on a one-shot port.

use plist::Value;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::{
    Idevice, IdeviceError, IdeviceService, TlsRole, pair_record::PairRecord,
    provider::IdeviceProvider,
};

/// Client for the lockdown service
///
/// The protocol is strictly half duplex: one request, one response.
pub struct LockdownClient {
    /// The underlying device connection
    pub idevice: Idevice,
    session: Option<SessionHandle>,
}

/// An open lockdown session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Identifier assigned by the device
    pub session_id: String,
    /// Whether the connection was upgraded to TLS for this session
    pub ssl_enabled: bool,
}

/// A service started by lockdown, valid for a single connection
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "the service port can only be used once"]
pub struct ServiceDescriptor {
    pub name: String,
    pub port: u16,
    /// The new connection must be upgraded to TLS before any service framing
    pub requires_tls: bool,
}

impl IdeviceService for LockdownClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.lockdown"
    }

    async fn connect(provider: &dyn IdeviceProvider) -> Result<Self, IdeviceError> {
        let idevice = provider.connect(Self::LOCKDOWND_PORT).await?;
        Ok(Self::new(idevice))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct LockdownRequest<'a> {
    label: &'a str,
    request: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<&'a str>,
    #[serde(rename = "SessionID", skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    #[serde(rename = "HostID", skip_serializing_if = "Option::is_none")]
    host_id: Option<&'a str>,
    #[serde(rename = "SystemBUID", skip_serializing_if = "Option::is_none")]
    system_buid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol_version: Option<&'static str>,
}

impl<'a> LockdownRequest<'a> {
    fn new(label: &'a str, request: &'static str) -> Self {
        Self {
            label,
            request,
            key: None,
            domain: None,
            value: None,
            service: None,
            session_id: None,
            host_id: None,
            system_buid: None,
            protocol_version: None,
        }
    }
}

impl LockdownClient {
    /// The default TCP port for the lockdown service
    pub const LOCKDOWND_PORT: u16 = 62078;

    /// Creates a new lockdown client from an existing device connection
    pub fn new(idevice: Idevice) -> Self {
        Self {
            idevice,
            session: None,
        }
    }

    /// The currently open session, if any
    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    /// Sends one request and reads its response
    ///
    /// A response that answers a different request means the channel is out
    /// of step with the device, so it is closed.
    async fn request(&mut self, req: LockdownRequest<'_>) -> Result<plist::Dictionary, IdeviceError> {
        let name = req.request;
        self.idevice.send_plist(plist::to_value(&req)?).await?;
        let res = self.idevice.read_plist().await?;

        match res.get("Request").and_then(|x| x.as_string()) {
            Some(r) if r == name => Ok(res),
            other => {
                error!("Lockdown answered {other:?} to {name}, closing");
                self.idevice.close().await;
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }

    /// Retrieves a value from the device
    ///
    /// # Arguments
    /// * `key` - The value to read (e.g. `ProductVersion`), `None` for every value
    /// * `domain` - Optional domain such as `com.apple.disk_usage`
    ///
    /// # Example
    /// ```rust,no_run
    /// # async fn f(client: &mut ioscontrol::lockdown::LockdownClient) -> Result<(), ioscontrol::IdeviceError> {
    /// let version = client.get_value(Some("ProductVersion"), None).await?;
    /// println!("iOS {:?}", version.as_string());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, IdeviceError> {
        let label = self.idevice.label().to_string();
        let mut req = LockdownRequest::new(&label, "GetValue");
        req.key = key.filter(|k| !k.is_empty());
        req.domain = domain;

        let mut res = self.request(req).await?;
        res.remove("Value").ok_or(IdeviceError::MissingField("Value"))
    }

    /// Sets a value on the device
    pub async fn set_value(
        &mut self,
        key: &str,
        value: Value,
        domain: Option<&str>,
    ) -> Result<(), IdeviceError> {
        let label = self.idevice.label().to_string();
        let mut req = LockdownRequest::new(&label, "SetValue");
        req.key = Some(key);
        req.value = Some(value);
        req.domain = domain;

        self.request(req).await?;
        Ok(())
    }

    /// Opens a session authenticated by the pair record
    ///
    /// When the device asks for it, the connection is upgraded to TLS before
    /// anything else is sent.
    pub async fn start_session(
        &mut self,
        pair_record: &PairRecord,
    ) -> Result<SessionHandle, IdeviceError> {
        let label = self.idevice.label().to_string();
        let mut req = LockdownRequest::new(&label, "StartSession");
        req.protocol_version = Some("2");
        req.host_id = Some(&pair_record.host_id);
        req.system_buid = Some(&pair_record.system_buid);

        let res = self.request(req).await?;
        let session_id = match res.get("SessionID").and_then(|x| x.as_string()) {
            Some(s) => s.to_string(),
            None => {
                warn!("StartSession response without SessionID");
                return Err(IdeviceError::MissingField("SessionID"));
            }
        };
        let ssl_enabled = res
            .get("EnableSessionSSL")
            .and_then(|x| x.as_boolean())
            .unwrap_or(false);

        if ssl_enabled {
            self.idevice
                .upgrade_tls(pair_record, TlsRole::Client)
                .await?;
        }
        debug!("Started lockdown session {session_id} (ssl: {ssl_enabled})");

        let handle = SessionHandle {
            session_id,
            ssl_enabled,
        };
        self.session = Some(handle.clone());
        Ok(handle)
    }

    /// Closes the current session
    pub async fn stop_session(&mut self) -> Result<(), IdeviceError> {
        let session = self.session.take().ok_or(IdeviceError::SessionInactive)?;
        let label = self.idevice.label().to_string();
        let mut req = LockdownRequest::new(&label, "StopSession");
        req.session_id = Some(&session.session_id);

        self.request(req).await?;
        Ok(())
    }

    /// Asks lockdown to start a service
    ///
    /// # Arguments
    /// * `name` - The service identifier (e.g. `com.apple.instruments.remoteserver`)
    ///
    /// # Errors
    /// `ServiceNotFound` when the device doesn't know the service, which for
    /// developer services usually means the developer image is not mounted
    pub async fn start_service(&mut self, name: &str) -> Result<ServiceDescriptor, IdeviceError> {
        let label = self.idevice.label().to_string();
        let mut req = LockdownRequest::new(&label, "StartService");
        req.service = Some(name);

        let res = match self.request(req).await {
            Ok(res) => res,
            Err(e) => {
                warn!("Could not start service {name}: {e}");
                return Err(e);
            }
        };

        let requires_tls = res
            .get("EnableServiceSSL")
            .and_then(|x| x.as_boolean())
            .unwrap_or(false); // absent over USB on older devices
        let port = match res.get("Port").and_then(|x| x.as_unsigned_integer()) {
            Some(port) => u16::try_from(port).map_err(|_| IdeviceError::UnexpectedResponse)?,
            None => {
                error!("Response didn't contain an integer port");
                return Err(IdeviceError::MissingField("Port"));
            }
        };

        Ok(ServiceDescriptor {
            name: name.to_string(),
            port,
            requires_tls,
        })
    }
}

impl ServiceDescriptor {
    /// Opens a fresh tunnel to the service port, upgraded to TLS if required
    pub async fn open(
        self,
        provider: &dyn IdeviceProvider,
        pair_record: &PairRecord,
    ) -> Result<Idevice, IdeviceError> {
        let mut idevice = provider.connect(self.port).await?;
        if self.requires_tls {
            idevice.upgrade_tls(pair_record, TlsRole::Client).await?;
        }
        debug!("Opened {} on port {}", self.name, self.port);
        Ok(idevice)
    }
}

impl From<Idevice> for LockdownClient {
    fn from(value: Idevice) -> Self {
        Self::new(value)
    }
}
