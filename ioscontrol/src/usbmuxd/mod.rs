//! USB Multiplexing Daemon (usbmuxd) Client
//!
//! usbmuxd owns every USB and network attached device on the host. Clients
//! talk to it over a local socket with tag-correlated plist frames and can
//! turn a connection into a byte tunnel to a port on the device.

use std::{
    net::{AddrParseError, IpAddr, SocketAddr},
    pin::Pin,
    str::FromStr,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use futures::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    Idevice, IdeviceError, ReadWrite, pair_record::PairRecord, provider::UsbmuxdProvider,
    usbmuxd::des::DeviceListResponse,
};

mod des;
mod raw_packet;

/// Represents the connection type of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Connected via USB
    Usb,
    /// Connected via network with specific IP address
    Network(IpAddr),
    /// Unknown connection type with description
    Unknown(String),
}

/// Represents a device connected through usbmuxd
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbmuxdDevice {
    /// How the device is connected
    pub connection_type: Connection,
    /// Unique Device Identifier, the serial number usbmuxd reports
    pub udid: String,
    /// usbmuxd-assigned transport ID
    pub device_id: u32,
    pub product_id: Option<u32>,
    pub location_id: Option<u32>,
    pub connection_speed: Option<u32>,
}

/// Attach and detach notifications from listen mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbmuxdListenEvent {
    Attached(UsbmuxdDevice),
    /// The transport ID of the device that went away
    Detached(u32),
}

/// Active connection to the usbmuxd service
///
/// Only one request is ever in flight. Every request borrows the connection
/// mutably, so callers sharing one must put it behind a lock.
pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
}

/// Address of the usbmuxd service
#[derive(Clone, Debug)]
pub enum UsbmuxdAddr {
    /// Unix domain socket path (Unix systems only)
    #[cfg(unix)]
    UnixSocket(String),
    /// TCP socket address
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    /// Default TCP port for usbmuxd
    pub const DEFAULT_PORT: u16 = 27015;
    /// Default Unix socket path for usbmuxd
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    /// Opens a stream to the usbmuxd service
    pub async fn to_socket(&self) -> Result<Box<dyn ReadWrite>, IdeviceError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    /// Creates a new usbmuxd connection
    ///
    /// # Arguments
    /// * `tag` - Tag of the last request, the next request uses `tag + 1`
    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, IdeviceError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket, tag))
    }

    /// Reads `USBMUXD_SOCKET_ADDRESS`, falling back to the platform default
    ///
    /// A value containing `:` is treated as a TCP address, anything else as a
    /// unix socket path.
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        Ok(match std::env::var("USBMUXD_SOCKET_ADDRESS") {
            Ok(var) => {
                #[cfg(unix)]
                if var.contains(':') {
                    Self::TcpSocket(SocketAddr::from_str(&var)?)
                } else {
                    Self::UnixSocket(var)
                }
                #[cfg(not(unix))]
                Self::TcpSocket(SocketAddr::from_str(&var)?)
            }
            Err(_) => Self::default(),
        })
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

impl UsbmuxdConnection {
    /// XML PLIST protocol version
    pub const XML_PLIST_VERSION: u32 = 1;
    /// PLIST message type
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    pub const PROG_NAME: &'static str = "ioscontrol";
    pub const CLIENT_VERSION: &'static str = concat!("ioscontrol-", env!("CARGO_PKG_VERSION"));
    /// Bundle ID sent with pair record requests
    pub const BUNDLE_ID: &'static str = "io.ioscontrol";

    /// Connects to usbmuxd at the platform default address
    pub async fn default() -> Result<Self, IdeviceError> {
        UsbmuxdAddr::default().connect(0).await
    }

    /// Creates a new usbmuxd connection
    ///
    /// # Arguments
    /// * `socket` - The transport stream
    /// * `tag` - Tag of the last request, the next request uses `tag + 1`
    pub fn new(socket: Box<dyn ReadWrite>, tag: u32) -> Self {
        Self { socket, tag }
    }

    fn base_request(message_type: &str) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), message_type.into());
        req.insert("ProgName".into(), Self::PROG_NAME.into());
        req.insert("ClientVersionString".into(), Self::CLIENT_VERSION.into());
        req.insert("kLibUSBMuxVersion".into(), 3.into());
        req
    }

    /// Sends one request and waits for the response carrying the same tag
    ///
    /// # Errors
    /// `UnexpectedResponse` if the muxer answers with a different tag
    pub async fn request(
        &mut self,
        req: plist::Dictionary,
    ) -> Result<plist::Dictionary, IdeviceError> {
        self.tag = self.tag.wrapping_add(1);
        let tag = self.tag;
        self.write_plist(req).await?;
        let (res_tag, res) = self.read_plist().await?;
        if res_tag != tag {
            warn!("usbmuxd answered tag {res_tag} to request {tag}");
            return Err(IdeviceError::UnexpectedResponse);
        }
        Ok(res)
    }

    /// Checks the `Number` result code of a response
    fn check_result(res: &plist::Dictionary, operation: &'static str) -> Result<(), IdeviceError> {
        match res.get("Number").and_then(|x| x.as_unsigned_integer()) {
            Some(0) => Ok(()),
            Some(code) => Err(IdeviceError::MuxCommandFailed { code, operation }),
            None => Err(IdeviceError::MissingField("Number")),
        }
    }

    /// Lists all connected devices
    ///
    /// Entries usbmuxd reports that can't be parsed are skipped.
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, IdeviceError> {
        let res = self.request(Self::base_request("ListDevices")).await?;
        let res = plist::from_value::<des::ListDevicesResponse>(&plist::Value::Dictionary(res))?;

        let devs = res
            .device_list
            .into_iter()
            .flat_map(|x| x.into_usbmuxd_dev())
            .collect::<Vec<UsbmuxdDevice>>();

        Ok(devs)
    }

    /// Gets a specific device by UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<UsbmuxdDevice, IdeviceError> {
        let devices = self.get_devices().await?;
        match devices.into_iter().find(|x| x.udid == udid) {
            Some(d) => Ok(d),
            None => Err(IdeviceError::DeviceNotFound),
        }
    }

    /// Reads the pair record usbmuxd stores for a device
    ///
    /// # Arguments
    /// * `udid` - The device serial number
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairRecord, IdeviceError> {
        debug!("Getting pair record for {udid}");
        let mut req = Self::base_request("ReadPairRecord");
        req.insert("PairRecordID".into(), udid.into());
        req.insert("BundleID".into(), Self::BUNDLE_ID.into());
        let res = self.request(req).await?;

        if res.contains_key("Number") {
            Self::check_result(&res, "ReadPairRecord")?;
        }
        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairRecord::from_bytes(d),
            _ => Err(IdeviceError::MissingField("PairRecordData")),
        }
    }

    /// Gets the system BUID
    pub async fn get_buid(&mut self) -> Result<String, IdeviceError> {
        let mut res = self.request(Self::base_request("ReadBUID")).await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(IdeviceError::MissingField("BUID")),
        }
    }

    /// Turns this connection into a tunnel to a port on the device
    ///
    /// The connection is consumed, usbmuxd forwards raw bytes from here on.
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd transport ID
    /// * `port` - TCP port on the device (host byte order, sent in network order)
    /// * `label` - Connection label
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<Idevice, IdeviceError> {
        debug!("Connecting to device {device_id} on port {port}");
        let mut req = Self::base_request("Connect");
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), port.to_be().into());
        let res = self.request(req).await?;
        Self::check_result(&res, "Connect")?;
        Ok(Idevice::new(self.socket, label))
    }

    /// Switches to listen mode and streams attach and detach events
    ///
    /// The stream ends when usbmuxd closes the socket.
    pub async fn listen<'a>(
        &'a mut self,
    ) -> Result<
        Pin<Box<dyn Stream<Item = Result<UsbmuxdListenEvent, IdeviceError>> + Send + 'a>>,
        IdeviceError,
    > {
        let mut req = Self::base_request("Listen");
        req.insert("ConnType".into(), 1.into());
        let res = self.request(req).await?;
        Self::check_result(&res, "Listen")?;

        let stream = futures::stream::try_unfold(self, |conn| async move {
            loop {
                let msg = match conn.read_plist().await {
                    Ok((_, msg)) => msg,
                    Err(IdeviceError::Socket(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        debug!("usbmuxd closed the listen connection");
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                };

                match msg.get("MessageType").and_then(|x| x.as_string()) {
                    Some("Attached") => {
                        let dev = plist::from_value::<DeviceListResponse>(
                            &plist::Value::Dictionary(msg),
                        )
                        .map_err(IdeviceError::from)
                        .and_then(|d| d.into_usbmuxd_dev());
                        match dev {
                            Ok(dev) => return Ok(Some((UsbmuxdListenEvent::Attached(dev), conn))),
                            Err(e) => warn!("Received malformed attach message: {e:?}"),
                        }
                    }
                    Some("Detached") => {
                        match msg.get("DeviceID").and_then(|v| v.as_unsigned_integer()) {
                            Some(id) => {
                                return Ok(Some((UsbmuxdListenEvent::Detached(id as u32), conn)));
                            }
                            None => debug!("Device detached (unknown ID)"),
                        }
                    }
                    Some("Paired") => debug!("Device paired: {msg:?}"),
                    Some(other) => warn!("Received unexpected message type during listen: {other}"),
                    None => warn!("Received malformed message during listen (no MessageType)"),
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn write_plist(&mut self, req: plist::Dictionary) -> Result<(), IdeviceError> {
        debug!(
            "Writing to muxer (tag {}): {}",
            self.tag,
            crate::pretty_print_dictionary(&req)
        );
        let raw = raw_packet::RawPacket::new(
            req,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        )?;

        let raw: Vec<u8> = raw.into();
        self.socket.write_all(&raw).await?;
        self.socket.flush().await?;
        Ok(())
    }

    async fn read_plist(&mut self) -> Result<(u32, plist::Dictionary), IdeviceError> {
        let mut header_buffer = [0; raw_packet::HEADER_LEN];
        self.socket.read_exact(&mut header_buffer).await?;
        let header = raw_packet::RawPacketHeader::parse(&header_buffer);
        let packet_size = header.body_len()?;
        debug!("Reading {packet_size} bytes from muxer");

        let mut body_buffer = vec![0; packet_size];
        self.socket.read_exact(&mut body_buffer).await?;

        let res = plist::from_bytes(&body_buffer)?;
        debug!("Read from muxer: {}", crate::pretty_print_dictionary(&res));

        Ok((header.tag, res))
    }
}

impl UsbmuxdDevice {
    /// Creates a provider for this device
    pub fn to_provider(&self, addr: UsbmuxdAddr, label: impl Into<String>) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            tag: self.device_id,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label: label.into(),
        }
    }
}
