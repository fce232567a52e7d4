#![doc = include_str!("../README.md")]

#[cfg(not(any(feature = "aws-lc", feature = "ring")))]
compile_error!("either the `aws-lc` or the `ring` feature must be enabled");

#[cfg(feature = "device_state")]
pub mod device_state;
#[cfg(feature = "dtx")]
pub mod dtx;
#[cfg(feature = "nskeyedarchive")]
pub mod nskeyedarchive;
pub mod pair_record;
pub mod provider;
pub mod services;
mod tls;
#[cfg(feature = "usbmuxd")]
pub mod usbmuxd;
mod util;

pub use services::*;
pub use util::{pretty_print_dictionary, pretty_print_plist};

use pair_record::PairRecord;
use provider::IdeviceProvider;
use rustls::pki_types::ServerName;
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream and UnixStream implement this trait, as do the TLS streams
/// produced by [`Idevice::upgrade_tls`].
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Interface for services that are started through lockdown
pub trait IdeviceService: Sized {
    /// Returns the service name as advertised by the device
    fn service_name() -> &'static str;

    /// Establishes a connection to this service
    ///
    /// # Arguments
    /// * `provider` - The device provider that can supply connections
    fn connect(
        provider: &dyn IdeviceProvider,
    ) -> impl std::future::Future<Output = Result<Self, IdeviceError>> + Send;
}

/// Type alias for boxed device connection sockets
pub type IdeviceSocket = Box<dyn ReadWrite>;

/// Which side of the handshake this host plays when upgrading to TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    /// The host connects to the device and presents its pair record identity
    Client,
    /// The host accepts a handshake initiated by the peer
    Server,
}

/// Main handle for communicating with an iOS device
///
/// Owns the byte stream of one connection. Lockdown style framing (a 4 byte
/// big-endian length followed by a property list) is provided here since
/// several layers share it.
pub struct Idevice {
    /// The underlying connection socket, `None` once closed
    socket: Option<Box<dyn ReadWrite>>,
    /// Label sent with lockdown requests
    label: String,
}

impl std::fmt::Debug for Idevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Idevice")
            .field("label", &self.label)
            .field("closed", &self.socket.is_none())
            .finish()
    }
}

impl Idevice {
    /// Creates a new device connection handle
    ///
    /// # Arguments
    /// * `socket` - The established connection socket
    /// * `label` - Identifier sent to the device with lockdown requests
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the connection has been closed or lost to a failed upgrade
    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Drops the socket. Every later read or write fails with
    /// [`IdeviceError::NoEstablishedConnection`]. Calling twice is harmless.
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take()
            && let Err(e) = socket.shutdown().await
        {
            debug!("Error shutting down socket: {e:?}");
        }
    }

    /// Gives up ownership of the underlying stream
    pub fn into_inner(self) -> Option<Box<dyn ReadWrite>> {
        self.socket
    }

    fn socket_mut(&mut self) -> Result<&mut Box<dyn ReadWrite>, IdeviceError> {
        self.socket
            .as_mut()
            .ok_or(IdeviceError::NoEstablishedConnection)
    }

    /// Sends a length prefixed XML plist
    ///
    /// # Errors
    /// Returns `IdeviceError` if serialization or transmission fails
    pub async fn send_plist(&mut self, message: plist::Value) -> Result<(), IdeviceError> {
        debug!("Sending plist: {}", pretty_print_plist(&message));

        let mut buf = Vec::new();
        message.to_writer_xml(&mut buf)?;
        let len = buf.len() as u32;

        let socket = self.socket_mut()?;
        socket.write_all(&len.to_be_bytes()).await?;
        socket.write_all(&buf).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Reads a length prefixed plist
    ///
    /// A response carrying an `Error` key is turned into the matching
    /// `IdeviceError`.
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let socket = self.socket_mut()?;
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await?;
        let len = u32::from_be_bytes(buf);
        let mut buf = vec![0; len as usize];
        socket.read_exact(&mut buf).await?;
        let res: plist::Dictionary = plist::from_bytes(&buf)?;
        debug!("Received plist: {}", pretty_print_dictionary(&res));

        if let Some(e) = res.get("Error") {
            let e = match e.as_string() {
                Some(e) => e,
                None => return Err(IdeviceError::UnexpectedResponse),
            };
            return Err(IdeviceError::from_device_error_type(e, &res)
                .unwrap_or_else(|| IdeviceError::UnknownErrorType(e.to_string())));
        }
        Ok(res)
    }

    /// Sends raw bytes to the device
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), IdeviceError> {
        let socket = self.socket_mut()?;
        socket.write_all(message).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Reads exactly `len` bytes from the device
    ///
    /// # Errors
    /// Returns `IdeviceError` if reading fails or connection is closed prematurely
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, IdeviceError> {
        let socket = self.socket_mut()?;
        let mut buf = vec![0; len];
        socket.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads up to `max_size` bytes from the device
    ///
    /// Returns an empty vector at end of stream.
    pub async fn read_any(&mut self, max_size: u32) -> Result<Vec<u8>, IdeviceError> {
        let socket = self.socket_mut()?;
        let mut buf = vec![0; max_size as usize];
        let len = socket.read(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Upgrades the connection to TLS in place using the pair record identity
    ///
    /// The device certificate is not verified, the pair record is the trust
    /// anchor. Requires `&mut self`, so nothing can read the stream while the
    /// handshake runs. On failure the connection is closed.
    ///
    /// # Arguments
    /// * `pair_record` - Host identity and certificates for this device
    /// * `role` - Whether this host initiates or accepts the handshake
    pub async fn upgrade_tls(
        &mut self,
        pair_record: &PairRecord,
        role: TlsRole,
    ) -> Result<(), IdeviceError> {
        tls::ensure_crypto_provider();

        let socket = self
            .socket
            .take()
            .ok_or(IdeviceError::NoEstablishedConnection)?;

        let socket: Box<dyn ReadWrite> = match role {
            TlsRole::Client => {
                let config = tls::create_client_config(pair_record)?;
                let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
                let name = ServerName::try_from("Device")
                    .map_err(|e| IdeviceError::TlsFailed(e.to_string()))?;
                let stream = connector.connect(name, socket).await.map_err(|e| {
                    warn!("TLS client handshake failed: {e:?}");
                    IdeviceError::TlsFailed(e.to_string())
                })?;
                Box::new(stream)
            }
            TlsRole::Server => {
                let config = tls::create_server_config(pair_record)?;
                let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
                let stream = acceptor.accept(socket).await.map_err(|e| {
                    warn!("TLS server handshake failed: {e:?}");
                    IdeviceError::TlsFailed(e.to_string())
                })?;
                Box::new(stream)
            }
        };
        debug!("Upgraded connection to TLS as {role:?}");

        self.socket = Some(socket);
        Ok(())
    }
}

/// Comprehensive error type for all device communication failures
#[derive(Error, Debug)]
#[repr(i32)]
#[non_exhaustive]
pub enum IdeviceError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error) = -1,
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error) = -2,
    #[error("TLS error")]
    Rustls(#[from] rustls::Error) = -3,
    #[error("io on plist")]
    Plist(#[from] plist::Error) = -4,
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error) = -5,
    #[error("unexpected response from device")]
    UnexpectedResponse = -6,
    #[error("this request was prohibited")]
    GetProhibited = -7,
    #[error("no SSL session is active")]
    SessionInactive = -8,
    #[error("device does not have pairing file")]
    InvalidHostID = -9,
    #[error("no established connection")]
    NoEstablishedConnection = -10,
    #[error("service not found")]
    ServiceNotFound = -11,
    #[error("device is locked")]
    PasswordProtected = -12,
    #[error("internal error: {0}")]
    InternalError(String) = -13,
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String) = -14,
    #[error("TLS handshake failed: {0}")]
    TlsFailed(String) = -15,
    #[error("usbmuxd {operation} failed with code {code}")]
    MuxCommandFailed { code: u64, operation: &'static str } = -16,
    #[error("device not found")]
    DeviceNotFound = -17,
    #[error("response is missing `{0}`")]
    MissingField(&'static str) = -18,
    #[error("not enough bytes, expected {1}, got {0}")]
    NotEnoughBytes(usize, usize) = -19,
    #[error("cannot parse string as IpAddr")]
    AddrParseError(#[from] std::net::AddrParseError) = -20,

    #[cfg(feature = "dtx")]
    #[error("DTX stream out of sync, read magic {0:#x}")]
    DtxOutOfSync(u32) = -21,
    #[cfg(feature = "dtx")]
    #[error("incomplete DTX message: {0}")]
    DtxIncomplete(&'static str) = -22,
    #[cfg(feature = "dtx")]
    #[error("DTX header length must be 32, got {0}")]
    BadHeaderLength(u32) = -23,
    #[cfg(feature = "dtx")]
    #[error("unknown aux value type {0}")]
    UnknownAuxValueType(u32) = -24,
    #[cfg(feature = "dtx")]
    #[error("unknown channel {0}")]
    UnknownChannel(i32) = -25,
    #[cfg(feature = "dtx")]
    #[error("fragment does not belong to message {0}")]
    UnexpectedFragment(u32) = -26,
    #[cfg(feature = "dtx")]
    #[error("lz4 decompression failed")]
    Lz4(#[from] lz4_flex::block::DecompressError) = -27,
    #[cfg(feature = "dtx")]
    #[error("remote error: {0}")]
    RemoteError(String) = -28,
    #[cfg(feature = "dtx")]
    #[error("timed out waiting for response for message {identifier} on channel {channel_code}")]
    Timeout { identifier: u32, channel_code: i32 } = -29,
    #[cfg(feature = "dtx")]
    #[error("connection closed")]
    ConnectionClosed = -30,

    #[cfg(feature = "nskeyedarchive")]
    #[error("keyed archive error: {0}")]
    Archive(#[from] nskeyedarchive::ArchiveError) = -31,

    #[cfg(feature = "device_state")]
    #[error("session error: {0}")]
    Session(#[from] device_state::SessionError) = -32,
    #[cfg(feature = "device_state")]
    #[error("JSON serialization failed")]
    Json(#[from] serde_json::Error) = -33,

    #[cfg(feature = "dvt")]
    #[error("disable memory limit failed")]
    DisableMemoryLimitFailed = -34,

    #[cfg(feature = "dtx")]
    #[error("DTX message of {0} bytes exceeds the maximum")]
    DtxMessageTooLarge(u32) = -35,
}

impl IdeviceError {
    /// Converts a device-reported error string to a typed error
    ///
    /// # Arguments
    /// * `e` - The error string from device
    /// * `context` - Full plist context containing additional error details
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Option<Self> {
        match e {
            "GetProhibited" => Some(Self::GetProhibited),
            "InvalidHostID" => Some(Self::InvalidHostID),
            "SessionInactive" => Some(Self::SessionInactive),
            "PasswordProtected" | "DeviceLocked" => Some(Self::PasswordProtected),
            "InvalidService" => Some(Self::ServiceNotFound),
            "InternalError" => {
                let detailed_error = context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string();
                Some(Self::InternalError(detailed_error))
            }
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            IdeviceError::Socket(_) => -1,
            IdeviceError::PemParseFailed(_) => -2,
            IdeviceError::Rustls(_) => -3,
            IdeviceError::Plist(_) => -4,
            IdeviceError::Utf8(_) => -5,
            IdeviceError::UnexpectedResponse => -6,
            IdeviceError::GetProhibited => -7,
            IdeviceError::SessionInactive => -8,
            IdeviceError::InvalidHostID => -9,
            IdeviceError::NoEstablishedConnection => -10,
            IdeviceError::ServiceNotFound => -11,
            IdeviceError::PasswordProtected => -12,
            IdeviceError::InternalError(_) => -13,
            IdeviceError::UnknownErrorType(_) => -14,
            IdeviceError::TlsFailed(_) => -15,
            IdeviceError::MuxCommandFailed { .. } => -16,
            IdeviceError::DeviceNotFound => -17,
            IdeviceError::MissingField(_) => -18,
            IdeviceError::NotEnoughBytes(_, _) => -19,
            IdeviceError::AddrParseError(_) => -20,

            #[cfg(feature = "dtx")]
            IdeviceError::DtxOutOfSync(_) => -21,
            #[cfg(feature = "dtx")]
            IdeviceError::DtxIncomplete(_) => -22,
            #[cfg(feature = "dtx")]
            IdeviceError::BadHeaderLength(_) => -23,
            #[cfg(feature = "dtx")]
            IdeviceError::UnknownAuxValueType(_) => -24,
            #[cfg(feature = "dtx")]
            IdeviceError::UnknownChannel(_) => -25,
            #[cfg(feature = "dtx")]
            IdeviceError::UnexpectedFragment(_) => -26,
            #[cfg(feature = "dtx")]
            IdeviceError::Lz4(_) => -27,
            #[cfg(feature = "dtx")]
            IdeviceError::RemoteError(_) => -28,
            #[cfg(feature = "dtx")]
            IdeviceError::Timeout { .. } => -29,
            #[cfg(feature = "dtx")]
            IdeviceError::ConnectionClosed => -30,

            #[cfg(feature = "nskeyedarchive")]
            IdeviceError::Archive(_) => -31,

            #[cfg(feature = "device_state")]
            IdeviceError::Session(_) => -32,
            #[cfg(feature = "device_state")]
            IdeviceError::Json(_) => -33,

            #[cfg(feature = "dvt")]
            IdeviceError::DisableMemoryLimitFailed => -34,

            #[cfg(feature = "dtx")]
            IdeviceError::DtxMessageTooLarge(_) => -35,
        }
    }

    /// Whether the non-blocking DTX decoder needs more bytes before it can continue
    #[cfg(feature = "dtx")]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, IdeviceError::DtxIncomplete(_))
    }
}
