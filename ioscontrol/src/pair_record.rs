//! Pair records
//!
//! A pair record is the credential bundle the device issued to this host when
//! it was trusted. usbmuxd hands it out by device serial, and it can also be
//! loaded from disk (`/var/lib/lockdown/<udid>.plist` on Linux).

use std::path::Path;

use base64::{Engine, engine::general_purpose::STANDARD};
use plist::Data;
use rustls::pki_types::{CertificateDer, pem::PemObject};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::IdeviceError;

/// The parts of a pair record needed to talk to a device
#[derive(Clone, Debug)]
pub struct PairRecord {
    /// Device's certificate
    pub device_certificate: CertificateDer<'static>,
    /// Host's private key, PEM encoded
    pub host_private_key: Vec<u8>,
    /// Host's certificate
    pub host_certificate: CertificateDer<'static>,
    pub root_certificate: Option<CertificateDer<'static>>,
    pub root_private_key: Option<Vec<u8>>,
    /// System Build Unique Identifier
    pub system_buid: String,
    /// Host identifier sent in `StartSession`
    pub host_id: String,
    pub escrow_bag: Option<Vec<u8>>,
    pub wifi_mac_address: Option<String>,
    pub udid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairRecord {
    device_certificate: Data,
    host_private_key: Data,
    host_certificate: Data,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    root_certificate: Option<Data>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    root_private_key: Option<Data>,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    escrow_bag: Option<Data>,
    #[serde(
        rename = "WiFiMACAddress",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    wifi_mac_address: Option<String>,
    #[serde(rename = "UDID", default, skip_serializing_if = "Option::is_none")]
    udid: Option<String>,
}

impl PairRecord {
    /// Reads a pair record from disk
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, IdeviceError> {
        let f = std::fs::read(path)?;
        Self::from_bytes(&f)
    }

    /// Parses a pair record from XML or binary plist bytes
    ///
    /// # Errors
    /// Returns `IdeviceError::UnexpectedResponse` if required fields are
    /// missing or the certificates are not valid PEM
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdeviceError> {
        let r = match plist::from_bytes::<RawPairRecord>(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("Unable to parse pair record: {e:?}");
                return Err(IdeviceError::UnexpectedResponse);
            }
        };

        r.try_into().map_err(|e| {
            warn!("Pair record has invalid certificates: {e:?}");
            IdeviceError::UnexpectedResponse
        })
    }

    /// Serializes the pair record as an XML plist
    pub fn serialize(self) -> Result<Vec<u8>, IdeviceError> {
        let raw = RawPairRecord::from(self);
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }
}

impl TryFrom<RawPairRecord> for PairRecord {
    type Error = rustls::pki_types::pem::Error;

    fn try_from(value: RawPairRecord) -> Result<Self, Self::Error> {
        let root_certificate = match value.root_certificate {
            Some(c) => Some(CertificateDer::from_pem_slice(c.as_ref())?),
            None => None,
        };
        Ok(Self {
            device_certificate: CertificateDer::from_pem_slice(value.device_certificate.as_ref())?,
            host_private_key: value.host_private_key.into(),
            host_certificate: CertificateDer::from_pem_slice(value.host_certificate.as_ref())?,
            root_certificate,
            root_private_key: value.root_private_key.map(Into::into),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Into::into),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        })
    }
}

fn pem(label: &str, der: &[u8]) -> Vec<u8> {
    let encoded = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n").into_bytes();
    for line in encoded.as_bytes().chunks(64) {
        out.extend_from_slice(line);
        out.push(b'\n');
    }
    out.extend_from_slice(format!("-----END {label}-----\n").as_bytes());
    out
}

impl From<PairRecord> for RawPairRecord {
    fn from(value: PairRecord) -> Self {
        Self {
            device_certificate: Data::new(pem("CERTIFICATE", &value.device_certificate)),
            host_private_key: Data::new(value.host_private_key),
            host_certificate: Data::new(pem("CERTIFICATE", &value.host_certificate)),
            root_certificate: value
                .root_certificate
                .map(|c| Data::new(pem("CERTIFICATE", &c))),
            root_private_key: value.root_private_key.map(Data::new),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Data::new),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        }
    }
}
