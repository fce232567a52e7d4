use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    IdeviceError,
    usbmuxd::{Connection, UsbmuxdDevice},
};

#[derive(Deserialize)]
pub struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceListResponse>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceListResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DevicePropertiesResponse,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DevicePropertiesResponse {
    pub connection_type: String,
    pub network_address: Option<plist::Data>,
    pub serial_number: String,
    #[serde(rename = "ProductID")]
    pub product_id: Option<u32>,
    #[serde(rename = "LocationID")]
    pub location_id: Option<u32>,
    pub connection_speed: Option<u32>,
}

impl DeviceListResponse {
    pub fn into_usbmuxd_dev(self) -> Result<UsbmuxdDevice, IdeviceError> {
        self.try_into()
    }
}

fn ipv6_at(addr: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&addr[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

/// Decodes the sockaddr blob usbmuxd reports for network devices
fn parse_network_address(addr: &[u8]) -> Result<Connection, IdeviceError> {
    if addr.len() < 8 {
        warn!("Device address bytes len < 8");
        return Err(IdeviceError::UnexpectedResponse);
    }

    // Linux reports the family in byte 0, BSD style sockaddrs put the
    // length there and the family in byte 1
    Ok(match (addr[0], addr[1]) {
        (0x02, _) | (0x10, 0x02) => {
            Connection::Network(IpAddr::V4(Ipv4Addr::new(addr[4], addr[5], addr[6], addr[7])))
        }
        (0x0A, _) | (0x1E, _) | (0x1C, 0x1E) => {
            if addr.len() < 24 {
                warn!("IPv6 sockaddr too short (len {})", addr.len());
                return Err(IdeviceError::UnexpectedResponse);
            }
            Connection::Network(IpAddr::V6(ipv6_at(addr, 8)))
        }
        (family, _) => {
            warn!("Unknown IP address protocol: {family:02X}");
            Connection::Unknown(format!("Network {family:02X}"))
        }
    })
}

impl TryFrom<DeviceListResponse> for UsbmuxdDevice {
    type Error = IdeviceError;

    fn try_from(dev: DeviceListResponse) -> Result<Self, Self::Error> {
        let connection_type = match dev.properties.connection_type.as_str() {
            "Network" => match dev.properties.network_address {
                Some(addr) => parse_network_address(addr.as_ref())?,
                None => {
                    warn!("Device is network attached, but has no network info");
                    return Err(IdeviceError::UnexpectedResponse);
                }
            },
            "USB" => Connection::Usb,
            _ => Connection::Unknown(dev.properties.connection_type),
        };
        debug!("Connection type: {connection_type:?}");
        Ok(UsbmuxdDevice {
            connection_type,
            udid: dev.properties.serial_number,
            device_id: dev.device_id,
            product_id: dev.properties.product_id,
            location_id: dev.properties.location_id,
            connection_speed: dev.properties.connection_speed,
        })
    }
}
