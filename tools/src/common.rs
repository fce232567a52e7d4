// Common functions between tools

use ioscontrol::{
    provider::UsbmuxdProvider,
    usbmuxd::{Connection, UsbmuxdAddr, UsbmuxdDevice},
};

pub fn usbmuxd_addr() -> Result<UsbmuxdAddr, String> {
    UsbmuxdAddr::from_env_var().map_err(|e| format!("Bad USBMUXD_SOCKET_ADDRESS: {e}"))
}

/// Picks the device with `udid`, or the first USB device when none is given
pub async fn get_provider(udid: Option<&String>, label: &str) -> Result<UsbmuxdProvider, String> {
    let addr = usbmuxd_addr()?;
    let mut usbmuxd = addr
        .connect(0)
        .await
        .map_err(|e| format!("Unable to connect to usbmuxd: {e}"))?;

    let dev = if let Some(udid) = udid {
        usbmuxd
            .get_device(udid)
            .await
            .map_err(|e| format!("Device not found: {e}"))?
    } else {
        let devs = usbmuxd
            .get_devices()
            .await
            .map_err(|e| format!("Unable to get devices from usbmuxd: {e}"))?;
        let usb_devs: Vec<&UsbmuxdDevice> = devs
            .iter()
            .filter(|x| x.connection_type == Connection::Usb)
            .collect();

        match (usb_devs.first(), devs.first()) {
            (Some(d), _) => (*d).clone(),
            (None, Some(d)) => d.clone(),
            (None, None) => return Err("No devices connected!".to_string()),
        }
    };
    Ok(dev.to_provider(addr, label))
}
