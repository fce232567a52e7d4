//! Where the manager learns which devices are attached

use std::future::Future;

use tracing::debug;

use crate::{
    IdeviceError, IdeviceService,
    lockdown::LockdownClient,
    usbmuxd::{UsbmuxdAddr, UsbmuxdDevice},
};

/// Name recorded for devices whose `DeviceName` could not be read
pub const NAME_ERROR: &str = "could not load name";

/// Label sent to lockdown when reading device names
const LABEL: &str = "ioscontrol-agent";

/// A source of attached devices
pub trait DeviceSource: Send + Sync {
    /// Every device attached right now
    fn list_devices(
        &self,
    ) -> impl Future<Output = Result<Vec<UsbmuxdDevice>, IdeviceError>> + Send;

    /// The user-visible name of a device
    fn device_name(
        &self,
        device: &UsbmuxdDevice,
    ) -> impl Future<Output = Result<String, IdeviceError>> + Send;
}

impl DeviceSource for UsbmuxdAddr {
    async fn list_devices(&self) -> Result<Vec<UsbmuxdDevice>, IdeviceError> {
        let mut conn = self.connect(0).await?;
        conn.get_devices().await
    }

    async fn device_name(&self, device: &UsbmuxdDevice) -> Result<String, IdeviceError> {
        let provider = device.to_provider(self.clone(), LABEL);
        let mut lockdown = LockdownClient::connect(&provider).await?;
        let name = lockdown.get_value(Some("DeviceName"), None).await?;
        debug!("{} is named {name:?}", device.udid);
        name.into_string().ok_or(IdeviceError::UnexpectedResponse)
    }
}
