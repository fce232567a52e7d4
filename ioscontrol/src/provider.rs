//! Sources of device connections
//!
//! A provider knows how to reach one device: it opens tunnels to device ports
//! and hands out the pair record needed to secure them.

use std::{future::Future, pin::Pin};

use crate::{Idevice, IdeviceError, pair_record::PairRecord};

#[cfg(feature = "usbmuxd")]
use crate::usbmuxd::UsbmuxdAddr;

/// A provider for connecting to the iOS device
/// This is an ugly trait until async traits are dyn compatible
pub trait IdeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Idevice, IdeviceError>> + Send>>;

    fn label(&self) -> &str;

    fn get_pair_record(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PairRecord, IdeviceError>> + Send>>;
}

/// Reaches a device through the local usbmuxd
#[cfg(feature = "usbmuxd")]
#[derive(Debug)]
pub struct UsbmuxdProvider {
    pub addr: UsbmuxdAddr,
    pub tag: u32,
    pub udid: String,
    pub device_id: u32,
    pub label: String,
}

#[cfg(feature = "usbmuxd")]
impl IdeviceProvider for UsbmuxdProvider {
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Idevice, IdeviceError>> + Send>> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let device_id = self.device_id;
        let label = self.label.clone();

        Box::pin(async move {
            let usbmuxd = addr.connect(tag).await?;
            usbmuxd.connect_to_device(device_id, port, label).await
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn get_pair_record(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PairRecord, IdeviceError>> + Send>> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let udid = self.udid.clone();

        Box::pin(async move {
            let mut usbmuxd = addr.connect(tag).await?;
            usbmuxd.get_pair_record(&udid).await
        })
    }
}
