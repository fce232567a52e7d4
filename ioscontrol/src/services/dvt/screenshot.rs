//! Screenshot service client for the instruments protocol.

use crate::{IdeviceError, dtx::Channel, nskeyedarchive::ArchiveValue};

use super::InstrumentsConnection;

pub const CHANNEL_IDENTIFIER: &str = "com.apple.instruments.server.services.screenshot";

/// Client for taking screenshots
#[derive(Debug, Clone)]
pub struct ScreenshotClient {
    channel: Channel,
}

impl ScreenshotClient {
    /// Opens the screenshot channel
    ///
    /// # Errors
    /// Propagates errors from channel creation
    pub async fn new(conn: &InstrumentsConnection) -> Result<Self, IdeviceError> {
        Ok(Self {
            channel: conn.channel(CHANNEL_IDENTIFIER).await?,
        })
    }

    /// Takes a screenshot
    ///
    /// # Returns
    /// The PNG encoded image
    ///
    /// # Errors
    /// * `IdeviceError::UnexpectedResponse` if the reply holds no data
    pub async fn take_screenshot(&self) -> Result<Vec<u8>, IdeviceError> {
        let msg = self.channel.invoke("takeScreenshot", &[]).await?;
        match msg.payload.into_iter().next() {
            Some(ArchiveValue::Data(data)) => Ok(data),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }
}
