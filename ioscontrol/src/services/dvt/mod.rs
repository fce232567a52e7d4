//! Instruments remote server
//!
//! The remote server speaks DTX. Every client in this module is a thin
//! translation from a domain call into a selector on its own channel.

use std::sync::Arc;

use tracing::debug;

use crate::{
    IdeviceError, IdeviceService,
    dtx::{Channel, Dispatcher, DtxConnection, LoggingDispatcher},
    provider::IdeviceProvider,
    services::start_service,
};

pub mod device_info;
pub mod notifications;
pub mod process_control;
pub mod screenshot;

/// Lockdown names of the remote server, newest first
pub const SERVICE_NAMES: [&str; 2] = [
    "com.apple.instruments.remoteserver.DVTSecureSocketProxy",
    "com.apple.instruments.remoteserver",
];

/// A DTX connection to the instruments remote server
#[derive(Debug)]
pub struct InstrumentsConnection {
    connection: DtxConnection,
}

impl IdeviceService for InstrumentsConnection {
    fn service_name() -> &'static str {
        SERVICE_NAMES[0]
    }

    /// Tries every name in [`SERVICE_NAMES`] and keeps the first that starts
    async fn connect(provider: &dyn IdeviceProvider) -> Result<Self, IdeviceError> {
        let mut last = IdeviceError::ServiceNotFound;
        for name in SERVICE_NAMES {
            match start_service(provider, name).await {
                Ok(service) => {
                    debug!("Connected to {name}");
                    return Ok(Self::new(DtxConnection::new(service)?));
                }
                Err(e) => {
                    debug!("Failed connecting to {name}: {e}");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

impl InstrumentsConnection {
    pub fn new(connection: DtxConnection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &DtxConnection {
        &self.connection
    }

    /// Opens a channel whose unclaimed messages are only logged
    pub async fn channel(&self, identifier: &str) -> Result<Channel, IdeviceError> {
        self.channel_with(identifier, Arc::new(LoggingDispatcher))
            .await
    }

    pub async fn channel_with(
        &self,
        identifier: &str,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Channel, IdeviceError> {
        self.connection.request_channel(identifier, dispatcher).await
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}
