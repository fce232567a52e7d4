//! Services reachable through lockdown

#[cfg(feature = "dvt")]
pub mod dvt;
pub mod lockdown;

use crate::{
    Idevice, IdeviceError, IdeviceService, lockdown::LockdownClient, provider::IdeviceProvider,
};

/// Starts a service and opens its connection
///
/// Connects to lockdown, opens a session with the provider's pair record,
/// asks for the service and connects to the port it was given, upgrading to
/// TLS when the device requires it.
pub async fn start_service(
    provider: &dyn IdeviceProvider,
    name: &str,
) -> Result<Idevice, IdeviceError> {
    let mut lockdown = LockdownClient::connect(provider).await?;
    let pair_record = provider.get_pair_record().await?;
    lockdown.start_session(&pair_record).await?;
    let service = lockdown.start_service(name).await?;
    service.open(provider, &pair_record).await
}
