//! Application state and memory notifications
//!
//! Once enabled the device pushes `applicationStateNotification:` and
//! `memoryNotification:` invocations on the paired channel, each carrying a
//! dictionary in its first argument.

use futures::Stream;
use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use crate::{IdeviceError, dtx::Channel, dtx::DtxMessage, nskeyedarchive::ArchiveValue};

use super::InstrumentsConnection;

pub const CHANNEL_IDENTIFIER: &str = "com.apple.instruments.server.services.mobilenotifications";
pub const APPLICATION_STATE_SELECTOR: &str = "applicationStateNotification:";
pub const MEMORY_SELECTOR: &str = "memoryNotification:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationKind {
    ApplicationState,
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub data: IndexMap<String, ArchiveValue>,
}

#[derive(Debug, Clone)]
pub struct NotificationsClient {
    channel: Channel,
}

impl NotificationsClient {
    /// Opens the notifications channel and starts listening for both kinds
    ///
    /// Nothing arrives until [`Self::enable`] is called.
    pub async fn new(conn: &InstrumentsConnection) -> Result<Self, IdeviceError> {
        let channel = conn.channel(CHANNEL_IDENTIFIER).await?;
        channel.register_for_remote(APPLICATION_STATE_SELECTOR);
        channel.register_for_remote(MEMORY_SELECTOR);
        Ok(Self { channel })
    }

    /// Turns on application state and memory notifications
    pub async fn enable(&self) -> Result<(), IdeviceError> {
        self.set_application_state_notifications(true).await?;
        self.set_memory_notifications(true).await
    }

    pub async fn disable(&self) -> Result<(), IdeviceError> {
        self.set_application_state_notifications(false).await?;
        self.set_memory_notifications(false).await
    }

    pub async fn set_application_state_notifications(
        &self,
        enabled: bool,
    ) -> Result<(), IdeviceError> {
        let res = self
            .channel
            .invoke(
                "setApplicationStateNotificationsEnabled:",
                &[ArchiveValue::from(enabled)],
            )
            .await?;
        debug!("Application state notifications enabled={enabled}: {res}");
        Ok(())
    }

    pub async fn set_memory_notifications(&self, enabled: bool) -> Result<(), IdeviceError> {
        let res = self
            .channel
            .invoke("setMemoryNotificationsEnabled:", &[ArchiveValue::from(enabled)])
            .await?;
        debug!("Memory notifications enabled={enabled}: {res}");
        Ok(())
    }

    /// Waits for the next notification of either kind
    ///
    /// Invocations whose argument is not a dictionary are logged and skipped.
    pub async fn next_notification(&self) -> Result<Notification, IdeviceError> {
        loop {
            let (kind, msg) = tokio::select! {
                m = self.channel.receive(APPLICATION_STATE_SELECTOR) => (NotificationKind::ApplicationState, m?),
                m = self.channel.receive(MEMORY_SELECTOR) => (NotificationKind::Memory, m?),
            };
            match payload(&msg) {
                Some(data) => return Ok(Notification { kind, data }),
                None => debug!("Error extracting notification from {msg}"),
            }
        }
    }

    /// Every notification until the connection closes
    pub fn notifications(&self) -> impl Stream<Item = Result<Notification, IdeviceError>> + '_ {
        async_stream::try_stream! {
            loop {
                yield self.next_notification().await?;
            }
        }
    }
}

fn payload(msg: &DtxMessage) -> Option<IndexMap<String, ArchiveValue>> {
    msg.aux
        .get(0)?
        .unarchive()?
        .ok()?
        .into_iter()
        .next()?
        .into_dictionary()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtx::PrimitiveDictionary;
    use crate::services::dvt::fake;
    use futures::StreamExt;

    fn state(bundle: &str, state: u64) -> PrimitiveDictionary {
        let mut d = IndexMap::new();
        d.insert("mach_absolute_time".to_string(), ArchiveValue::from(1u64));
        d.insert("appName".to_string(), ArchiveValue::from(bundle));
        d.insert("state_description".to_string(), ArchiveValue::from("Foreground Running"));
        d.insert("state".to_string(), ArchiveValue::from(state));
        let mut aux = PrimitiveDictionary::new();
        aux.push_archived(&ArchiveValue::Dictionary(d)).unwrap();
        aux
    }

    #[tokio::test]
    async fn enable_sends_both_switches() {
        let (conn, mut device) = fake::instruments(Box::new(|_| Some(ArchiveValue::Null)));
        let client = NotificationsClient::new(&conn).await.unwrap();
        client.enable().await.unwrap();

        let first = device.next_call().await;
        assert_eq!(
            first.selector(),
            Some("setApplicationStateNotificationsEnabled:")
        );
        assert_eq!(
            first.aux.get(0).and_then(|a| a.unarchive()).unwrap().unwrap(),
            vec![ArchiveValue::Boolean(true)]
        );
        let second = device.next_call().await;
        assert_eq!(second.selector(), Some("setMemoryNotificationsEnabled:"));
    }

    #[tokio::test]
    async fn pushed_notifications() {
        let (conn, device) = fake::instruments(Box::new(|_| None));
        let client = NotificationsClient::new(&conn).await.unwrap();

        // the device pushes on the negated channel code
        device
            .push(-1, APPLICATION_STATE_SELECTOR, &PrimitiveDictionary::new())
            .await;
        device
            .push(-1, APPLICATION_STATE_SELECTOR, &state("com.apple.mobilesafari", 8))
            .await;
        let n = client.next_notification().await.unwrap();
        assert_eq!(n.kind, NotificationKind::ApplicationState);
        assert_eq!(
            n.data.get("appName"),
            Some(&ArchiveValue::from("com.apple.mobilesafari"))
        );

        device.push(-1, MEMORY_SELECTOR, &state("kernel", 1)).await;
        let mut stream = std::pin::pin!(client.notifications());
        let n = stream.next().await.unwrap().unwrap();
        assert_eq!(n.kind, NotificationKind::Memory);
    }

    #[tokio::test]
    async fn closing_ends_the_stream() {
        let (conn, _device) = fake::instruments(Box::new(|_| None));
        let client = NotificationsClient::new(&conn).await.unwrap();
        conn.close().await;
        let mut stream = std::pin::pin!(client.notifications());
        assert!(matches!(
            stream.next().await,
            Some(Err(IdeviceError::ConnectionClosed))
        ));
    }
}
