//! DTX, the message protocol of the instruments and testmanager services
//!
//! [`message`] holds the wire format, [`connection`] and [`channel`] the
//! runtime that multiplexes calls over a single transport.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ioscontrol::{
//!     IdeviceError,
//!     dtx::{DtxConnection, LoggingDispatcher},
//!     provider::IdeviceProvider,
//!     services::start_service,
//! };
//!
//! async fn processes(provider: &dyn IdeviceProvider) -> Result<(), IdeviceError> {
//!     let service = start_service(provider, "com.apple.instruments.remoteserver").await?;
//!     let conn = DtxConnection::new(service)?;
//!     let channel = conn
//!         .request_channel(
//!             "com.apple.instruments.server.services.deviceinfo",
//!             Arc::new(LoggingDispatcher),
//!         )
//!         .await?;
//!     let reply = channel.invoke("runningProcesses", &[]).await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod connection;
pub mod fragment;
pub mod lz4;
pub mod message;
pub mod primitive_dictionary;

pub use channel::{Channel, Dispatcher, LoggingDispatcher};
pub use connection::DtxConnection;
pub use fragment::{FragmentDecoder, Reassembler};
pub use message::{DtxFrame, DtxMessage, MessageHeader, MessageKind, PayloadHeader};
pub use primitive_dictionary::{AuxValue, PrimitiveDictionary};
