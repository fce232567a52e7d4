//! A DTX connection and its reader task
//!
//! One task per connection reads frames off the transport, reassembles
//! fragments, acknowledges messages that ask for it and hands each message to
//! the channel its code belongs to. Messages for unknown codes land on the
//! global channel (code 0).

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use indexmap::IndexMap;
use tokio::{
    io::ReadHalf,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    Idevice, IdeviceError, ReadWrite,
    dtx::{
        channel::{Channel, Dispatcher, Writer},
        fragment::Reassembler,
        message::{self, DtxFrame, DtxMessage, MessageKind},
        primitive_dictionary::{AuxValue, PrimitiveDictionary},
    },
    nskeyedarchive::ArchiveValue,
};

pub const REQUEST_CHANNEL_SELECTOR: &str = "_requestChannelWithCode:identifier:";
pub const PUBLISH_CAPABILITIES_SELECTOR: &str = "_notifyOfPublishedCapabilities:";
const OUTPUT_RECEIVED_SELECTOR: &str = "outputReceived:fromProcess:atTime:";

/// Identifiers below this are used by the peer during the handshake
const GLOBAL_FIRST_IDENTIFIER: u32 = 5;
/// Code of the catch-all channel the peer pushes on without a request
const DEFAULT_RECEIVER_CODE: i32 = -1;
const CHANNEL_REQUEST_BACKLOG: usize = 5;

struct ChannelTable {
    active: HashMap<i32, Channel>,
    next_code: i32,
}

/// Dispatcher of the global channel
///
/// Queues device-initiated channel requests for
/// [`DtxConnection::for_channel_request`], logs device output and forwards
/// untyped messages to an optional application dispatcher.
struct GlobalDispatcher {
    requests: Mutex<Option<mpsc::Sender<DtxMessage>>>,
    forward: Mutex<Option<Arc<dyn Dispatcher>>>,
}

impl GlobalDispatcher {
    fn close(&self) {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

impl Dispatcher for GlobalDispatcher {
    fn dispatch(&self, message: DtxMessage) {
        match message.selector() {
            Some(REQUEST_CHANNEL_SELECTOR) => {
                let requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
                match requests.as_ref().map(|tx| tx.try_send(message)) {
                    Some(Ok(())) => {}
                    Some(Err(e)) => warn!("Dropping channel request: {e}"),
                    None => debug!("Connection closed, ignoring channel request"),
                }
                return;
            }
            Some(OUTPUT_RECEIVED_SELECTOR) => {
                let output = message
                    .aux
                    .get(0)
                    .and_then(|a| a.unarchive())
                    .and_then(|r| r.ok())
                    .and_then(|v| v.into_iter().next());
                info!(
                    msg = %output.map(|o| o.to_string()).unwrap_or_default(),
                    pid = ?message.aux.get(1),
                    time = ?message.aux.get(2),
                    "outputReceived:fromProcess:atTime:"
                );
                return;
            }
            Some(PUBLISH_CAPABILITIES_SELECTOR) => {
                debug!("Peer published capabilities: {message}");
                return;
            }
            _ => {}
        }

        if message.is_error() {
            error!("Error on global channel: {}", message.error_text());
        }
        if message.kind() == MessageKind::UnknownTypeOne {
            let forward = self
                .forward
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            match forward {
                Some(d) => d.dispatch(message),
                None => warn!("No dispatcher registered for global channel message: {message}"),
            }
            return;
        }
        debug!("Global channel received: {message}");
    }
}

struct ConnectionInner {
    writer: Arc<Writer>,
    table: Mutex<ChannelTable>,
    global: Channel,
    global_dispatcher: Arc<GlobalDispatcher>,
    channel_requests: tokio::sync::Mutex<mpsc::Receiver<DtxMessage>>,
    closed: AtomicBool,
}

impl ConnectionInner {
    fn table(&self) -> MutexGuard<'_, ChannelTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The channel an inbound code belongs to
    ///
    /// A peer answering a channel we requested with code N may push on -N.
    /// The first time that happens the pairing is recorded.
    fn route(&self, code: i32) -> Channel {
        let mut table = self.table();
        if let Some(c) = table.active.get(&code) {
            return c.clone();
        }
        if code < 0
            && let Some(c) = table.active.get(&-code).cloned()
        {
            c.set_remote_code(code);
            table.active.insert(code, c.clone());
            return c;
        }
        self.global.clone()
    }

    /// Closes every channel, `cause` is the error that ended the reader
    fn shut(&self, cause: Option<&IdeviceError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.global_dispatcher.close();
        self.global.close(cause);
        let channels: Vec<Channel> = self.table().active.drain().map(|(_, c)| c).collect();
        for c in channels {
            c.close(cause);
        }
    }
}

/// A live DTX connection
///
/// Dropping it stops the reader task, [`Channel`] handles then fail with
/// [`IdeviceError::ConnectionClosed`].
pub struct DtxConnection {
    inner: Arc<ConnectionInner>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for DtxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtxConnection")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DtxConnection {
    /// Takes over the stream of an established service connection and starts
    /// reading from it
    ///
    /// Any TLS upgrade must already have happened. Must be called from within
    /// a tokio runtime.
    pub fn new(idevice: Idevice) -> Result<Self, IdeviceError> {
        let socket = idevice
            .into_inner()
            .ok_or(IdeviceError::NoEstablishedConnection)?;
        Ok(Self::from_stream(socket))
    }

    pub fn from_stream(socket: Box<dyn ReadWrite>) -> Self {
        let (read, write) = tokio::io::split(socket);
        let writer = Arc::new(Writer::new(write));
        let (tx, rx) = mpsc::channel(CHANNEL_REQUEST_BACKLOG);
        let global_dispatcher = Arc::new(GlobalDispatcher {
            requests: Mutex::new(Some(tx)),
            forward: Mutex::new(None),
        });
        let global = Channel::new(
            0,
            "global_channel",
            GLOBAL_FIRST_IDENTIFIER,
            writer.clone(),
            global_dispatcher.clone(),
        );
        let inner = Arc::new(ConnectionInner {
            writer,
            table: Mutex::new(ChannelTable {
                active: HashMap::new(),
                next_code: 1,
            }),
            global,
            global_dispatcher,
            channel_requests: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(read, inner.clone()));
        Self { inner, reader }
    }

    /// The always present channel 0
    pub fn global_channel(&self) -> &Channel {
        &self.inner.global
    }

    /// Receives untyped messages arriving on the global channel
    pub fn set_message_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        *self
            .inner
            .global_dispatcher
            .forward
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(dispatcher);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Opens a channel to the named service
    ///
    /// # Arguments
    /// * `identifier` - Service identifier such as
    ///   `com.apple.instruments.server.services.deviceinfo`
    /// * `dispatcher` - Receives messages nothing else claims
    ///
    /// # Errors
    /// Fails if the global channel call fails or times out
    pub async fn request_channel(
        &self,
        identifier: &str,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Channel, IdeviceError> {
        let code = {
            let mut table = self.inner.table();
            table.next_code += 1;
            table.next_code - 1
        };
        let mut aux = PrimitiveDictionary::new();
        aux.push(code as u32);
        aux.push_archived(&identifier.into())?;

        // registered first so nothing the peer sends right after the reply is lost
        let channel = Channel::new(code, identifier, 1, self.inner.writer.clone(), dispatcher);
        self.inner.table().active.insert(code, channel.clone());
        debug!(channel_id = identifier, "Requesting channel");

        if let Err(e) = self
            .inner
            .global
            .invoke_with_aux(REQUEST_CHANNEL_SELECTOR, aux)
            .await
        {
            error!(channel_id = identifier, "Failed requesting channel: {e}");
            self.inner.table().active.remove(&channel.code());
            return Err(e);
        }
        debug!(channel_id = identifier, code = channel.code(), "Channel open");
        Ok(channel)
    }

    /// Waits for the peer to request a channel and returns it
    ///
    /// For a request with code N the channel sends on -N, which is where the
    /// peer pushes its traffic. Only -N is claimed, so a channel the host
    /// requested with the same N keeps receiving its replies.
    pub async fn for_channel_request(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Channel, IdeviceError> {
        let request = self
            .inner
            .channel_requests
            .lock()
            .await
            .recv()
            .await
            .ok_or(IdeviceError::ConnectionClosed)?;

        let code = match request.aux.get(0) {
            Some(AuxValue::U32(c)) => *c as i32,
            Some(AuxValue::I64(c)) => *c as i32,
            _ => return Err(IdeviceError::MissingField("channel code")),
        };
        let name = match request.aux.get(1).and_then(|a| a.unarchive()) {
            Some(values) => values?
                .into_iter()
                .next()
                .and_then(|v| v.as_string().map(str::to_string)),
            None => None,
        }
        .ok_or(IdeviceError::MissingField("channel identifier"))?;

        let local = -code.abs();
        let channel = Channel::new(local, name, 1, self.inner.writer.clone(), dispatcher);
        channel.set_remote_code(code);
        if let Some(old) = self.inner.table().active.insert(local, channel.clone()) {
            warn!(
                channel_id = channel.name(),
                "Peer channel {local} replaces {}",
                old.name()
            );
        }
        debug!(channel_id = channel.name(), code, "Peer opened channel");
        Ok(channel)
    }

    /// Claims the catch-all channel -1 the peer may push on unrequested
    pub fn add_default_channel_receiver(&self, dispatcher: Arc<dyn Dispatcher>) -> Channel {
        let channel = Channel::new(
            DEFAULT_RECEIVER_CODE,
            "default receiver channel",
            1,
            self.inner.writer.clone(),
            dispatcher,
        );
        self.inner
            .table()
            .active
            .insert(DEFAULT_RECEIVER_CODE, channel.clone());
        channel
    }

    /// Announces the host's capabilities on the global channel
    pub async fn publish_capabilities(&self) -> Result<(), IdeviceError> {
        let mut caps = IndexMap::new();
        caps.insert(
            "com.apple.private.DTXBlockCompression".to_string(),
            ArchiveValue::from(2u64),
        );
        caps.insert(
            "com.apple.private.DTXConnection".to_string(),
            ArchiveValue::from(1u64),
        );
        self.inner
            .global
            .invoke_async(PUBLISH_CAPABILITIES_SELECTOR, &[ArchiveValue::Dictionary(caps)])
            .await
    }

    /// Fails every waiting call, ends every queue and closes the transport
    pub async fn close(&self) {
        self.reader.abort();
        self.inner.shut(None);
        self.inner.writer.shutdown().await;
    }
}

impl Drop for DtxConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.inner.shut(None);
    }
}

async fn read_loop(mut reader: ReadHalf<Box<dyn ReadWrite>>, inner: Arc<ConnectionInner>) {
    let mut fragments = Reassembler::new();
    let cause = loop {
        let message = match message::read_frame(&mut reader).await {
            Ok(DtxFrame::Message(m)) => m,
            Ok(DtxFrame::Fragment { header, bytes }) => {
                let raw = match fragments.accept(header, bytes) {
                    Ok(Some(raw)) => raw,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Dropping fragment of {}: {e}", header.identifier);
                        continue;
                    }
                };
                match DtxMessage::from_bytes(&raw) {
                    Ok(m) => m,
                    Err(e) => {
                        error!("Decoding reassembled message failed: {e}");
                        continue;
                    }
                }
            }
            Err(IdeviceError::Socket(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("DTX connection closed by peer");
                break None;
            }
            Err(e) => {
                error!("Error reading DTX connection: {e}");
                break Some(e);
            }
        };

        if message.header.expects_reply
            && message.kind() != MessageKind::UnknownTypeOne
            && message.header.conversation_index == 0
            && let Err(e) = inner.writer.send(&message::encode_ack(&message.header)).await
        {
            error!("Error sending ack: {e}");
        }

        inner.route(message.header.channel_code).dispatch(message);
    };
    inner.shut(cause.as_ref());
}
