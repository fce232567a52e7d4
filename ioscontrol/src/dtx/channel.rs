//! Logical channels multiplexed over one DTX connection
//!
//! A channel owns its outgoing message identifiers and the table of calls
//! waiting for a reply. Inbound messages are handed to it by the connection's
//! reader task through [`Channel::dispatch`], which routes each one to a
//! registered selector queue, a waiting caller or the channel's [`Dispatcher`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    io::{AsyncWriteExt, WriteHalf},
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

use crate::{
    IdeviceError, ReadWrite,
    dtx::{
        message::{self, DtxMessage, MessageKind},
        primitive_dictionary::PrimitiveDictionary,
    },
    nskeyedarchive::{self, ArchiveError, ArchiveValue},
};

/// How long a call waits for its reply unless the channel says otherwise
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives the messages a channel has no other destination for
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, message: DtxMessage);
}

/// Logs and drops everything
#[derive(Debug, Default)]
pub struct LoggingDispatcher;

impl Dispatcher for LoggingDispatcher {
    fn dispatch(&self, message: DtxMessage) {
        debug!("Unhandled DTX message: {message}");
    }
}

/// Write side of the transport, shared by every channel of a connection
pub(crate) struct Writer {
    inner: tokio::sync::Mutex<Option<WriteHalf<Box<dyn ReadWrite>>>>,
}

impl Writer {
    pub(crate) fn new(half: WriteHalf<Box<dyn ReadWrite>>) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(Some(half)),
        }
    }

    pub(crate) async fn send(&self, bytes: &[u8]) -> Result<(), IdeviceError> {
        let mut guard = self.inner.lock().await;
        let half = guard.as_mut().ok_or(IdeviceError::ConnectionClosed)?;
        half.write_all(bytes).await?;
        half.flush().await?;
        Ok(())
    }

    pub(crate) async fn shutdown(&self) {
        if let Some(mut half) = self.inner.lock().await.take()
            && let Err(e) = half.shutdown().await
        {
            debug!("Error shutting down DTX transport: {e:?}");
        }
    }
}

type ReplySlot = oneshot::Sender<Result<DtxMessage, IdeviceError>>;

struct SelectorQueue {
    tx: mpsc::UnboundedSender<DtxMessage>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<DtxMessage>>>,
}

struct ChannelState {
    next_identifier: u32,
    /// Code the peer uses when it pushes on this channel, if it differs
    remote_code: Option<i32>,
    timeout: Duration,
    pending: HashMap<u32, ReplySlot>,
    selectors: HashMap<String, SelectorQueue>,
    closed: bool,
}

struct ChannelInner {
    code: i32,
    name: String,
    writer: Arc<Writer>,
    state: Mutex<ChannelState>,
    /// Held from identifier assignment until the frame is written
    send_gate: tokio::sync::Mutex<()>,
    dispatcher: Arc<dyn Dispatcher>,
}

/// Handle to one channel, cheap to clone
///
/// Calls made by the host are always written with [`Channel::code`]. Only
/// [`Channel::reply`] answers on the code the peer used, which may be the
/// negated code recorded in [`Channel::remote_code`].
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("code", &self.inner.code)
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Removes the reply slot when the waiting call ends for any reason
struct PendingSlot<'a> {
    inner: &'a ChannelInner,
    identifier: u32,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(&self.inner.state).pending.remove(&self.identifier);
    }
}

fn lock(state: &Mutex<ChannelState>) -> MutexGuard<'_, ChannelState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl Channel {
    pub(crate) fn new(
        code: i32,
        name: impl Into<String>,
        first_identifier: u32,
        writer: Arc<Writer>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                code,
                name: name.into(),
                writer,
                state: Mutex::new(ChannelState {
                    next_identifier: first_identifier,
                    remote_code: None,
                    timeout: DEFAULT_TIMEOUT,
                    pending: HashMap::new(),
                    selectors: HashMap::new(),
                    closed: false,
                }),
                send_gate: tokio::sync::Mutex::new(()),
                dispatcher,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        lock(&self.inner.state)
    }

    /// The code written into outgoing frames
    pub fn code(&self) -> i32 {
        self.inner.code
    }

    /// The code the peer pushes messages with, when it is not [`Self::code`]
    pub fn remote_code(&self) -> Option<i32> {
        self.state().remote_code
    }

    pub(crate) fn set_remote_code(&self, code: i32) {
        let mut state = self.state();
        if state.remote_code != Some(code) {
            debug!("Channel {} paired with peer code {code}", self.inner.code);
            state.remote_code = Some(code);
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Changes how long calls on this channel wait for a reply
    ///
    /// Some long running selectors need more than the default.
    pub fn set_timeout(&self, timeout: Duration) {
        self.state().timeout = timeout;
    }

    /// Calls `selector` with `args` and waits for the reply
    ///
    /// The selector is archived into the payload and every argument is
    /// archived into its own auxiliary entry.
    ///
    /// # Errors
    /// * [`IdeviceError::RemoteError`] if the peer answered with an error
    /// * [`IdeviceError::Timeout`] if no reply came in time
    /// * [`IdeviceError::ConnectionClosed`] if the connection went away first
    pub async fn invoke(
        &self,
        selector: &str,
        args: &[ArchiveValue],
    ) -> Result<DtxMessage, IdeviceError> {
        self.invoke_with_aux(selector, archived_args(args)?).await
    }

    /// Like [`Self::invoke`] with a prebuilt auxiliary dictionary, for
    /// arguments that are not archives such as a raw pid
    pub async fn invoke_with_aux(
        &self,
        selector: &str,
        aux: PrimitiveDictionary,
    ) -> Result<DtxMessage, IdeviceError> {
        let payload = nskeyedarchive::archive(&ArchiveValue::from(selector))?;
        let reply = self
            .send_and_await(MessageKind::MethodInvocation, &payload, &aux)
            .await?;
        if reply.is_error() {
            warn!(
                "Invoking {selector} on {} failed: {}",
                self.inner.name,
                reply.error_text()
            );
            return Err(IdeviceError::RemoteError(reply.error_text()));
        }
        if let Some(e) = &reply.payload_error {
            return Err(ArchiveError::Malformed(e.clone()).into());
        }
        Ok(reply)
    }

    /// Calls `selector` without asking for a reply
    pub async fn invoke_async(
        &self,
        selector: &str,
        args: &[ArchiveValue],
    ) -> Result<(), IdeviceError> {
        self.invoke_async_with_aux(selector, archived_args(args)?)
            .await
    }

    pub async fn invoke_async_with_aux(
        &self,
        selector: &str,
        aux: PrimitiveDictionary,
    ) -> Result<(), IdeviceError> {
        let payload = nskeyedarchive::archive(&ArchiveValue::from(selector))?;
        let _gate = self.inner.send_gate.lock().await;
        let identifier = {
            let mut state = self.state();
            if state.closed {
                return Err(IdeviceError::ConnectionClosed);
            }
            let identifier = state.next_identifier;
            state.next_identifier = identifier.wrapping_add(1);
            identifier
        };
        let bytes = message::encode(
            identifier,
            0,
            self.inner.code,
            false,
            MessageKind::MethodInvocation,
            &payload,
            &aux,
        );
        self.inner.writer.send(&bytes).await
    }

    /// Sends a message and waits for the reply with the same identifier
    pub async fn send_and_await(
        &self,
        kind: MessageKind,
        payload: &[u8],
        aux: &PrimitiveDictionary,
    ) -> Result<DtxMessage, IdeviceError> {
        let (tx, rx) = oneshot::channel();
        let gate = self.inner.send_gate.lock().await;
        let (identifier, timeout) = {
            let mut state = self.state();
            if state.closed {
                return Err(IdeviceError::ConnectionClosed);
            }
            let identifier = state.next_identifier;
            state.next_identifier = identifier.wrapping_add(1);
            state.pending.insert(identifier, tx);
            (identifier, state.timeout)
        };
        let _slot = PendingSlot {
            inner: &self.inner,
            identifier,
        };

        let bytes = message::encode(identifier, 0, self.inner.code, true, kind, payload, aux);
        self.inner.writer.send(&bytes).await?;
        drop(gate);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(IdeviceError::ConnectionClosed),
            Err(_) => Err(IdeviceError::Timeout {
                identifier,
                channel_code: self.inner.code,
            }),
        }
    }

    /// Answers a peer-initiated invocation
    ///
    /// The reply goes out on the code the peer used.
    pub async fn reply(
        &self,
        to: &DtxMessage,
        value: &ArchiveValue,
    ) -> Result<(), IdeviceError> {
        let payload = nskeyedarchive::archive(value)?;
        let bytes = message::encode(
            to.header.identifier,
            to.header.conversation_index + 1,
            to.header.channel_code,
            false,
            MessageKind::ResponseWithReturnValue,
            &payload,
            &PrimitiveDictionary::new(),
        );
        let _gate = self.inner.send_gate.lock().await;
        self.inner.writer.send(&bytes).await
    }

    /// Routes invocations of `selector` by the peer to [`Self::receive`]
    pub fn register_for_remote(&self, selector: &str) {
        let mut state = self.state();
        state.selectors.entry(selector.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            SelectorQueue {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
    }

    /// Waits for the next invocation of a registered selector
    pub async fn receive(&self, selector: &str) -> Result<DtxMessage, IdeviceError> {
        let rx = {
            let state = self.state();
            if state.closed {
                return Err(IdeviceError::ConnectionClosed);
            }
            match state.selectors.get(selector) {
                Some(q) => q.rx.clone(),
                None => {
                    return Err(IdeviceError::InternalError(format!(
                        "{selector} is not registered on channel {}",
                        self.inner.name
                    )));
                }
            }
        };
        let mut rx = rx.lock().await;
        rx.recv().await.ok_or(IdeviceError::ConnectionClosed)
    }

    /// Routes one inbound message, called by the reader task only
    pub(crate) fn dispatch(&self, message: DtxMessage) {
        let mut state = self.state();
        let identifier = message.header.identifier;
        if identifier >= state.next_identifier {
            state.next_identifier = identifier.wrapping_add(1);
        }

        if message.kind() == MessageKind::MethodInvocation {
            let queue = message
                .selector()
                .and_then(|s| state.selectors.get(s))
                .map(|q| q.tx.clone());
            if let Some(tx) = queue {
                if tx.send(message).is_err() {
                    debug!("Selector queue on {} is gone", self.inner.name);
                }
                return;
            }
        }

        if message.header.conversation_index > 0 {
            match state.pending.remove(&identifier) {
                Some(slot) => {
                    if slot.send(Ok(message)).is_err() {
                        debug!("Caller for {identifier} on {} went away", self.inner.name);
                    }
                }
                None => warn!(
                    "No caller waiting for reply {identifier} on channel {}, dropping it",
                    self.inner.code
                ),
            }
            return;
        }

        drop(state);
        self.inner.dispatcher.dispatch(message);
    }

    /// Fails every waiting call and ends every selector queue
    ///
    /// Waiting calls get a copy of `cause` when the connection died of an
    /// error, [`IdeviceError::ConnectionClosed`] otherwise.
    pub(crate) fn close(&self, cause: Option<&IdeviceError>) {
        let mut state = self.state();
        state.closed = true;
        for (_, slot) in state.pending.drain() {
            let e = cause.map(duplicate).unwrap_or(IdeviceError::ConnectionClosed);
            let _ = slot.send(Err(e));
        }
        state.selectors.clear();
    }
}

/// Rebuilds an error that ended a connection for every call it fails
pub(crate) fn duplicate(e: &IdeviceError) -> IdeviceError {
    match e {
        IdeviceError::Socket(io) => {
            IdeviceError::Socket(std::io::Error::new(io.kind(), io.to_string()))
        }
        IdeviceError::DtxOutOfSync(magic) => IdeviceError::DtxOutOfSync(*magic),
        IdeviceError::DtxIncomplete(what) => IdeviceError::DtxIncomplete(*what),
        IdeviceError::DtxMessageTooLarge(len) => IdeviceError::DtxMessageTooLarge(*len),
        IdeviceError::BadHeaderLength(len) => IdeviceError::BadHeaderLength(*len),
        IdeviceError::UnknownAuxValueType(t) => IdeviceError::UnknownAuxValueType(*t),
        IdeviceError::NotEnoughBytes(got, want) => IdeviceError::NotEnoughBytes(*got, *want),
        IdeviceError::ConnectionClosed => IdeviceError::ConnectionClosed,
        other => IdeviceError::InternalError(other.to_string()),
    }
}

fn archived_args(args: &[ArchiveValue]) -> Result<PrimitiveDictionary, ArchiveError> {
    let mut aux = PrimitiveDictionary::new();
    for arg in args {
        aux.push_archived(arg)?;
    }
    Ok(aux)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtx::message::{DtxFrame, read_frame};
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf};

    #[derive(Default)]
    struct Collect(StdMutex<Vec<DtxMessage>>);

    impl Dispatcher for Collect {
        fn dispatch(&self, message: DtxMessage) {
            self.0.lock().unwrap().push(message);
        }
    }

    fn channel(dispatcher: Arc<dyn Dispatcher>) -> (Channel, ReadHalf<DuplexStream>) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let boxed: Box<dyn ReadWrite> = Box::new(client);
        let (_, write) = tokio::io::split(boxed);
        let (server_read, _server_write) = tokio::io::split(server);
        let writer = Arc::new(Writer::new(write));
        (Channel::new(3, "test", 1, writer, dispatcher), server_read)
    }

    async fn next(reader: &mut ReadHalf<DuplexStream>) -> DtxMessage {
        match read_frame(reader).await.unwrap() {
            DtxFrame::Message(m) => m,
            DtxFrame::Fragment { .. } => panic!("unexpected fragment"),
        }
    }

    fn inbound(identifier: u32, conv: u32, kind: MessageKind, payload: &ArchiveValue) -> DtxMessage {
        let bytes = message::encode(
            identifier,
            conv,
            3,
            false,
            kind,
            &nskeyedarchive::archive(payload).unwrap(),
            &PrimitiveDictionary::new(),
        );
        DtxMessage::from_bytes(&bytes).unwrap()
    }

    #[tokio::test]
    async fn invoke_correlates_reply() {
        let (channel, mut peer) = channel(Arc::new(LoggingDispatcher));
        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.invoke("ping:", &[ArchiveValue::from("x")]).await })
        };

        let sent = next(&mut peer).await;
        assert_eq!(sent.selector(), Some("ping:"));
        assert!(sent.header.expects_reply);
        assert_eq!(sent.header.channel_code, 3);
        assert_eq!(sent.aux.len(), 1);

        channel.dispatch(inbound(
            sent.header.identifier,
            1,
            MessageKind::ResponseWithReturnValue,
            &"pong".into(),
        ));
        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.payload, vec![ArchiveValue::from("pong")]);
    }

    #[tokio::test]
    async fn error_reply() {
        let (channel, mut peer) = channel(Arc::new(LoggingDispatcher));
        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.invoke("fail", &[]).await })
        };
        let sent = next(&mut peer).await;
        channel.dispatch(inbound(
            sent.header.identifier,
            1,
            MessageKind::Error,
            &"no such selector".into(),
        ));
        assert!(matches!(
            call.await.unwrap(),
            Err(IdeviceError::RemoteError(e)) if e == "no such selector"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reclaims_slot() {
        let (channel, mut peer) = channel(Arc::new(LoggingDispatcher));
        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.invoke("slow", &[]).await })
        };
        let sent = next(&mut peer).await;
        let res = call.await.unwrap();
        assert!(matches!(
            res,
            Err(IdeviceError::Timeout { identifier, channel_code: 3 }) if identifier == sent.header.identifier
        ));
        assert!(channel.state().pending.is_empty());
    }

    #[tokio::test]
    async fn identifiers_follow_the_peer() {
        let collect = Arc::new(Collect::default());
        let (channel, mut peer) = channel(collect.clone());
        channel.dispatch(inbound(40, 0, MessageKind::MethodInvocation, &"event".into()));
        assert_eq!(collect.0.lock().unwrap().len(), 1);

        channel.invoke_async("next", &[]).await.unwrap();
        let sent = next(&mut peer).await;
        assert_eq!(sent.header.identifier, 41);
        assert!(!sent.header.expects_reply);
    }

    #[tokio::test]
    async fn registered_selectors_are_queued() {
        let collect = Arc::new(Collect::default());
        let (channel, _peer) = channel(collect.clone());
        channel.register_for_remote("memoryNotification:");
        channel.dispatch(inbound(
            7,
            0,
            MessageKind::MethodInvocation,
            &"memoryNotification:".into(),
        ));
        let m = channel.receive("memoryNotification:").await.unwrap();
        assert_eq!(m.header.identifier, 7);
        assert!(collect.0.lock().unwrap().is_empty());

        assert!(matches!(
            channel.receive("other:").await,
            Err(IdeviceError::InternalError(_))
        ));
    }

    #[tokio::test]
    async fn unmatched_reply_is_dropped() {
        let collect = Arc::new(Collect::default());
        let (channel, _peer) = channel(collect.clone());
        channel.dispatch(inbound(
            99,
            1,
            MessageKind::ResponseWithReturnValue,
            &"late".into(),
        ));
        assert!(collect.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_fails_waiting_calls() {
        let (channel, mut peer) = channel(Arc::new(LoggingDispatcher));
        channel.register_for_remote("event:");
        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.invoke("hang", &[]).await })
        };
        let wait = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.receive("event:").await })
        };
        next(&mut peer).await;
        tokio::task::yield_now().await;
        channel.close(None);

        assert!(matches!(
            call.await.unwrap(),
            Err(IdeviceError::ConnectionClosed)
        ));
        assert!(matches!(
            wait.await.unwrap(),
            Err(IdeviceError::ConnectionClosed)
        ));
        assert!(matches!(
            channel.invoke("again", &[]).await,
            Err(IdeviceError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn reply_uses_peer_code() {
        let (channel, mut peer) = channel(Arc::new(LoggingDispatcher));
        let mut request = inbound(12, 0, MessageKind::MethodInvocation, &"question".into());
        request.header.channel_code = -3;
        channel.reply(&request, &"answer".into()).await.unwrap();

        let sent = next(&mut peer).await;
        assert_eq!(sent.header.channel_code, -3);
        assert_eq!(sent.header.identifier, 12);
        assert_eq!(sent.header.conversation_index, 1);
        assert_eq!(sent.kind(), MessageKind::ResponseWithReturnValue);

        let mut rest = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_millis(10), peer.read(&mut rest))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn highest_identifier_wraps() {
        let collect = Arc::new(Collect::default());
        let (channel, mut peer) = channel(collect.clone());
        channel.dispatch(inbound(u32::MAX, 0, MessageKind::MethodInvocation, &"event".into()));
        assert_eq!(collect.0.lock().unwrap().len(), 1);

        channel.invoke_async("after", &[]).await.unwrap();
        assert_eq!(next(&mut peer).await.header.identifier, 0);
        channel.invoke_async("again", &[]).await.unwrap();
        assert_eq!(next(&mut peer).await.header.identifier, 1);
    }

    #[tokio::test]
    async fn close_hands_out_the_cause() {
        let (channel, mut peer) = channel(Arc::new(LoggingDispatcher));
        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.invoke("hang", &[]).await })
        };
        next(&mut peer).await;
        tokio::task::yield_now().await;
        channel.close(Some(&IdeviceError::DtxOutOfSync(0xaaaa_aaaa)));

        assert!(matches!(
            call.await.unwrap(),
            Err(IdeviceError::DtxOutOfSync(0xaaaa_aaaa))
        ));
    }

    #[test]
    fn duplicated_socket_errors_keep_their_kind() {
        let e = IdeviceError::Socket(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        match duplicate(&e) {
            IdeviceError::Socket(io) => assert_eq!(io.kind(), std::io::ErrorKind::ConnectionReset),
            other => panic!("unexpected {other:?}"),
        }
    }
}
