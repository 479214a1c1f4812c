//! DTX remote server client
//!
//! One connection carries many logical channels. A single dispatch task reads frames,
//! reassembles them and either resolves the caller waiting on that message id or hands
//! the message to the callback registered for its selector or channel.
//!
//! Channel codes are chosen locally, starting at 1 (0 is the control channel), and are
//! memoized by service name for the lifetime of the connection. Devices answer on the
//! negated code, so incoming channels are matched by absolute value.
//!
//! Callbacks run on the dispatch task and must return quickly; hand work off through a
//! channel. Registering a key again replaces the previous handler.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicI32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use indexmap::IndexMap;
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use super::{
    message::{AuxValue, DEFAULT_FRAGMENT_SIZE, FragmentAssembler, Message, MessageKind, read_frame},
    value::DtxValue,
};
use crate::{Idevice, IdeviceError, ReadWrite};

const CONTROL_CHANNEL: i32 = 0;
const REQUEST_CHANNEL: &str = "_requestChannelWithCode:identifier:";
const PUBLISH_CAPABILITIES: &str = "_notifyOfPublishedCapabilities:";
pub const CAPABILITIES_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler for unsolicited messages
pub type Callback = Arc<dyn Fn(Message) + Send + Sync>;

type ReplySender = oneshot::Sender<Result<Message, IdeviceError>>;

struct Writer {
    stream: WriteHalf<Box<dyn ReadWrite>>,
    next_id: u32,
}

#[derive(Default)]
struct State {
    pending: HashMap<u32, ReplySender>,
    callbacks: HashMap<String, Callback>,
    channel_names: HashMap<i32, String>,
    capabilities: Option<oneshot::Sender<DtxValue>>,
    closed: bool,
}

struct Shared {
    label: String,
    writer: tokio::sync::Mutex<Writer>,
    state: Mutex<State>,
    channels: tokio::sync::Mutex<HashMap<String, i32>>,
    next_channel: AtomicI32,
    max_fragment: AtomicUsize,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Client for the DTX protocol spoken by the instruments remote server
///
/// Cloning yields another handle to the same connection. The connection closes when
/// [`close`](Self::close) is called or the last handle is dropped.
#[derive(Clone)]
pub struct RemoteServerClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RemoteServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteServerClient")
            .field("label", &self.shared.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RemoteServerClient {
    /// Takes over the service connection and starts the dispatch task
    pub fn new(idevice: Idevice) -> Result<Self, IdeviceError> {
        let label = idevice.label().to_string();
        Ok(Self::from_socket(idevice.into_socket()?, label))
    }

    pub fn from_socket(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        let (reader, writer) = tokio::io::split(socket);
        let shared = Arc::new(Shared {
            label: label.into(),
            writer: tokio::sync::Mutex::new(Writer {
                stream: writer,
                next_id: 1,
            }),
            state: Mutex::new(State::default()),
            channels: tokio::sync::Mutex::new(HashMap::new()),
            next_channel: AtomicI32::new(1),
            max_fragment: AtomicUsize::new(DEFAULT_FRAGMENT_SIZE),
            reader: Mutex::new(None),
        });
        let task = tokio::spawn(dispatch(reader, Arc::downgrade(&shared)));
        if let Ok(mut slot) = shared.reader.lock() {
            *slot = Some(task);
        }
        Self { shared }
    }

    /// Changes the largest body sent in one frame
    pub fn set_max_fragment_size(&self, size: usize) {
        self.shared.max_fragment.store(size.max(1), Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Sends one message, waiting for its reply when `expects_reply` is set
    ///
    /// Message ids are assigned and written under the same lock, so they go out strictly
    /// increasing and fragments of concurrent calls never interleave.
    pub async fn invoke(
        &self,
        channel: i32,
        selector: &str,
        aux: Vec<AuxValue>,
        expects_reply: bool,
    ) -> Result<Option<Message>, IdeviceError> {
        let rx = {
            let mut writer = self.shared.writer.lock().await;
            let identifier = writer.next_id;
            writer.next_id = writer.next_id.wrapping_add(1).max(1);

            let message = Message::invocation(identifier, channel, selector, aux, expects_reply);
            let frames = message.into_frames(self.shared.max_fragment.load(Ordering::Relaxed))?;

            let rx = {
                let mut state = self.shared.lock_state()?;
                if state.closed {
                    return Err(IdeviceError::ConnectionClosed);
                }
                expects_reply.then(|| {
                    let (tx, rx) = oneshot::channel();
                    state.pending.insert(identifier, tx);
                    rx
                })
            };

            debug!(
                "DTX send #{identifier} ch {channel} {selector} ({} aux, {} frames)",
                message.aux.len(),
                frames.len()
            );
            if let Err(e) = write_frames(&mut writer.stream, &frames).await {
                if let Ok(mut state) = self.shared.lock_state() {
                    state.pending.remove(&identifier);
                }
                return Err(e);
            }
            rx
        };

        match rx {
            None => Ok(None),
            Some(rx) => match rx.await {
                Ok(reply) => reply.map(Some),
                Err(_) => Err(IdeviceError::ConnectionClosed),
            },
        }
    }

    /// Opens, or reuses, the channel bound to a service name
    pub async fn make_channel(&self, name: &str) -> Result<Channel, IdeviceError> {
        let mut channels = self.shared.channels.lock().await;
        if let Some(code) = channels.get(name) {
            return Ok(self.channel(*code, name));
        }

        let code = self.shared.next_channel.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .invoke(
                CONTROL_CHANNEL,
                REQUEST_CHANNEL,
                vec![AuxValue::U32(code as u32), AuxValue::archived(name)?],
                true,
            )
            .await?
            .ok_or(IdeviceError::ConnectionClosed)?;
        match reply_value(reply)? {
            DtxValue::Null => {}
            other => {
                warn!("Channel request for {name} answered with {}", other.type_name());
                return Err(IdeviceError::UnexpectedResponse);
            }
        }

        debug!("Opened channel {code} for {name}");
        self.shared.lock_state()?.channel_names.insert(code, name.to_string());
        channels.insert(name.to_string(), code);
        Ok(self.channel(code, name))
    }

    fn channel(&self, code: i32, name: &str) -> Channel {
        Channel {
            client: self.clone(),
            code,
            name: name.into(),
        }
    }

    /// The control channel
    pub fn root_channel(&self) -> Channel {
        self.channel(CONTROL_CHANNEL, "")
    }

    /// Installs the handler for a selector or channel name, replacing any previous one
    pub fn register_callback(
        &self,
        key: impl Into<String>,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<(), IdeviceError> {
        let mut state = self.shared.lock_state()?;
        if state.closed {
            return Err(IdeviceError::ConnectionClosed);
        }
        let key = key.into();
        if state.callbacks.insert(key.clone(), Arc::new(handler)).is_some() {
            debug!("Replaced callback for {key}");
        }
        Ok(())
    }

    /// Removes a handler, returning whether one was installed
    pub fn unregister_callback(&self, key: &str) -> bool {
        self.shared
            .lock_state()
            .map(|mut s| s.callbacks.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Exchanges capabilities with the device
    ///
    /// Returns the device's published capabilities, or an empty map if it sends none
    /// within [`CAPABILITIES_TIMEOUT`].
    pub async fn notify_of_published_capabilities(
        &self,
    ) -> Result<IndexMap<String, DtxValue>, IdeviceError> {
        let (tx, rx) = oneshot::channel();
        self.shared.lock_state()?.capabilities = Some(tx);

        let mut caps = plist::Dictionary::new();
        caps.insert("com.apple.private.DTXBlockCompression".into(), 2.into());
        caps.insert("com.apple.private.DTXConnection".into(), 1.into());
        self.invoke(
            CONTROL_CHANNEL,
            PUBLISH_CAPABILITIES,
            vec![AuxValue::archived(caps)?],
            false,
        )
        .await?;

        match tokio::time::timeout(CAPABILITIES_TIMEOUT, rx).await {
            Ok(Ok(v)) => Ok(v.as_dictionary().cloned().unwrap_or_default()),
            Ok(Err(_)) => Err(IdeviceError::ConnectionClosed),
            Err(_) => {
                warn!("Device published no capabilities");
                if let Ok(mut state) = self.shared.lock_state() {
                    state.capabilities = None;
                }
                Ok(IndexMap::new())
            }
        }
    }

    /// Closes the connection, failing every pending call
    ///
    /// Callbacks are dropped, which closes any stream fed by them. Calling this again is
    /// a no-op.
    pub async fn close(&self) {
        let task = self.shared.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(task) = task {
            task.abort();
        }
        if !self.shared.shutdown("closed by host") {
            return;
        }
        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.stream.shutdown().await {
            trace!("Failed to shut down DTX stream: {e:?}");
        }
    }
}

impl Shared {
    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, State>, IdeviceError> {
        self.state
            .lock()
            .map_err(|_| IdeviceError::InvalidState("DTX state poisoned"))
    }

    /// Marks the connection closed; returns false if it already was
    fn shutdown(&self, reason: &str) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.closed {
            return false;
        }
        state.closed = true;
        debug!("DTX connection {} closing: {reason}", self.label);
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(IdeviceError::ConnectionClosed));
        }
        state.callbacks.clear();
        state.capabilities = None;
        true
    }

    /// Acknowledges a device request without holding up routing behind a slow write
    fn ack(self: &Arc<Self>, to: &Message) {
        let identifier = to.identifier;
        let frames = Message::ack(to).into_frames(self.max_fragment.load(Ordering::Relaxed));
        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let sent = match frames {
                Ok(frames) => {
                    let mut writer = shared.writer.lock().await;
                    write_frames(&mut writer.stream, &frames).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!("Failed to ack #{identifier}: {e:?}");
            }
        });
    }

    async fn route(
        self: &Arc<Self>,
        message: Result<Message, IdeviceError>,
        identifier: u32,
        is_reply: bool,
    ) {
        if is_reply {
            let waiter = self.state.lock().ok().and_then(|mut s| s.pending.remove(&identifier));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => trace!("Reply to #{identifier} has no waiter"),
            }
            return;
        }

        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to decode DTX message #{identifier}: {e:?}");
                return;
            }
        };
        trace!(
            "DTX recv #{} ch {} {:?}",
            message.identifier, message.channel, message.kind
        );

        if message.expects_reply {
            self.ack(&message);
        }

        let handler = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if message.selector() == Some(PUBLISH_CAPABILITIES) {
                if let Some(tx) = state.capabilities.take() {
                    let caps = message
                        .aux
                        .first()
                        .map(AuxValue::to_value)
                        .transpose()
                        .unwrap_or_else(|e| {
                            warn!("Undecodable capabilities: {e:?}");
                            None
                        })
                        .unwrap_or(DtxValue::Null);
                    let _ = tx.send(caps);
                    return;
                }
            }
            let by_selector = message.selector().and_then(|s| state.callbacks.get(s));
            let by_channel = || {
                state
                    .channel_names
                    .get(&message.channel.abs())
                    .and_then(|n| state.callbacks.get(n))
            };
            by_selector.or_else(by_channel).cloned()
        };

        match handler {
            Some(handler) => handler(message),
            None => warn!(
                "Unhandled DTX message on channel {} ({:?})",
                message.channel,
                message.selector()
            ),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(task) = self.reader.get_mut().ok().and_then(|r| r.take()) {
            task.abort();
        }
    }
}

async fn write_frames(
    stream: &mut WriteHalf<Box<dyn ReadWrite>>,
    frames: &[Vec<u8>],
) -> Result<(), IdeviceError> {
    for frame in frames {
        stream.write_all(frame).await?;
    }
    stream.flush().await?;
    Ok(())
}

async fn dispatch(mut reader: ReadHalf<Box<dyn ReadWrite>>, shared: Weak<Shared>) {
    let mut assembler = FragmentAssembler::default();
    let reason = loop {
        let (header, body) = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => break e,
        };
        let Some((header, body)) = assembler.push(header, body) else {
            continue;
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let decoded = Message::decode(&header, &body);
        shared
            .route(decoded, header.identifier, header.conversation_index > 0)
            .await;
    };

    if assembler.pending() > 0 {
        debug!("Discarding {} incomplete DTX messages", assembler.pending());
    }
    if let Some(shared) = shared.upgrade() {
        shared.shutdown(&format!("{reason:?}"));
    }
}

/// Extracts the result of a reply, turning device errors into [`IdeviceError::Remote`]
pub fn reply_value(reply: Message) -> Result<DtxValue, IdeviceError> {
    let value = reply.payload.unwrap_or(DtxValue::Null);
    if reply.kind == MessageKind::Error {
        return Err(match value {
            DtxValue::Error(e) => e.into(),
            other => IdeviceError::Remote {
                domain: "DTXMessage".into(),
                code: 0,
                message: other
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{other:?}")),
            },
        });
    }
    value.into_result()
}

/// A logical channel bound to one service
#[derive(Debug, Clone)]
pub struct Channel {
    client: RemoteServerClient,
    code: i32,
    name: Arc<str>,
}

impl Channel {
    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &RemoteServerClient {
        &self.client
    }

    /// Invokes a selector and waits for its result
    pub async fn call(&self, selector: &str, aux: Vec<AuxValue>) -> Result<DtxValue, IdeviceError> {
        let reply = self
            .client
            .invoke(self.code, selector, aux, true)
            .await?
            .ok_or(IdeviceError::ConnectionClosed)?;
        reply_value(reply)
    }

    /// Invokes a selector without waiting for a reply
    pub async fn send(&self, selector: &str, aux: Vec<AuxValue>) -> Result<(), IdeviceError> {
        self.client.invoke(self.code, selector, aux, false).await?;
        Ok(())
    }

    /// Routes messages arriving on this channel to `handler`
    pub fn register_callback(
        &self,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<(), IdeviceError> {
        self.client.register_callback(self.name.as_ref(), handler)
    }

    pub fn unregister_callback(&self) -> bool {
        self.client.unregister_callback(&self.name)
    }
}
