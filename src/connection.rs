use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn, Instrument};

use crate::codec::FrameCodec;
use crate::command::Command;
use crate::config::Config;
use crate::frame::Frame;
use crate::pubsub::{Message, MessageKind, Subscriber, Subscription, SubscriptionKind};
use crate::{Error, Result};

/// Commands a RESP2 connection may still issue while it holds subscriptions.
const SUBSCRIPTION_ALLOWED: &[&str] = &[
    "SUBSCRIBE",
    "PSUBSCRIBE",
    "UNSUBSCRIBE",
    "PUNSUBSCRIBE",
    "PING",
    "QUIT",
];

/// First elements that mark a RESP2 array as a pub/sub event rather than the
/// reply to the head of the pending queue.
const SUBSCRIPTION_EVENTS: &[&str] = &[
    "message",
    "smessage",
    "pmessage",
    "subscribe",
    "psubscribe",
    "unsubscribe",
    "punsubscribe",
];

pub(crate) const INVALIDATION_CHANNEL: &str = "__redis__:invalidate";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Resp2,
    Resp3,
}

struct Pending {
    label: String,
    tx: oneshot::Sender<Result<Frame>>,
}

// Entries parked while the pipeline is at depth keep their encoded bytes so
// promotion does not re-encode.
struct Queued {
    bytes: Bytes,
    label: String,
    tx: oneshot::Sender<Result<Frame>>,
}

struct State {
    protocol: Protocol,
    connected: bool,
    pending: VecDeque<Pending>,
    awaiting_pipeline: VecDeque<Queued>,
    pubsub_count: usize,
    channels: HashMap<String, Subscription>,
    patterns: HashMap<String, Subscription>,
    pending_unsubscribes: HashMap<(SubscriptionKind, String), Vec<oneshot::Sender<()>>>,
    // One barrier per queued MULTI session, in registration order. Resolved
    // barriers are purged lazily.
    pending_multi: Vec<watch::Receiver<bool>>,
    invalidations: Option<UnboundedSender<Vec<Bytes>>>,
}

struct Inner {
    config: Config,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: Mutex<State>,
    // Holding this lock across the queue push and the write keeps wire order
    // identical to pending order. `None` once the connection is torn down.
    writer: tokio::sync::Mutex<Option<BufWriter<OwnedWriteHalf>>>,
}

/// One client connection: owns the byte stream, pairs decoded replies with
/// pending requests in FIFO order, and routes pub/sub traffic to the
/// subscription registry. Cloning returns another handle to the same
/// connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct FrameReader {
    read_half: OwnedReadHalf,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl FrameReader {
    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            if 0 == self.read_half.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Protocol(
                    "connection reset inside a frame".to_string(),
                ));
            }
        }
    }
}

impl Connection {
    /// Opens a connection and negotiates the protocol level with `HELLO 3`,
    /// falling back to RESP2 plus explicit `AUTH`/`CLIENT SETNAME` on
    /// servers that predate it.
    pub async fn connect(config: Config) -> Result<Connection> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let mut reader = FrameReader {
            read_half,
            buffer: BytesMut::with_capacity(config.stream_read_len),
            codec: FrameCodec::new(),
        };
        let mut writer = BufWriter::with_capacity(config.stream_write_len, write_half);

        let protocol = negotiate(&mut reader, &mut writer, &config).await?;
        if config.database != 0 {
            let select = Command::new("SELECT").arg(config.database.to_string());
            roundtrip(&mut reader, &mut writer, select).await?;
        }
        info!(%peer_addr, ?protocol, "connected");

        let connection = Connection {
            inner: Arc::new(Inner {
                local_addr,
                peer_addr,
                state: Mutex::new(State {
                    protocol,
                    connected: true,
                    pending: VecDeque::new(),
                    awaiting_pipeline: VecDeque::new(),
                    pubsub_count: 0,
                    channels: HashMap::new(),
                    patterns: HashMap::new(),
                    pending_unsubscribes: HashMap::new(),
                    pending_multi: Vec::new(),
                    invalidations: None,
                }),
                writer: tokio::sync::Mutex::new(Some(writer)),
                config,
            }),
        };

        tokio::spawn(read_loop(connection.clone(), reader));

        Ok(connection)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.state.lock().unwrap().protocol
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().unwrap().connected
    }

    /// Sends one command and resolves with its reply.
    ///
    /// Subscription commands are diverted to the multiplexer path: they are
    /// written to the stream but never take a pending slot, because their
    /// acknowledgements come back as subscription events (RESP2) or push
    /// frames (RESP3).
    pub async fn execute(&self, command: Command) -> Result<Frame> {
        match command.name().as_str() {
            "SUBSCRIBE" => self.execute_subscribe(SubscriptionKind::Channel, command).await,
            "PSUBSCRIBE" => self.execute_subscribe(SubscriptionKind::Pattern, command).await,
            "UNSUBSCRIBE" => self.execute_unsubscribe(SubscriptionKind::Channel, command).await,
            "PUNSUBSCRIBE" => self.execute_unsubscribe(SubscriptionKind::Pattern, command).await,
            _ => self.execute_inner(command, false).await,
        }
    }

    /// Command issued from inside a MULTI session: skips the barrier wait so
    /// the session's own traffic is not deferred by its own barrier.
    pub(crate) async fn execute_internal(&self, command: Command) -> Result<Frame> {
        self.execute_inner(command, true).await
    }

    async fn execute_inner(&self, command: Command, internal: bool) -> Result<Frame> {
        if self.inner.config.opentracing {
            let span = tracing::info_span!("redis_command", command = %command.label());
            self.execute_unspanned(command, internal).instrument(span).await
        } else {
            self.execute_unspanned(command, internal).await
        }
    }

    async fn execute_unspanned(&self, command: Command, internal: bool) -> Result<Frame> {
        let name = command.name();
        {
            let state = self.inner.state.lock().unwrap();
            if !state.connected {
                return Err(Error::disconnected());
            }
            if state.protocol == Protocol::Resp2
                && state.pubsub_count > 0
                && !SUBSCRIPTION_ALLOWED.contains(&name.as_str())
            {
                return Err(Error::subscribed_lockout(
                    &name,
                    state.channels.len(),
                    state.patterns.len(),
                ));
            }
        }

        // Commands issued while MULTI sessions are queued wait for every
        // barrier registered so far.
        if !internal {
            let barriers: Vec<watch::Receiver<bool>> = {
                let mut state = self.inner.state.lock().unwrap();
                state.pending_multi.retain(|rx| !*rx.borrow());
                state.pending_multi.clone()
            };
            for mut barrier in barriers {
                let _ = barrier.wait_for(|done| *done).await;
            }
        }

        let label = command.label();
        let bytes = command.to_bytes();
        let (tx, rx) = oneshot::channel();

        {
            let mut writer = self.inner.writer.lock().await;
            let should_write = {
                let mut state = self.inner.state.lock().unwrap();
                if !state.connected {
                    return Err(Error::disconnected());
                }
                let depth = self.inner.config.pipeline_depth;
                if depth > 0 && state.pending.len() >= depth {
                    state.awaiting_pipeline.push_back(Queued {
                        bytes: bytes.clone(),
                        label,
                        tx,
                    });
                    false
                } else {
                    state.pending.push_back(Pending { label, tx });
                    true
                }
            };
            if should_write {
                if let Err(e) = write_bytes(&mut writer, &bytes).await {
                    self.fail_all();
                    *writer = None;
                    return Err(e);
                }
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::disconnected()),
        }
    }

    /// Subscribes and returns a consumer handle once the server has acked
    /// every requested name.
    pub async fn subscribe(&self, kind: SubscriptionKind, names: &[String]) -> Result<Subscriber> {
        let (sink, receiver) = mpsc::unbounded_channel();
        let acks = self.send_subscribe(kind, names, Some(sink)).await?;
        for ack in acks {
            ack.await.map_err(|_| Error::disconnected())?;
        }
        Ok(Subscriber { receiver })
    }

    /// Removes subscriptions and resolves once the server has acked every
    /// requested name. Sinks close as the acks arrive.
    pub async fn unsubscribe(&self, kind: SubscriptionKind, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Err(Error::config(
                "at least one channel or pattern is required",
            ));
        }
        let command = Command::new(kind.unsubscribe_command())
            .args(names.iter().map(|name| Bytes::from(name.clone())));
        let bytes = command.to_bytes();

        let receivers = {
            let mut writer = self.inner.writer.lock().await;
            let receivers = {
                let mut state = self.inner.state.lock().unwrap();
                if !state.connected {
                    return Err(Error::disconnected());
                }
                names
                    .iter()
                    .map(|name| {
                        let (tx, rx) = oneshot::channel();
                        state
                            .pending_unsubscribes
                            .entry((kind, name.clone()))
                            .or_default()
                            .push(tx);
                        rx
                    })
                    .collect::<Vec<_>>()
            };
            if let Err(e) = write_bytes(&mut writer, &bytes).await {
                self.fail_all();
                *writer = None;
                return Err(e);
            }
            receivers
        };

        for rx in receivers {
            rx.await.map_err(|_| Error::disconnected())?;
        }
        Ok(())
    }

    async fn execute_subscribe(&self, kind: SubscriptionKind, command: Command) -> Result<Frame> {
        let names = command.tail_strings();
        let acks = self.send_subscribe(kind, &names, None).await?;

        let mut last = Frame::Null;
        for (name, ack) in names.iter().zip(acks) {
            let count = ack.await.map_err(|_| Error::disconnected())?;
            last = Frame::Array(vec![
                Frame::Bulk(Bytes::from(kind.subscribe_command().to_lowercase())),
                Frame::Bulk(Bytes::from(name.clone())),
                Frame::Integer(count),
            ]);
        }
        Ok(last)
    }

    async fn execute_unsubscribe(&self, kind: SubscriptionKind, command: Command) -> Result<Frame> {
        let names = command.tail_strings();
        self.unsubscribe(kind, &names).await?;
        Ok(Frame::Null)
    }

    async fn send_subscribe(
        &self,
        kind: SubscriptionKind,
        names: &[String],
        sink: Option<UnboundedSender<Message>>,
    ) -> Result<Vec<oneshot::Receiver<i64>>> {
        if names.is_empty() {
            return Err(Error::config(
                "at least one channel or pattern is required",
            ));
        }
        let command = Command::new(kind.subscribe_command())
            .args(names.iter().map(|name| Bytes::from(name.clone())));
        let bytes = command.to_bytes();

        let mut writer = self.inner.writer.lock().await;
        let receivers = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.connected {
                return Err(Error::disconnected());
            }
            let mut receivers = Vec::with_capacity(names.len());
            for name in names {
                let registry = match kind {
                    SubscriptionKind::Channel => &mut state.channels,
                    SubscriptionKind::Pattern => &mut state.patterns,
                };
                let subscription = registry
                    .entry(name.clone())
                    .or_insert_with(|| Subscription::new(name.clone(), kind));
                if let Some(sink) = &sink {
                    subscription.sinks.push(sink.clone());
                }
                let (ack_tx, ack_rx) = oneshot::channel();
                subscription.pending_acks.push_back(ack_tx);
                receivers.push(ack_rx);
            }
            receivers
        };

        // The acks come back through the event path, so nothing is placed on
        // the pending queue.
        if let Err(e) = write_bytes(&mut writer, &bytes).await {
            self.fail_all();
            *writer = None;
            return Err(e);
        }
        Ok(receivers)
    }

    /// Registers a MULTI barrier, returning its resolver plus the barriers
    /// of every session queued before this one.
    pub(crate) fn register_multi_barrier(
        &self,
    ) -> (watch::Sender<bool>, Vec<watch::Receiver<bool>>) {
        let (tx, rx) = watch::channel(false);
        let mut state = self.inner.state.lock().unwrap();
        state.pending_multi.retain(|barrier| !*barrier.borrow());
        let earlier = state.pending_multi.clone();
        state.pending_multi.push(rx);
        (tx, earlier)
    }

    pub(crate) fn set_invalidation_sink(&self, sink: UnboundedSender<Vec<Bytes>>) {
        self.inner.state.lock().unwrap().invalidations = Some(sink);
    }

    async fn dispatch(&self, frame: Frame) {
        let frame = match frame {
            // Push frames never terminate a pending request.
            Frame::Push(items) => {
                self.handle_event(items);
                return;
            }
            frame => frame,
        };

        let is_event = {
            let state = self.inner.state.lock().unwrap();
            state.protocol == Protocol::Resp2
                && frame
                    .event_name()
                    .map_or(false, |name| SUBSCRIPTION_EVENTS.contains(&name))
        };
        if is_event {
            if let Frame::Array(items) = frame {
                self.handle_event(items);
            }
            return;
        }

        let entry = self.inner.state.lock().unwrap().pending.pop_front();
        match entry {
            None => warn!(reply = %frame, "reply arrived with no pending request"),
            Some(pending) => {
                let result = match frame {
                    Frame::Error(message) => Err(Error::redis(message)),
                    frame => Ok(frame),
                };
                if pending.tx.send(result).is_err() {
                    // Cancelled after the write: the reply is discarded but
                    // the slot was still consumed, preserving FIFO.
                    debug!(command = %pending.label, "caller went away before its reply");
                }
            }
        }

        self.promote_waiting().await;
    }

    // Drains `awaiting_pipeline` into freed pending slots, in order.
    async fn promote_waiting(&self) {
        let mut writer = self.inner.writer.lock().await;
        loop {
            let bytes = {
                let mut state = self.inner.state.lock().unwrap();
                let depth = self.inner.config.pipeline_depth;
                loop {
                    if depth > 0 && state.pending.len() >= depth {
                        return;
                    }
                    match state.awaiting_pipeline.pop_front() {
                        None => return,
                        // Cancelled before its bytes were written: drop the
                        // entry without consuming a slot.
                        Some(queued) if queued.tx.is_closed() => continue,
                        Some(queued) => {
                            state.pending.push_back(Pending {
                                label: queued.label,
                                tx: queued.tx,
                            });
                            break queued.bytes;
                        }
                    }
                }
            };
            if let Err(e) = write_bytes(&mut writer, &bytes).await {
                warn!(error = %e, "write failed while draining the pipeline queue");
                self.fail_all();
                *writer = None;
                return;
            }
        }
    }

    fn handle_event(&self, items: Vec<Frame>) {
        let name = match items.first() {
            Some(Frame::Simple(s)) => Some(s.clone()),
            Some(Frame::Bulk(data)) => std::str::from_utf8(data).ok().map(str::to_string),
            _ => None,
        };
        match name.as_deref() {
            Some("subscribe") => self.handle_subscribe_ack(SubscriptionKind::Channel, items),
            Some("psubscribe") => self.handle_subscribe_ack(SubscriptionKind::Pattern, items),
            Some("unsubscribe") => self.handle_unsubscribe_ack(SubscriptionKind::Channel, items),
            Some("punsubscribe") => self.handle_unsubscribe_ack(SubscriptionKind::Pattern, items),
            Some("message") => self.handle_message(MessageKind::Message, items),
            Some("smessage") => self.handle_message(MessageKind::SMessage, items),
            Some("pmessage") => self.handle_message(MessageKind::PMessage, items),
            Some("invalidate") => {
                let payload = items.into_iter().nth(1);
                self.handle_invalidation(payload);
            }
            other => debug!(event = ?other, "ignoring unrecognized event frame"),
        }
    }

    fn handle_subscribe_ack(&self, kind: SubscriptionKind, items: Vec<Frame>) {
        let mut items = items.into_iter();
        let _event = items.next();
        let name = match items.next().and_then(Frame::into_string) {
            Some(name) => name,
            None => {
                debug!("subscribe ack without a channel name");
                return;
            }
        };
        let count = items.next().and_then(Frame::into_integer).unwrap_or(0);

        let mut state = self.inner.state.lock().unwrap();
        state.pubsub_count += 1;
        let registry = match kind {
            SubscriptionKind::Channel => &mut state.channels,
            SubscriptionKind::Pattern => &mut state.patterns,
        };
        let subscription = registry
            .entry(name.clone())
            .or_insert_with(|| Subscription::new(name, kind));
        if let Some(ack) = subscription.pending_acks.pop_front() {
            let _ = ack.send(count);
        }
    }

    fn handle_unsubscribe_ack(&self, kind: SubscriptionKind, items: Vec<Frame>) {
        let name = match items.into_iter().nth(1).and_then(Frame::into_string) {
            Some(name) => name,
            None => {
                debug!("unsubscribe ack without a channel name");
                return;
            }
        };

        let mut state = self.inner.state.lock().unwrap();
        state.pubsub_count = state.pubsub_count.saturating_sub(1);
        let registry = match kind {
            SubscriptionKind::Channel => &mut state.channels,
            SubscriptionKind::Pattern => &mut state.patterns,
        };
        // Dropping the entry closes its sinks.
        registry.remove(&name);
        if let Some(waiters) = state.pending_unsubscribes.remove(&(kind, name)) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }

    fn handle_message(&self, kind: MessageKind, items: Vec<Frame>) {
        let mut items = items.into_iter();
        let _event = items.next();

        // message/smessage: [event, channel, payload]
        // pmessage:         [event, pattern, channel, payload]
        let (pattern, channel) = match kind {
            MessageKind::PMessage => {
                let pattern = items.next().and_then(Frame::into_string);
                let channel = items.next().and_then(Frame::into_string);
                (pattern, channel)
            }
            _ => (None, items.next().and_then(Frame::into_string)),
        };
        let channel = match channel {
            Some(channel) => channel,
            None => {
                debug!("pub/sub message without a channel");
                return;
            }
        };
        let payload = items.next();

        // Invalidation traffic redirected at a RESP2 sibling arrives as
        // ordinary messages on the reserved channel; the payload is the key
        // list, not bytes for a consumer.
        if channel == INVALIDATION_CHANNEL {
            self.handle_invalidation(payload);
            return;
        }

        let payload = match payload.and_then(Frame::into_bytes) {
            Some(payload) => payload,
            None => {
                debug!(%channel, "pub/sub message without a payload");
                return;
            }
        };

        let mut state = self.inner.state.lock().unwrap();
        let (registry, key) = match kind {
            MessageKind::PMessage => (&mut state.patterns, pattern.clone().unwrap_or_default()),
            _ => (&mut state.channels, channel.clone()),
        };
        match registry.get_mut(&key) {
            Some(subscription) => subscription.deliver(Message {
                kind,
                channel,
                pattern,
                payload,
            }),
            None => warn!(name = %key, "dropping message for an unknown subscription"),
        }
    }

    fn handle_invalidation(&self, payload: Option<Frame>) {
        let keys: Vec<Bytes> = match payload {
            Some(Frame::Array(items)) => {
                items.into_iter().filter_map(Frame::into_bytes).collect()
            }
            Some(Frame::Bulk(key)) => vec![key],
            // A nil payload invalidates the whole tracking table.
            Some(Frame::Null) | None => Vec::new(),
            Some(other) => {
                debug!(payload = %other, "unrecognized invalidation payload");
                return;
            }
        };

        let sink = self.inner.state.lock().unwrap().invalidations.clone();
        match sink {
            Some(sink) => {
                let _ = sink.send(keys);
            }
            None => debug!("invalidation arrived with no cache attached"),
        }
    }

    /// Fails every in-flight and queued request, closes all subscription
    /// sinks and fires the disconnect hook. Idempotent.
    fn fail_all(&self) {
        let (pending, awaiting, unsubscribes) = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.connected {
                return;
            }
            state.connected = false;
            let pending = std::mem::take(&mut state.pending);
            let awaiting = std::mem::take(&mut state.awaiting_pipeline);
            let unsubscribes = std::mem::take(&mut state.pending_unsubscribes);
            // Dropping the registries closes every sink and fails every
            // pending subscribe ack.
            state.channels.clear();
            state.patterns.clear();
            state.pubsub_count = 0;
            state.invalidations = None;
            (pending, awaiting, unsubscribes)
        };

        for entry in pending {
            let _ = entry.tx.send(Err(Error::disconnected()));
        }
        for entry in awaiting {
            let _ = entry.tx.send(Err(Error::disconnected()));
        }
        drop(unsubscribes);

        if let Some(hook) = &self.inner.config.on_disconnect {
            hook();
        }
        info!("connection closed");
    }
}

async fn read_loop(connection: Connection, mut reader: FrameReader) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => connection.dispatch(frame).await,
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "tearing the connection down");
                break;
            }
        }
    }
    connection.fail_all();
    *connection.inner.writer.lock().await = None;
}

async fn write_bytes(
    writer: &mut Option<BufWriter<OwnedWriteHalf>>,
    bytes: &[u8],
) -> Result<()> {
    match writer.as_mut() {
        None => Err(Error::disconnected()),
        Some(writer) => {
            writer.write_all(bytes).await?;
            writer.flush().await?;
            Ok(())
        }
    }
}

async fn negotiate(
    reader: &mut FrameReader,
    writer: &mut BufWriter<OwnedWriteHalf>,
    config: &Config,
) -> Result<Protocol> {
    let mut hello = Command::new("HELLO").arg("3");
    if let Some(auth) = &config.auth {
        hello = hello.arg("AUTH").arg("default").arg(auth.clone());
    }
    if let Some(name) = &config.client_name {
        hello = hello.arg("SETNAME").arg(name.clone());
    }

    match roundtrip(reader, writer, hello).await {
        Ok(_) => Ok(Protocol::Resp3),
        Err(Error::Redis { message, .. }) if message.starts_with("ERR unknown command") => {
            // Pre-RESP3 server: authenticate and name the connection the
            // old way.
            if let Some(auth) = &config.auth {
                roundtrip(reader, writer, Command::new("AUTH").arg(auth.clone())).await?;
            }
            if let Some(name) = &config.client_name {
                let setname = Command::new("CLIENT").arg("SETNAME").arg(name.clone());
                roundtrip(reader, writer, setname).await?;
            }
            Ok(Protocol::Resp2)
        }
        Err(e) => Err(e),
    }
}

// One synchronous request/reply exchange, used only before the reader task
// takes over the stream.
async fn roundtrip(
    reader: &mut FrameReader,
    writer: &mut BufWriter<OwnedWriteHalf>,
    command: Command,
) -> Result<Frame> {
    let bytes = command.to_bytes();
    writer.write_all(&bytes).await?;
    writer.flush().await?;

    match reader.read_frame().await? {
        None => Err(Error::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "server closed the connection during negotiation",
        ))),
        Some(Frame::Error(message)) => Err(Error::redis(message)),
        Some(frame) => Ok(frame),
    }
}
