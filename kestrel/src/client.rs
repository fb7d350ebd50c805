// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use codec::{
    check_property_type_list, ByteArray, ConnectPacket, DecodePacket, DisconnectPacket,
    EncodePacket, MqttPacket, PacketId, PingRequestPacket, Properties, Property, PropertyType,
    PubTopic, PublishPacket, QoS, ReasonCode, SubscribeTopic, SubscribePacket, U16Data, U32Data,
    CONNECT_PROPERTIES, DISCONNECT_PROPERTIES, PUBLISH_PROPERTIES, SUBSCRIBE_PROPERTIES,
};

#[cfg(feature = "auth")]
use codec::{AuthPacket, BinaryData, StringData, AUTH_PROPERTIES, AUTH_REASONS};
#[cfg(feature = "qos1")]
use codec::PublishAckPacket;
#[cfg(feature = "qos2")]
use codec::{PublishCompletePacket, PublishReceivedPacket, PublishReleasePacket};
#[cfg(feature = "unsubscribe")]
use codec::{UnsubscribePacket, UNSUBSCRIBE_PROPERTIES};

use crate::connect_options::ConnectOptions;
use crate::error::{Error, ErrorKind};
use crate::handler::ClientHandler;
use crate::inflight::InFlightTable;
#[cfg(feature = "qos2")]
use crate::inflight::InboundQos2;
use crate::status::ClientStatus;
use crate::storage::{PacketStorage, RingBufferStorage};
use crate::stream::{Stream, TlsOptions};

/// Default network timeout for transport reads and writes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Mutable state shared by the write path.
///
/// The same mutex serializes packet writes, the in-flight slot table and the
/// packet storage, so a writer observes and mutates the delivery state
/// atomically with its send.
struct TxState {
    inflight: InFlightTable,
    storage: Option<Box<dyn PacketStorage>>,
    /// Identifiers of stored packets in save-order, replayed in this order
    /// on reconnect.
    send_order: Vec<PacketId>,
    /// Effective keep-alive, after a possible ServerKeepAlive override.
    keep_alive: Duration,
    last_write: Instant,
    ping_sent: Option<Instant>,
}

/// Limits advertised by the server in CONNACK.
#[derive(Debug, Clone, Copy)]
struct ServerLimits {
    receive_maximum: u16,
    maximum_packet_size: Option<u32>,
    topic_alias_maximum: u16,
    session_expiry_interval: u32,
    maximum_qos: QoS,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            receive_maximum: u16::MAX,
            maximum_packet_size: None,
            topic_alias_maximum: 0,
            session_expiry_interval: 0,
            maximum_qos: QoS::ExactOnce,
        }
    }
}

struct ClientInner {
    handler: Arc<dyn ClientHandler>,
    tls: TlsOptions,
    /// Queried once at creation; caps inbound packets.
    max_packet_size: u32,
    default_timeout: Mutex<Duration>,
    client_id: Mutex<String>,
    status: Mutex<ClientStatus>,
    stream: Mutex<Option<Arc<Stream>>>,
    tx: Mutex<TxState>,
    /// Serializes the single reader. Held for the duration of `event_loop`
    /// and the synchronous exchanges which read the transport.
    reader: Mutex<()>,
    teardown: AtomicBool,
    teardown_reason: Mutex<ReasonCode>,
    limits: Mutex<ServerLimits>,
}

/// A minimal MQTT v5 client.
///
/// The client is driven by one thread calling [`Client::event_loop`]
/// regularly; [`Client::publish`] may be called from any thread, including
/// from inside the [`ClientHandler`] callbacks. `connect_to`, `subscribe`,
/// `unsubscribe`, `auth` and `disconnect` belong on the event-loop thread,
/// or before that thread starts.
///
/// Cloning is cheap and every clone drives the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a new mqtt client.
    ///
    /// No packet is sent to the server before calling [`Client::connect_to`].
    ///
    /// `storage` keeps unacknowledged `QoS` packets for retransmission on
    /// reconnect; pass `None` to get a ring buffer sized
    /// `2 * max_packet_size * max_unacked_packets`.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn new(
        client_id: &str,
        handler: Arc<dyn ClientHandler>,
        storage: Option<Box<dyn PacketStorage>>,
        tls: TlsOptions,
    ) -> Result<Self, Error> {
        codec::utils::validate_client_id(client_id)
            .map_err(|err| Error::from_string(ErrorKind::BadParameter, format!("{:?}", err)))?;
        let max_packet_size = handler.max_packet_size();
        Ok(Self {
            inner: Arc::new(ClientInner {
                handler,
                tls,
                max_packet_size,
                default_timeout: Mutex::new(DEFAULT_TIMEOUT),
                client_id: Mutex::new(client_id.to_string()),
                status: Mutex::new(ClientStatus::Disconnected),
                stream: Mutex::new(None),
                tx: Mutex::new(TxState {
                    inflight: InFlightTable::new(0),
                    storage,
                    send_order: Vec::new(),
                    keep_alive: Duration::from_secs(60),
                    last_write: Instant::now(),
                    ping_sent: None,
                }),
                reader: Mutex::new(()),
                teardown: AtomicBool::new(false),
                teardown_reason: Mutex::new(ReasonCode::UnspecifiedError),
                limits: Mutex::new(ServerLimits::default()),
            }),
        })
    }

    /// Replace the client id used for the next connect. This is how a
    /// broker-assigned id from a previous session is carried over.
    pub fn set_client_id(&self, client_id: &str) -> Result<(), Error> {
        codec::utils::validate_client_id(client_id)
            .map_err(|err| Error::from_string(ErrorKind::BadParameter, format!("{:?}", err)))?;
        *self.lock(&self.inner.client_id) = client_id.to_string();
        Ok(())
    }

    /// Get the current client id; after a connect with an empty id this is
    /// the server-assigned identifier.
    #[must_use]
    pub fn client_id(&self) -> String {
        self.lock(&self.inner.client_id).clone()
    }

    /// Set the default network timeout used by every transport read and
    /// write of this client.
    pub fn set_default_timeout(&self, timeout: Duration) {
        *self.lock(&self.inner.default_timeout) = timeout;
    }

    /// Get current connection status.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        *self.lock(&self.inner.status)
    }

    /// Number of concurrent `QoS` 1/2 publications the server accepts, as
    /// advertised in CONNACK.
    #[must_use]
    pub fn server_receive_maximum(&self) -> u16 {
        self.lock(&self.inner.limits).receive_maximum
    }

    /// Highest topic alias the server accepts, as advertised in CONNACK.
    #[must_use]
    pub fn server_topic_alias_maximum(&self) -> u16 {
        self.lock(&self.inner.limits).topic_alias_maximum
    }

    /// Session expiry interval granted by the server in seconds, as
    /// advertised in CONNACK.
    #[must_use]
    pub fn session_expiry_interval(&self) -> u32 {
        self.lock(&self.inner.limits).session_expiry_interval
    }

    fn default_timeout(&self) -> Duration {
        *self.lock(&self.inner.default_timeout)
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        // A poisoned lock means another thread panicked inside the client;
        // the state it guards is plain data, keep going.
        mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn current_stream(&self) -> Result<Arc<Stream>, Error> {
        self.lock(&self.inner.stream)
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "No transport is bound"))
    }

    /// Record that the transport has to be torn down by the next
    /// `event_loop` call. Writers never close the stream themselves,
    /// another thread might be inside a `publish`.
    fn mark_teardown(&self, reason: ReasonCode) {
        *self.lock(&self.inner.teardown_reason) = reason;
        self.inner.teardown.store(true, Ordering::Release);
    }

    /// Close the transport and notify the embedder. Only called from the
    /// event-loop thread (or the failing synchronous exchanges which own
    /// the reader).
    fn teardown_now(&self, reason: ReasonCode) {
        if let Some(stream) = self.lock(&self.inner.stream).take() {
            stream.close();
        }
        *self.lock(&self.inner.status) = ClientStatus::Disconnected;
        self.inner.teardown.store(false, Ordering::Release);
        {
            let mut tx = self.lock(&self.inner.tx);
            tx.ping_sent = None;
        }
        log::info!("client: Connection lost: {:?}", reason);
        self.inner.handler.connection_lost(reason);
    }

    /// Write one encoded packet. The tx lock serializes writers so packet
    /// bytes never interleave on the wire.
    fn send_bytes(&self, stream: &Stream, bytes: &[u8]) -> Result<(), Error> {
        let timeout = self.default_timeout();
        let mut tx = self.lock(&self.inner.tx);
        Self::send_locked(&mut tx, stream, bytes, timeout)
    }

    fn send_locked(
        tx: &mut TxState,
        stream: &Stream,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<(), Error> {
        stream.send(bytes, timeout)?;
        tx.last_write = Instant::now();
        Ok(())
    }

    /// Connect to the server described in `options`.
    ///
    /// Blocks for the whole CONNECT/CONNACK exchange, including any
    /// authentication continuation. On success with clean-start false, the
    /// stored `QoS` packets are retransmitted before this returns.
    ///
    /// # Errors
    ///
    /// `AlreadyConnected` if a session exists; `TimedOut`, `NetworkError`
    /// or the server reason code if the exchange fails.
    pub fn connect_to(&self, options: &ConnectOptions) -> Result<(), Error> {
        {
            let mut status = self.lock(&self.inner.status);
            if *status != ClientStatus::Disconnected {
                return Err(Error::new(
                    ErrorKind::AlreadyConnected,
                    "Already connected to a server",
                ));
            }
            *status = ClientStatus::Connecting;
        }

        match self.connect_exchange(options) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(stream) = self.lock(&self.inner.stream).take() {
                    stream.close();
                }
                *self.lock(&self.inner.status) = ClientStatus::Disconnected;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn connect_exchange(&self, options: &ConnectOptions) -> Result<(), Error> {
        if let Err(property_type) =
            check_property_type_list(options.properties().props(), CONNECT_PROPERTIES)
        {
            return Err(Error::from_string(
                ErrorKind::BadProperties,
                format!("Property {:?} not allowed in CONNECT", property_type),
            ));
        }

        let _reader = self.lock(&self.inner.reader);
        self.inner.teardown.store(false, Ordering::Release);

        let stream = Stream::connect(
            options.host(),
            options.port(),
            options.use_tls(),
            &self.inner.tls,
            options.connect_timeout(),
        )?;
        let stream = Arc::new(stream);
        *self.lock(&self.inner.stream) = Some(Arc::clone(&stream));

        let max_unacked = self.inner.handler.max_unacked_packets().max(1) as usize;

        // Size the delivery engine and drop stale session state. Resizing
        // keeps pending exchanges so their retransmissions still match the
        // acknowledgements arriving on the new transport.
        {
            let mut tx = self.lock(&self.inner.tx);
            if tx.inflight.capacity() != max_unacked {
                tx.inflight.resize(max_unacked);
            }
            if options.clean_start() {
                let ids = tx.inflight.outbound_ids();
                tx.inflight.clear();
                if let Some(storage) = tx.storage.as_mut() {
                    for id in ids {
                        storage.release(id);
                    }
                }
                tx.send_order.clear();
            }
            if tx.storage.is_none() {
                let capacity = 2 * self.inner.max_packet_size as usize * max_unacked;
                tx.storage = Some(Box::new(RingBufferStorage::new(
                    capacity,
                    2 * max_unacked,
                )));
            }
            tx.keep_alive = options.keep_alive();
            tx.ping_sent = None;
        }

        let packet = self.build_connect_packet(options, max_unacked)?;
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.send_bytes(&stream, &buf)?;

        // Await CONNACK, handling any authentication exchange in between.
        let deadline = Instant::now() + options.connect_timeout();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::new(ErrorKind::TimedOut, "No CONNACK from server"));
            }
            let Some(bytes) = self.read_packet(&stream, deadline - now)? else {
                continue;
            };
            let mut ba = ByteArray::new(&bytes);
            let packet = MqttPacket::decode(&mut ba)?;
            match packet {
                MqttPacket::ConnectAck(ack) => match ack.reason_code() {
                    ReasonCode::Success => {
                        self.record_server_limits(&ack);
                        // Publishers check the status and then take the tx
                        // lock; flipping to Connected while the replay still
                        // holds tx guarantees the stored packets are the
                        // first bytes on the new transport.
                        {
                            let mut tx = self.lock(&self.inner.tx);
                            if !options.clean_start() {
                                self.replay_stored(&mut tx, &stream)?;
                            }
                            *self.lock(&self.inner.status) = ClientStatus::Connected;
                        }
                        log::info!("client: Connected to {}:{}", options.host(), options.port());
                        return Ok(());
                    }
                    #[cfg(feature = "auth")]
                    ReasonCode::ContinueAuthentication => {
                        *self.lock(&self.inner.status) = ClientStatus::Authenticating;
                        let method = auth_method(ack.properties());
                        let data = auth_data(ack.properties());
                        if !self.inner.handler.auth_received(
                            ReasonCode::ContinueAuthentication,
                            &method,
                            &data,
                            ack.properties(),
                        ) {
                            return Err(Error::from(ReasonCode::NotAuthorized));
                        }
                    }
                    code => {
                        log::error!("client: CONNACK failed: {:?}", code);
                        return Err(Error::from(code));
                    }
                },
                #[cfg(feature = "auth")]
                MqttPacket::Auth(auth) => {
                    *self.lock(&self.inner.status) = ClientStatus::Authenticating;
                    let method = auth_method(auth.properties());
                    let data = auth_data(auth.properties());
                    if !self.inner.handler.auth_received(
                        auth.reason_code(),
                        &method,
                        &data,
                        auth.properties(),
                    ) {
                        let mut buf = Vec::new();
                        let _ret = DisconnectPacket::new(ReasonCode::NotAuthorized)
                            .encode(&mut buf)
                            .map(|_len| self.send_bytes(&stream, &buf));
                        return Err(Error::from(ReasonCode::NotAuthorized));
                    }
                }
                other => {
                    log::error!(
                        "client: Unexpected packet {:?} while connecting",
                        other.packet_type()
                    );
                    return Err(Error::new(
                        ErrorKind::NetworkError,
                        "Unexpected packet before CONNACK",
                    ));
                }
            }
        }
    }

    fn build_connect_packet(
        &self,
        options: &ConnectOptions,
        max_unacked: usize,
    ) -> Result<ConnectPacket, Error> {
        let client_id = self.client_id();
        let mut packet = ConnectPacket::new(&client_id)?;
        #[allow(clippy::cast_possible_truncation)]
        let keep_alive_sec = options.keep_alive().as_secs().min(u64::from(u16::MAX)) as u16;
        packet.set_keep_alive(keep_alive_sec);
        packet.set_clean_start(options.clean_start());
        packet.set_username(options.username())?;
        packet.set_password(options.password())?;
        if let Some(will) = options.will() {
            packet.set_will(will.topic(), will.message(), will.qos(), will.retain())?;
            for property in will.properties().props() {
                packet.will_properties_mut().push(property.clone());
            }
        }

        for property in options.properties().props() {
            packet.properties_mut().push(property.clone());
        }
        // Advertise the limits of this client unless the caller chose
        // their own.
        if options.properties().find(PropertyType::ReceiveMaximum).is_none() {
            #[allow(clippy::cast_possible_truncation)]
            let receive_maximum = max_unacked.min(usize::from(u16::MAX)) as u16;
            packet
                .properties_mut()
                .push(Property::ReceiveMaximum(U16Data::new(receive_maximum)));
        }
        if options
            .properties()
            .find(PropertyType::MaximumPacketSize)
            .is_none()
        {
            packet
                .properties_mut()
                .push(Property::MaximumPacketSize(U32Data::new(
                    self.inner.max_packet_size,
                )));
        }
        Ok(packet)
    }

    fn record_server_limits(&self, ack: &codec::ConnectAckPacket) {
        let mut limits = ServerLimits::default();
        let mut tx = self.lock(&self.inner.tx);
        for property in ack.properties().props() {
            match property {
                Property::ReceiveMaximum(max) => limits.receive_maximum = max.value(),
                Property::MaximumPacketSize(max) => {
                    limits.maximum_packet_size = Some(max.value());
                }
                Property::TopicAliasMaximum(max) => limits.topic_alias_maximum = max.value(),
                Property::SessionExpiryInterval(interval) => {
                    limits.session_expiry_interval = interval.value();
                }
                Property::MaximumQoS(qos) => limits.maximum_qos = *qos,
                Property::ServerKeepAlive(keep_alive) => {
                    tx.keep_alive = Duration::from_secs(u64::from(keep_alive.value()));
                }
                Property::AssignedClientIdentifier(client_id) => {
                    *self.lock(&self.inner.client_id) = client_id.as_ref().to_string();
                }
                _ => {}
            }
        }
        drop(tx);
        *self.lock(&self.inner.limits) = limits;
    }

    /// Retransmit every stored packet, in save-order, before any new
    /// traffic. Stored PUBLISH packets go out with the DUP flag set;
    /// stored PUBREL packets are replayed as is. The caller holds the tx
    /// lock for the whole replay.
    fn replay_stored(&self, tx: &mut TxState, stream: &Stream) -> Result<(), Error> {
        let timeout = self.default_timeout();
        let order = tx.send_order.clone();
        for packet_id in order {
            let Some(storage) = tx.storage.as_ref() else {
                break;
            };
            let Some((head, tail)) = storage.load(packet_id) else {
                log::warn!(
                    "client: Storage lost packet {}, skipping retransmission",
                    packet_id
                );
                continue;
            };
            let mut first = head[0];
            if first >> 4 == 3 {
                // PUBLISH retransmission carries the DUP flag.
                first |= 0b0000_1000;
            }
            stream.send(&[first], timeout)?;
            stream.send(&head[1..], timeout)?;
            if !tail.is_empty() {
                stream.send(tail, timeout)?;
            }
            log::info!("client: Retransmitted packet {}", packet_id);
        }
        tx.last_write = Instant::now();
        Ok(())
    }

    /// Publish `payload` on `topic`.
    ///
    /// Callable from any thread, including from inside `message_received`.
    /// `packet_id` forces an identifier for `QoS` 1/2 packets; leave 0 for
    /// automatic selection.
    ///
    /// On a transport error the socket is not closed here, another thread
    /// might be publishing at the same time. The next `event_loop` call
    /// closes it and invokes `connection_lost`.
    ///
    /// # Errors
    ///
    /// `TransientPacket` when every in-flight slot is taken,
    /// `WaitingForResult` when no packet identifier is free,
    /// `StorageError` when the packet cannot be stored, and
    /// `NotConnected`/`NetworkError`/`BadParameter`/`BadProperties` as
    /// usual.
    pub fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        retain: bool,
        qos: QoS,
        packet_id: u16,
        properties: Properties,
    ) -> Result<(), Error> {
        PubTopic::new(topic)?;
        if let Err(property_type) = check_property_type_list(properties.props(), PUBLISH_PROPERTIES)
        {
            return Err(Error::from_string(
                ErrorKind::BadProperties,
                format!("Property {:?} not allowed in PUBLISH", property_type),
            ));
        }
        if self.status() != ClientStatus::Connected {
            return Err(Error::new(ErrorKind::NotConnected, "Not connected"));
        }
        if qos > self.lock(&self.inner.limits).maximum_qos {
            return Err(Error::new(
                ErrorKind::BadParameter,
                "QoS exceeds server maximum",
            ));
        }
        #[cfg(not(feature = "qos1"))]
        if qos != QoS::AtMostOnce {
            return Err(Error::new(ErrorKind::BadParameter, "QoS 1 support is not built in"));
        }
        #[cfg(not(feature = "qos2"))]
        if qos == QoS::ExactOnce {
            return Err(Error::new(ErrorKind::BadParameter, "QoS 2 support is not built in"));
        }

        let mut packet = PublishPacket::new(topic, qos, payload)?;
        packet.set_retain(retain);

        let stream = self.current_stream()?;
        let timeout = self.default_timeout();

        if qos == QoS::AtMostOnce {
            let mut buf = Vec::new();
            packet.encode(&mut buf)?;
            self.check_outbound_size(buf.len())?;
            let mut tx = self.lock(&self.inner.tx);
            return self.send_or_flag(&mut tx, &stream, &buf, timeout);
        }

        #[cfg(feature = "qos1")]
        {
            let mut tx = self.lock(&self.inner.tx);

            let has_slot = match qos {
                QoS::AtLeastOnce => tx.inflight.has_free_qos1(),
                _ => tx.inflight.has_free_qos2(),
            };
            if !has_slot {
                return Err(Error::new(
                    ErrorKind::TransientPacket,
                    "All in-flight slots are taken",
                ));
            }

            let packet_id = if packet_id == 0 {
                tx.inflight.alloc_packet_id().ok_or_else(|| {
                    Error::new(ErrorKind::WaitingForResult, "No free packet identifier")
                })?
            } else {
                let forced = PacketId::new(packet_id);
                if tx.inflight.is_in_use(forced) {
                    return Err(Error::new(
                        ErrorKind::BadParameter,
                        "Packet identifier is in use",
                    ));
                }
                forced
            };
            packet.set_packet_id(packet_id);

            let mut buf = Vec::new();
            packet.encode(&mut buf)?;
            self.check_outbound_size(buf.len())?;

            if let Some(storage) = tx.storage.as_mut() {
                storage.save(packet_id, &buf)?;
            }
            match qos {
                QoS::AtLeastOnce => tx.inflight.begin_qos1(packet_id),
                _ => tx.inflight.begin_qos2(packet_id),
            }
            tx.send_order.push(packet_id);

            return self.send_or_flag(&mut tx, &stream, &buf, timeout);
        }
        #[cfg(not(feature = "qos1"))]
        {
            // QoS above the built-in support level was rejected above.
            unreachable!()
        }
    }

    fn check_outbound_size(&self, len: usize) -> Result<(), Error> {
        if let Some(max) = self.lock(&self.inner.limits).maximum_packet_size {
            if len > max as usize {
                return Err(Error::new(
                    ErrorKind::BadParameter,
                    "Packet exceeds server maximum packet size",
                ));
            }
        }
        Ok(())
    }

    /// Send while holding the tx lock; on failure flag the connection for
    /// teardown instead of closing it.
    fn send_or_flag(
        &self,
        tx: &mut TxState,
        stream: &Stream,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<(), Error> {
        match Self::send_locked(tx, stream, bytes, timeout) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::error!("client: Send failed: {}", err);
                self.mark_teardown(ReasonCode::UnspecifiedError);
                Err(err)
            }
        }
    }

    /// Subscribe to a topic filter and block until the server acknowledges
    /// it. Returns the granted `QoS`.
    ///
    /// This client sends one topic filter per SUBSCRIBE packet; call the
    /// method multiple times instead of batching.
    ///
    /// Expected on the event-loop thread, or before that thread starts.
    ///
    /// # Errors
    ///
    /// The server reason code if the subscription is rejected.
    pub fn subscribe(&self, topic: SubscribeTopic, properties: Properties) -> Result<QoS, Error> {
        if let Err(property_type) =
            check_property_type_list(properties.props(), SUBSCRIBE_PROPERTIES)
        {
            return Err(Error::from_string(
                ErrorKind::BadProperties,
                format!("Property {:?} not allowed in SUBSCRIBE", property_type),
            ));
        }
        if self.status() != ClientStatus::Connected {
            return Err(Error::new(ErrorKind::NotConnected, "Not connected"));
        }

        let stream = self.current_stream()?;
        let reader = self.lock(&self.inner.reader);

        let packet_id = {
            let mut tx = self.lock(&self.inner.tx);
            let packet_id = tx.inflight.alloc_packet_id().ok_or_else(|| {
                Error::new(ErrorKind::WaitingForResult, "No free packet identifier")
            })?;
            tx.inflight.reserve_control(packet_id);
            packet_id
        };

        let result = self.subscribe_exchange(&stream, packet_id, topic, properties);

        let mut tx = self.lock(&self.inner.tx);
        tx.inflight.release_control(packet_id);
        drop(tx);
        drop(reader);
        result
    }

    fn subscribe_exchange(
        &self,
        stream: &Arc<Stream>,
        packet_id: PacketId,
        topic: SubscribeTopic,
        properties: Properties,
    ) -> Result<QoS, Error> {
        let mut packet = SubscribePacket::with_topics(packet_id, vec![topic])?;
        for property in properties.props() {
            packet.properties_mut().push(property.clone());
        }
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.send_bytes(stream, &buf)?;

        let deadline = Instant::now() + self.default_timeout();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::new(ErrorKind::TimedOut, "No SUBACK from server"));
            }
            let Some(bytes) = self.read_packet(stream, deadline - now)? else {
                continue;
            };
            let mut ba = ByteArray::new(&bytes);
            let response = MqttPacket::decode(&mut ba)?;
            match response {
                MqttPacket::SubscribeAck(ack) if ack.packet_id() == packet_id => {
                    let reason = ack.reasons().first().copied().unwrap_or_default();
                    return match reason {
                        ReasonCode::Success => Ok(QoS::AtMostOnce),
                        ReasonCode::GrantedQoS1 => Ok(QoS::AtLeastOnce),
                        ReasonCode::GrantedQoS2 => Ok(QoS::ExactOnce),
                        code => Err(Error::from(code)),
                    };
                }
                other => self.handle_packet(stream, other)?,
            }
        }
    }

    /// Unsubscribe from a topic filter and block until the server
    /// acknowledges it.
    ///
    /// Expected on the event-loop thread, or before that thread starts.
    ///
    /// # Errors
    ///
    /// The server reason code if the request is rejected.
    #[cfg(feature = "unsubscribe")]
    pub fn unsubscribe(&self, topic: &str, properties: Properties) -> Result<(), Error> {
        if let Err(property_type) =
            check_property_type_list(properties.props(), UNSUBSCRIBE_PROPERTIES)
        {
            return Err(Error::from_string(
                ErrorKind::BadProperties,
                format!("Property {:?} not allowed in UNSUBSCRIBE", property_type),
            ));
        }
        if self.status() != ClientStatus::Connected {
            return Err(Error::new(ErrorKind::NotConnected, "Not connected"));
        }

        let stream = self.current_stream()?;
        let reader = self.lock(&self.inner.reader);

        let packet_id = {
            let mut tx = self.lock(&self.inner.tx);
            let packet_id = tx.inflight.alloc_packet_id().ok_or_else(|| {
                Error::new(ErrorKind::WaitingForResult, "No free packet identifier")
            })?;
            tx.inflight.reserve_control(packet_id);
            packet_id
        };

        let result = self.unsubscribe_exchange(&stream, packet_id, topic, properties);

        let mut tx = self.lock(&self.inner.tx);
        tx.inflight.release_control(packet_id);
        drop(tx);
        drop(reader);
        result
    }

    #[cfg(feature = "unsubscribe")]
    fn unsubscribe_exchange(
        &self,
        stream: &Arc<Stream>,
        packet_id: PacketId,
        topic: &str,
        properties: Properties,
    ) -> Result<(), Error> {
        let mut packet = UnsubscribePacket::new(topic, packet_id)?;
        for property in properties.props() {
            packet.properties_mut().push(property.clone());
        }
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.send_bytes(stream, &buf)?;

        let deadline = Instant::now() + self.default_timeout();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::new(ErrorKind::TimedOut, "No UNSUBACK from server"));
            }
            let Some(bytes) = self.read_packet(stream, deadline - now)? else {
                continue;
            };
            let mut ba = ByteArray::new(&bytes);
            let response = MqttPacket::decode(&mut ba)?;
            match response {
                MqttPacket::UnsubscribeAck(ack) if ack.packet_id() == packet_id => {
                    let reason = ack.reasons().first().copied().unwrap_or_default();
                    return match reason {
                        ReasonCode::Success | ReasonCode::NoSubscriptionExisted => Ok(()),
                        code => Err(Error::from(code)),
                    };
                }
                other => self.handle_packet(stream, other)?,
            }
        }
    }

    /// Send an AUTH packet to continue or restart an authentication
    /// exchange.
    ///
    /// Safe to call from inside the `auth_received` callback.
    ///
    /// # Errors
    ///
    /// `BadParameter` if `reason` is not an authentication reason code.
    #[cfg(feature = "auth")]
    pub fn auth(
        &self,
        reason: ReasonCode,
        method: &str,
        data: &[u8],
        properties: Properties,
    ) -> Result<(), Error> {
        if !AUTH_REASONS.contains(&reason) {
            return Err(Error::new(
                ErrorKind::BadParameter,
                "Not an authentication reason code",
            ));
        }
        if let Err(property_type) = check_property_type_list(properties.props(), AUTH_PROPERTIES) {
            return Err(Error::from_string(
                ErrorKind::BadProperties,
                format!("Property {:?} not allowed in AUTH", property_type),
            ));
        }
        if self.status() == ClientStatus::Disconnected {
            return Err(Error::new(ErrorKind::NotConnected, "Not connected"));
        }

        let mut packet = AuthPacket::new();
        packet.set_reason_code(reason);
        if !method.is_empty() {
            packet.properties_mut().push(Property::AuthenticationMethod(
                StringData::from(method)
                    .map_err(|_e| Error::new(ErrorKind::BadParameter, "Invalid auth method"))?,
            ));
        }
        if !data.is_empty() {
            packet.properties_mut().push(Property::AuthenticationData(
                BinaryData::from_slice(data)?,
            ));
        }
        for property in properties.props() {
            packet.properties_mut().push(property.clone());
        }

        let stream = self.current_stream()?;
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.send_bytes(&stream, &buf)
    }

    /// Disconnect from the server.
    ///
    /// Expected on the event-loop thread, or before that thread starts.
    /// Stored `QoS` packets are kept; a later connect with clean-start
    /// false retransmits them.
    ///
    /// # Errors
    ///
    /// `NotConnected` if no session exists.
    pub fn disconnect(&self, reason: ReasonCode, properties: Properties) -> Result<(), Error> {
        if let Err(property_type) =
            check_property_type_list(properties.props(), DISCONNECT_PROPERTIES)
        {
            return Err(Error::from_string(
                ErrorKind::BadProperties,
                format!("Property {:?} not allowed in DISCONNECT", property_type),
            ));
        }
        if self.status() != ClientStatus::Connected {
            return Err(Error::new(ErrorKind::NotConnected, "Not connected"));
        }
        let stream = self.current_stream()?;

        let mut packet = DisconnectPacket::new(reason);
        for property in properties.props() {
            packet.properties_mut().push(property.clone());
        }
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        let result = self.send_bytes(&stream, &buf);

        if let Some(stream) = self.lock(&self.inner.stream).take() {
            stream.close();
        }
        *self.lock(&self.inner.status) = ClientStatus::Disconnected;
        {
            let mut tx = self.lock(&self.inner.tx);
            tx.ping_sent = None;
        }
        result
    }

    /// Drive the client: read the next control packet, keep the connection
    /// alive, dispatch callbacks.
    ///
    /// Call this regularly from one dedicated thread. Blocks up to the
    /// default timeout waiting for bytes; an idle wakeup returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// `NotConnected` when no session exists; `NetworkError`, `TimedOut` or
    /// a server reason code when the connection is torn down, in which case
    /// `connection_lost` has been invoked and `connect_to` may be called
    /// again.
    pub fn event_loop(&self) -> Result<(), Error> {
        let _reader = self.lock(&self.inner.reader);

        // A failed publish left the transport in an unknown state; tear it
        // down now that no writer can be inside it.
        if self.inner.teardown.load(Ordering::Acquire) {
            let reason = *self.lock(&self.inner.teardown_reason);
            self.teardown_now(reason);
            return Err(Error::new(
                ErrorKind::NetworkError,
                "Connection torn down after failed write",
            ));
        }

        if self.status() == ClientStatus::Disconnected {
            return Err(Error::new(ErrorKind::NotConnected, "Not connected"));
        }
        let stream = self.current_stream()?;

        let mut timeout = self.default_timeout();
        {
            let mut tx = self.lock(&self.inner.tx);
            let keep_alive = tx.keep_alive;
            if !keep_alive.is_zero() {
                if let Some(sent) = tx.ping_sent {
                    if sent.elapsed() >= keep_alive {
                        drop(tx);
                        self.teardown_now(ReasonCode::KeepAliveTimeout);
                        return Err(Error::new(
                            ErrorKind::TimedOut,
                            "No PINGRESP within keep-alive",
                        ));
                    }
                    timeout = timeout.min(keep_alive.saturating_sub(sent.elapsed()));
                } else {
                    let half = keep_alive / 2;
                    if tx.last_write.elapsed() >= half {
                        let mut buf = Vec::new();
                        PingRequestPacket::new().encode(&mut buf)?;
                        if let Err(err) = Self::send_locked(&mut tx, &stream, &buf, timeout) {
                            drop(tx);
                            self.teardown_now(ReasonCode::UnspecifiedError);
                            return Err(err);
                        }
                        tx.ping_sent = Some(Instant::now());
                        log::debug!("client: Sent PINGREQ");
                        timeout = timeout.min(keep_alive);
                    } else {
                        timeout = timeout.min(half.saturating_sub(tx.last_write.elapsed()));
                    }
                }
            }
        }

        match self.read_packet(&stream, timeout.max(Duration::from_millis(1))) {
            Ok(None) => Ok(()),
            Ok(Some(bytes)) => {
                let mut ba = ByteArray::new(&bytes);
                match MqttPacket::decode(&mut ba) {
                    Ok(packet) => self.handle_packet(&stream, packet),
                    Err(err) => {
                        log::error!("client: Malformed inbound packet: {:?}", err);
                        self.teardown_now(ReasonCode::MalformedPacket);
                        Err(Error::from(err))
                    }
                }
            }
            Err(err) => {
                self.teardown_now(ReasonCode::UnspecifiedError);
                Err(err)
            }
        }
    }

    /// Read one complete control packet. Returns `Ok(None)` when the first
    /// byte did not arrive in time; a timeout in the middle of a packet is
    /// a transport error.
    fn read_packet(&self, stream: &Stream, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        let mut byte = [0_u8; 1];
        match stream.recv(&mut byte, timeout) {
            Ok(0) => {
                return Err(Error::new(
                    ErrorKind::NetworkError,
                    "Connection closed by peer",
                ));
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::TimedOut => return Ok(None),
            Err(err) => return Err(err),
        }

        let mut packet = vec![byte[0]];
        let body_timeout = self.default_timeout();

        // Remaining length, one to four bytes.
        let mut remaining: usize = 0;
        let mut multiplier: usize = 1;
        loop {
            self.read_full(stream, &mut byte, body_timeout)?;
            packet.push(byte[0]);
            remaining += usize::from(byte[0] & 127) * multiplier;
            if byte[0] & 128 == 0 {
                break;
            }
            multiplier *= 128;
            if multiplier > 128 * 128 * 128 {
                return Err(Error::new(
                    ErrorKind::NetworkError,
                    "Malformed remaining length",
                ));
            }
        }

        if remaining > self.inner.max_packet_size as usize {
            log::error!(
                "client: Inbound packet of {} bytes exceeds maximum of {}",
                remaining,
                self.inner.max_packet_size
            );
            return Err(Error::new(ErrorKind::NetworkError, "Packet too large"));
        }

        let header_len = packet.len();
        packet.resize(header_len + remaining, 0);
        self.read_full(stream, &mut packet[header_len..], body_timeout)?;
        Ok(Some(packet))
    }

    fn read_full(&self, stream: &Stream, buf: &mut [u8], timeout: Duration) -> Result<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            match stream.recv(&mut buf[filled..], timeout) {
                Ok(0) => {
                    return Err(Error::new(
                        ErrorKind::NetworkError,
                        "Connection closed by peer",
                    ));
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::TimedOut => {
                    return Err(Error::new(ErrorKind::NetworkError, "Truncated packet"));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Dispatch one inbound packet to the QoS engine, the state machine and
    /// the embedder callbacks. Callbacks run with no client lock held.
    #[allow(clippy::too_many_lines)]
    fn handle_packet(&self, stream: &Arc<Stream>, packet: MqttPacket) -> Result<(), Error> {
        let timeout = self.default_timeout();
        match packet {
            MqttPacket::Publish(publish) => self.handle_inbound_publish(stream, &publish),
            #[cfg(feature = "qos1")]
            MqttPacket::PublishAck(ack) => {
                let packet_id = ack.packet_id();
                let mut tx = self.lock(&self.inner.tx);
                if tx.inflight.acknowledge_qos1(packet_id) {
                    if let Some(storage) = tx.storage.as_mut() {
                        storage.release(packet_id);
                    }
                    tx.send_order.retain(|id| *id != packet_id);
                    log::debug!("client: PUBACK for {}", packet_id);
                } else {
                    log::warn!("client: PUBACK for unknown packet {}", packet_id);
                }
                Ok(())
            }
            #[cfg(feature = "qos2")]
            MqttPacket::PublishReceived(received) => {
                let packet_id = received.packet_id();
                let mut tx = self.lock(&self.inner.tx);
                if !tx.inflight.receive_qos2(packet_id) {
                    log::warn!("client: PUBREC for unknown packet {}", packet_id);
                    return Ok(());
                }
                if received.reason_code().is_error() {
                    // The server rejected the publish; the exchange ends
                    // here.
                    tx.inflight.complete_qos2(packet_id);
                    if let Some(storage) = tx.storage.as_mut() {
                        storage.release(packet_id);
                    }
                    tx.send_order.retain(|id| *id != packet_id);
                    return Ok(());
                }

                let mut buf = Vec::new();
                PublishReleasePacket::new(packet_id).encode(&mut buf)?;
                // Replace the stored body so a reconnect replays PUBREL
                // instead of the original PUBLISH.
                if let Some(storage) = tx.storage.as_mut() {
                    storage.release(packet_id);
                    if let Err(err) = storage.save(packet_id, &buf) {
                        log::warn!("client: Failed to store PUBREL: {}", err);
                        tx.send_order.retain(|id| *id != packet_id);
                    }
                }
                self.send_or_flag(&mut tx, stream, &buf, timeout)
            }
            #[cfg(feature = "qos2")]
            MqttPacket::PublishComplete(complete) => {
                let packet_id = complete.packet_id();
                let mut tx = self.lock(&self.inner.tx);
                if tx.inflight.complete_qos2(packet_id) {
                    if let Some(storage) = tx.storage.as_mut() {
                        storage.release(packet_id);
                    }
                    tx.send_order.retain(|id| *id != packet_id);
                    log::debug!("client: PUBCOMP for {}", packet_id);
                } else {
                    log::warn!("client: PUBCOMP for unknown packet {}", packet_id);
                }
                Ok(())
            }
            #[cfg(feature = "qos2")]
            MqttPacket::PublishRelease(release) => {
                let packet_id = release.packet_id();
                let known = {
                    let mut tx = self.lock(&self.inner.tx);
                    tx.inflight.release_inbound_qos2(packet_id)
                };
                let mut complete = PublishCompletePacket::new(packet_id);
                if known.is_none() {
                    complete.set_reason_code(ReasonCode::PacketIdentifierNotFound);
                }
                let mut buf = Vec::new();
                complete.encode(&mut buf)?;
                let mut tx = self.lock(&self.inner.tx);
                self.send_or_flag(&mut tx, stream, &buf, timeout)
            }
            MqttPacket::PingResponse(_) => {
                let mut tx = self.lock(&self.inner.tx);
                tx.ping_sent = None;
                log::debug!("client: Got PINGRESP");
                Ok(())
            }
            MqttPacket::Disconnect(disconnect) => {
                let reason = disconnect.reason_code();
                log::info!("client: Server disconnected: {:?}", reason);
                self.teardown_now(reason);
                Err(Error::from(reason))
            }
            #[cfg(feature = "auth")]
            MqttPacket::Auth(auth) => self.handle_inbound_auth(stream, &auth),
            MqttPacket::SubscribeAck(ack) => {
                log::warn!("client: Unawaited SUBACK for {}", ack.packet_id());
                Ok(())
            }
            MqttPacket::UnsubscribeAck(ack) => {
                log::warn!("client: Unawaited UNSUBACK for {}", ack.packet_id());
                Ok(())
            }
            MqttPacket::ConnectAck(_) => {
                log::warn!("client: Unawaited CONNACK");
                Ok(())
            }
            other => {
                log::error!(
                    "client: Protocol violation, got {:?} from server",
                    other.packet_type()
                );
                self.teardown_now(ReasonCode::ProtocolError);
                Err(Error::new(
                    ErrorKind::NetworkError,
                    "Unexpected packet from server",
                ))
            }
        }
    }

    fn handle_inbound_publish(
        &self,
        stream: &Arc<Stream>,
        publish: &PublishPacket,
    ) -> Result<(), Error> {
        let timeout = self.default_timeout();
        match publish.qos() {
            QoS::AtMostOnce => {
                self.inner.handler.message_received(
                    publish.topic(),
                    publish.message(),
                    publish.packet_id().value(),
                    publish.properties(),
                );
                Ok(())
            }
            #[cfg(feature = "qos1")]
            QoS::AtLeastOnce => {
                self.inner.handler.message_received(
                    publish.topic(),
                    publish.message(),
                    publish.packet_id().value(),
                    publish.properties(),
                );
                let mut buf = Vec::new();
                PublishAckPacket::new(publish.packet_id()).encode(&mut buf)?;
                let mut tx = self.lock(&self.inner.tx);
                self.send_or_flag(&mut tx, stream, &buf, timeout)
            }
            #[cfg(feature = "qos2")]
            QoS::ExactOnce => {
                let packet_id = publish.packet_id();
                let state = {
                    let mut tx = self.lock(&self.inner.tx);
                    tx.inflight.begin_inbound_qos2(packet_id)
                };
                let mut received = PublishReceivedPacket::new(packet_id);
                match state {
                    InboundQos2::New => {
                        self.inner.handler.message_received(
                            publish.topic(),
                            publish.message(),
                            packet_id.value(),
                            publish.properties(),
                        );
                        let mut tx = self.lock(&self.inner.tx);
                        tx.inflight.mark_inbound_delivered(packet_id);
                    }
                    InboundQos2::Duplicate => {
                        log::debug!("client: Duplicate QoS2 publish {}", packet_id);
                    }
                    InboundQos2::NoSlot => {
                        log::warn!("client: No inbound slot for QoS2 publish {}", packet_id);
                        received.set_reason_code(ReasonCode::QuotaExceeded);
                    }
                }
                let mut buf = Vec::new();
                received.encode(&mut buf)?;
                let mut tx = self.lock(&self.inner.tx);
                self.send_or_flag(&mut tx, stream, &buf, timeout)
            }
            #[allow(unreachable_patterns)]
            qos => {
                log::error!("client: QoS {:?} support is not built in", qos);
                self.teardown_now(ReasonCode::QoSNotSupported);
                Err(Error::new(
                    ErrorKind::NetworkError,
                    "Unsupported QoS level received",
                ))
            }
        }
    }

    #[cfg(feature = "auth")]
    fn handle_inbound_auth(
        &self,
        stream: &Arc<Stream>,
        auth: &AuthPacket,
    ) -> Result<(), Error> {
        let reason = auth.reason_code();
        let method = auth_method(auth.properties());
        let data = auth_data(auth.properties());

        if reason == ReasonCode::ContinueAuthentication {
            *self.lock(&self.inner.status) = ClientStatus::Authenticating;
        }

        let accepted =
            self.inner
                .handler
                .auth_received(reason, &method, &data, auth.properties());
        if !accepted {
            let mut buf = Vec::new();
            if DisconnectPacket::new(ReasonCode::NotAuthorized)
                .encode(&mut buf)
                .is_ok()
            {
                let _ret = self.send_bytes(stream, &buf);
            }
            self.teardown_now(ReasonCode::NotAuthorized);
            return Err(Error::from(ReasonCode::NotAuthorized));
        }

        if reason == ReasonCode::Success {
            *self.lock(&self.inner.status) = ClientStatus::Connected;
        }
        Ok(())
    }
}

#[cfg(feature = "auth")]
fn auth_method(properties: &Properties) -> String {
    match properties.find(PropertyType::AuthenticationMethod) {
        Some(Property::AuthenticationMethod(method)) => method.as_ref().to_string(),
        _ => String::new(),
    }
}

#[cfg(feature = "auth")]
fn auth_data(properties: &Properties) -> Vec<u8> {
    match properties.find(PropertyType::AuthenticationData) {
        Some(Property::AuthenticationData(data)) => data.as_ref().to_vec(),
        _ => Vec::new(),
    }
}
