//! Per-endpoint client connection: transport ownership, the application
//! handshake and connected-state fan-out to subscribers.
//!
//! A proxy is created in `Disconnected`; the transport connect and all later
//! state mutations run in reactor context. `Connected` is only entered after
//! the transport connect succeeded, the peer passed the integrity check and
//! the 3-message handshake completed. Errors observed inside IO callbacks
//! are recorded and acted upon from a posted reactor job so a proxy is never
//! torn down on its own callback stack.

use byteorder::{ByteOrder, LittleEndian};
use chassis::ident::{ProvidedServiceInstanceId, UnicastAddress};
use chassis::integrity::{IntegrityLevel, PeerCredentials};
use chassis::logging::{self, Logger};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::io::{IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::config::RuntimeConfig;
use crate::net::handler::{MessageHandler, SendOutcome};
use crate::net::iobuf::GatherQueue;
use crate::net::manager::ConnectionManagerProxy;
use crate::net::packet::PacketShared;
use crate::net::transport::{StreamTransport, TransportConnector};
use crate::reactor::{EventHandler, Reactor};
use crate::route::{self, ProxyRouterConnector};
use crate::shared::{ErrorKind, NetError};

/// First handshake message: protocol version (u16) plus three u64 fields,
/// written as four gather-IO entries.
const CLIENT_HELLO_LENGTH: usize = 26;
const SERVER_HELLO_LENGTH: usize = 8;

/// Process-wide source of shared-memory segment ids offered to the server.
static SHM_ID_SOURCE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Subscriber to the composite connected/disconnected state of one
/// connection, keyed by the provided service instance it serves.
pub trait StateChangeHandler: Send + Sync {
    fn on_connected(&self, router_connector: Weak<ProxyRouterConnector>);

    /// `reason == CommunicationFailure` is the one value after which an
    /// automatic reconnect is legal; every other reason is final.
    fn on_disconnected(&self, reason: ErrorKind);
}

enum HandshakePhase {
    Idle,
    /// Waiting for the non-blocking transport connect to finish.
    TransportConnect,
    /// Writing the 26-byte client hello; `sent` bytes are on the wire.
    ClientHello { sent: usize },
    /// Reading the 8-byte server reply.
    ServerHello { filled: usize },
    /// Writing the one-byte acknowledge.
    ClientAck,
    Complete,
}

struct ProxyInner {
    state: ConnectionState,
    token: Option<mio::Token>,
    transport: Option<Arc<dyn StreamTransport>>,
    handler: Option<MessageHandler>,
    handshake: HandshakePhase,
    hello: [u8; CLIENT_HELLO_LENGTH],
    server_hello: [u8; SERVER_HELLO_LENGTH],
    subscribers: IndexMap<ProvidedServiceInstanceId, Weak<dyn StateChangeHandler>>,
    peer: Option<PeerCredentials>,
    teardown_queued: bool,
}

pub struct ConnectionProxy {
    log: Logger,
    weak_self: Weak<ConnectionProxy>,
    reactor: Arc<Reactor>,
    manager: Weak<ConnectionManagerProxy>,
    transports: Arc<dyn TransportConnector>,
    router_connector: Arc<ProxyRouterConnector>,
    address: UnicastAddress,
    expected_integrity: IntegrityLevel,
    config: RuntimeConfig,
    inner: Mutex<ProxyInner>,
}

impl ConnectionProxy {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        reactor: &Arc<Reactor>,
        manager: Weak<ConnectionManagerProxy>,
        transports: Arc<dyn TransportConnector>,
        router_connector: Arc<ProxyRouterConnector>,
        address: UnicastAddress,
        expected_integrity: IntegrityLevel,
        config: RuntimeConfig,
        log: &Logger,
    ) -> Arc<ConnectionProxy> {
        let log = log.new(logging::o!(
            "component" => "connection_proxy",
            "domain" => address.domain,
            "port" => address.port
        ));

        Arc::new_cyclic(|weak_self| ConnectionProxy {
            log,
            weak_self: weak_self.clone(),
            reactor: reactor.clone(),
            manager,
            transports,
            router_connector,
            address,
            expected_integrity,
            config,
            inner: Mutex::new(ProxyInner {
                state: ConnectionState::Disconnected,
                token: None,
                transport: None,
                handler: None,
                handshake: HandshakePhase::Idle,
                hello: [0; CLIENT_HELLO_LENGTH],
                server_hello: [0; SERVER_HELLO_LENGTH],
                subscribers: IndexMap::new(),
                peer: None,
                teardown_queued: false,
            }),
        })
    }

    #[inline]
    pub fn address(&self) -> UnicastAddress {
        self.address
    }

    #[inline]
    pub fn expected_integrity(&self) -> IntegrityLevel {
        self.expected_integrity
    }

    #[inline]
    pub fn router_connector(&self) -> &Arc<ProxyRouterConnector> {
        &self.router_connector
    }

    pub fn get_state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Credentials of the remote process, available once the transport
    /// reported connected.
    pub fn peer_credentials(&self) -> Option<PeerCredentials> {
        self.inner.lock().peer
    }

    /// Registers a subscriber and starts connecting when necessary. When the
    /// proxy is already connected, the new subscriber's `on_connected` fires
    /// synchronously on the caller's thread.
    pub fn connect(
        &self,
        provided: ProvidedServiceInstanceId,
        subscriber: Weak<dyn StateChangeHandler>,
    ) -> ConnectionState {
        let mut fire_connected = None;
        let state;

        {
            let mut inner = self.inner.lock();
            inner.subscribers.insert(provided, subscriber.clone());

            match inner.state {
                ConnectionState::Disconnected => {
                    inner.state = ConnectionState::Connecting;
                    inner.handshake = HandshakePhase::Idle;

                    if let Some(proxy) = self.weak_self.upgrade() {
                        self.reactor.post(move |_| proxy.start_connect());
                    }
                }
                ConnectionState::Connected => {
                    fire_connected = subscriber.upgrade();
                }
                ConnectionState::Connecting | ConnectionState::Disconnecting => {}
            }

            state = inner.state;
        }

        if let Some(subscriber) = fire_connected {
            subscriber.on_connected(Arc::downgrade(&self.router_connector));
        }

        state
    }

    /// Removes a subscriber; when the last one is gone the transport is torn
    /// down and the proxy schedules its own destruction via the manager.
    pub fn disconnect(&self, provided: ProvidedServiceInstanceId) {
        let mut inner = self.inner.lock();
        inner.subscribers.shift_remove(&provided);

        let active = matches!(
            inner.state,
            ConnectionState::Connecting | ConnectionState::Connected
        );

        if inner.subscribers.is_empty() && active && !inner.teardown_queued {
            logging::debug!(self.log, "last subscriber released, closing connection");
            inner.teardown_queued = true;
            inner.state = ConnectionState::Disconnecting;

            if let Some(proxy) = self.weak_self.upgrade() {
                self.reactor
                    .post(move |_| proxy.finish_teardown(ErrorKind::Disconnected));
            }
        }
    }

    /// Sends one complete packet. Returns synchronously after at most one
    /// vectored write syscall; fatal transport errors are additionally acted
    /// upon through a deferred teardown.
    pub fn send(&self, packet: PacketShared) -> Result<SendOutcome, ErrorKind> {
        let result = {
            let mut inner = self.inner.lock();

            if inner.state != ConnectionState::Connected {
                return Err(ErrorKind::Disconnected);
            }

            match inner.handler.as_mut() {
                Some(handler) => handler.send(packet),
                None => return Err(ErrorKind::Disconnected),
            }
        };

        if let Err(kind) = result {
            if kind != ErrorKind::QueueFull {
                self.defer_error(kind);
            }
        }

        result
    }

    /// Number of live subscribers, used by the pool for reuse decisions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    // ---- Reactor context -------------------------------------------------

    /// First step of connection establishment, runs as a posted job.
    fn start_connect(&self) {
        if let Err(kind) = self.try_start_connect() {
            self.defer_error(kind);
        }
    }

    fn try_start_connect(&self) -> Result<(), ErrorKind> {
        logging::debug!(self.log, "opening transport");

        let transport = self.transports.connect(&self.address).map_err(|err| {
            logging::debug!(self.log, "transport open failed"; "error" => %err);
            ErrorKind::CommunicationFailure
        })?;

        let handler_ref = self.weak_self.clone() as Weak<dyn EventHandler>;
        let token = self
            .reactor
            .register_io(handler_ref, |poll, token| {
                transport.register(
                    poll,
                    token,
                    mio::Ready::readable() | mio::Ready::writable(),
                    mio::PollOpt::edge(),
                )
            })
            .map_err(|err| {
                logging::debug!(self.log, "transport registration failed"; "error" => %err);
                ErrorKind::CommunicationFailure
            })?;

        let mut inner = self.inner.lock();
        inner.handler = Some(MessageHandler::new(transport.clone(), &self.config, &self.log));
        inner.transport = Some(transport);
        inner.token = Some(token);
        inner.handshake = HandshakePhase::TransportConnect;

        Ok(())
    }

    fn defer_error(&self, kind: ErrorKind) {
        {
            let mut inner = self.inner.lock();

            if inner.teardown_queued {
                return;
            }

            inner.teardown_queued = true;
            inner.state = ConnectionState::Disconnecting;
        }

        logging::debug!(self.log, "connection error recorded, teardown deferred";
                        "error" => ?kind);

        if let Some(proxy) = self.weak_self.upgrade() {
            self.reactor.post(move |_| proxy.finish_teardown(kind));
        }
    }

    /// Runs as a posted job with no IO callback frames on the stack: closes
    /// the transport, hands the proxy to the manager's terminated list and
    /// notifies all subscribers with the disconnect reason.
    fn finish_teardown(&self, kind: ErrorKind) {
        let reason = kind.as_disconnect_reason();

        let subscribers: Vec<Arc<dyn StateChangeHandler>> = {
            let mut inner = self.inner.lock();

            if let Some(token) = inner.token.take() {
                if let Some(transport) = inner.transport.as_ref() {
                    let transport = transport.clone();
                    let _ = self
                        .reactor
                        .deregister_io(token, |poll| transport.deregister(poll));
                }
            }

            if let Some(transport) = inner.transport.take() {
                let _ = transport.shutdown();
            }

            inner.handler = None;
            inner.handshake = HandshakePhase::Idle;
            inner.peer = None;

            inner.subscribers.values().filter_map(Weak::upgrade).collect()
        };

        self.router_connector.clear_connection_proxy_if(&self.weak_self);

        logging::debug!(self.log, "connection torn down"; "reason" => ?reason);

        // The manager forgets the proxy before subscribers hear about the
        // disconnect, so a reconnect attempt from a subscriber callback
        // already observes a clean pool.
        if let (Some(manager), Some(me)) = (self.manager.upgrade(), self.weak_self.upgrade()) {
            manager.on_disconnect(&me);
        }

        for subscriber in subscribers {
            subscriber.on_disconnected(reason);
        }
    }

    /// Advances the handshake as far as the transport allows. Returns true
    /// once the connection entered `Connected`.
    fn drive_handshake(
        &self,
        inner: &mut ProxyInner,
        ready: mio::Ready,
        completed: &mut Vec<PacketShared>,
    ) -> Result<bool, ErrorKind> {
        loop {
            match inner.handshake {
                HandshakePhase::Idle | HandshakePhase::Complete => return Ok(false),

                HandshakePhase::TransportConnect => {
                    if !ready.is_writable() {
                        return Ok(false);
                    }

                    let transport = Self::transport(inner);

                    transport.finish_connect().map_err(|err| {
                        logging::debug!(self.log, "transport connect failed"; "error" => %err);
                        ErrorKind::HandshakeFailed
                    })?;

                    let peer = transport
                        .peer_credentials()
                        .map_err(|_| ErrorKind::HandshakeFailed)?;

                    if peer.integrity_level < self.expected_integrity {
                        logging::warn!(self.log, "peer integrity level below expectation";
                                       "actual" => ?peer.integrity_level,
                                       "expected" => ?self.expected_integrity);
                        return Err(ErrorKind::IntegrityLevelTooLow);
                    }

                    inner.peer = Some(peer);

                    let hello = self.encode_client_hello();
                    inner.hello = hello;
                    inner.handshake = HandshakePhase::ClientHello { sent: 0 };
                }

                HandshakePhase::ClientHello { sent } => {
                    let transport = Self::transport(inner);

                    match Self::write_client_hello(&transport, &inner.hello, sent)? {
                        Some(now_sent) if now_sent == CLIENT_HELLO_LENGTH => {
                            logging::trace!(self.log, "client hello sent");
                            inner.handshake = HandshakePhase::ServerHello { filled: 0 };
                        }
                        Some(now_sent) => {
                            inner.handshake = HandshakePhase::ClientHello { sent: now_sent };
                        }
                        None => return Ok(false),
                    }
                }

                HandshakePhase::ServerHello { filled } => {
                    let transport = Self::transport(inner);
                    let buffer = &mut inner.server_hello[filled..];

                    match transport.read_vectored(&mut [IoSliceMut::new(buffer)]) {
                        Ok(0) => return Err(ErrorKind::HandshakeFailed),
                        Ok(count) => {
                            let filled = filled + count;

                            if filled == SERVER_HELLO_LENGTH {
                                let s2c_shm_id = LittleEndian::read_u64(&inner.server_hello);
                                logging::trace!(self.log, "server hello received";
                                                "s2c_shm_id" => s2c_shm_id);
                                inner.handshake = HandshakePhase::ClientAck;
                            } else {
                                inner.handshake = HandshakePhase::ServerHello { filled };
                            }
                        }
                        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            return Ok(false)
                        }
                        Err(_) => return Err(ErrorKind::HandshakeFailed),
                    }
                }

                HandshakePhase::ClientAck => {
                    let transport = Self::transport(inner);

                    match transport.write_vectored(&[IoSlice::new(&[0u8])]) {
                        Ok(1) => {
                            inner.handshake = HandshakePhase::Complete;
                            inner.state = ConnectionState::Connected;

                            let handler = inner
                                .handler
                                .as_mut()
                                .expect("Connecting proxy must have a message handler");
                            handler.reset();

                            if let Err(NetError::Fatal(kind)) = handler.start_reception(completed) {
                                return Err(kind);
                            }
                            if let Err(NetError::Fatal(kind)) = handler.send_queued() {
                                return Err(kind);
                            }

                            return Ok(true);
                        }
                        Ok(_) => return Err(ErrorKind::HandshakeFailed),
                        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            return Ok(false)
                        }
                        Err(_) => return Err(ErrorKind::HandshakeFailed),
                    }
                }
            }
        }
    }

    fn transport(inner: &ProxyInner) -> Arc<dyn StreamTransport> {
        inner
            .transport
            .as_ref()
            .expect("Connecting proxy must have a transport")
            .clone()
    }

    fn encode_client_hello(&self) -> [u8; CLIENT_HELLO_LENGTH] {
        let mut hello = [0u8; CLIENT_HELLO_LENGTH];

        LittleEndian::write_u16(&mut hello[0..2], self.config.handshake_protocol_version);
        LittleEndian::write_u64(&mut hello[2..10], SHM_ID_SOURCE.fetch_add(1, Ordering::Relaxed));
        LittleEndian::write_u64(&mut hello[10..18], SHM_ID_SOURCE.fetch_add(1, Ordering::Relaxed));
        LittleEndian::write_u64(&mut hello[18..26], self.config.s2c_buffer_size_hint);

        hello
    }

    /// Writes the remainder of the client hello with one gather syscall.
    /// `None` means the transport would block.
    fn write_client_hello(
        transport: &Arc<dyn StreamTransport>,
        hello: &[u8; CLIENT_HELLO_LENGTH],
        sent: usize,
    ) -> Result<Option<usize>, ErrorKind> {
        let chunks: [&[u8]; 4] = [&hello[0..2], &hello[2..10], &hello[10..18], &hello[18..26]];
        let mut queue = GatherQueue::new(&chunks);
        queue.consume(sent);

        let mut views = [IoSlice::new(&[]); 4];
        let count = queue.remaining_view(&mut views);

        match transport.write_vectored(&views[..count]) {
            Ok(0) => Err(ErrorKind::HandshakeFailed),
            Ok(written) => Ok(Some(sent + written)),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(_) => Err(ErrorKind::HandshakeFailed),
        }
    }

    fn notify_connected(&self) {
        let subscribers: Vec<Arc<dyn StateChangeHandler>> = {
            let inner = self.inner.lock();
            inner.subscribers.values().filter_map(Weak::upgrade).collect()
        };

        logging::debug!(self.log, "connection established";
                        "subscribers" => subscribers.len());

        for subscriber in subscribers {
            subscriber.on_connected(Arc::downgrade(&self.router_connector));
        }
    }
}

impl EventHandler for ConnectionProxy {
    fn on_ready(&self, _reactor: &Arc<Reactor>, ready: mio::Ready) {
        let mut completed: Vec<PacketShared> = Vec::new();
        let mut connected_now = false;
        let mut failure: Option<ErrorKind> = None;

        {
            let mut inner = self.inner.lock();

            match inner.state {
                ConnectionState::Connecting => {
                    match self.drive_handshake(&mut inner, ready, &mut completed) {
                        Ok(done) => connected_now = done,
                        Err(kind) => failure = Some(kind),
                    }
                }
                ConnectionState::Connected => {
                    if ready.is_readable() {
                        if let Some(handler) = inner.handler.as_mut() {
                            if let Err(NetError::Fatal(kind)) = handler.on_readable(&mut completed)
                            {
                                failure = Some(kind);
                            }
                        }
                    }

                    if failure.is_none() && ready.is_writable() {
                        if let Some(handler) = inner.handler.as_mut() {
                            if let Err(NetError::Fatal(kind)) = handler.on_writable() {
                                failure = Some(kind);
                            }
                        }
                    }
                }
                ConnectionState::Disconnected | ConnectionState::Disconnecting => {}
            }
        }

        if connected_now {
            self.notify_connected();
        }

        // Dispatch happens with the connection lock released; backends may
        // immediately send from their callbacks.
        for packet in &completed {
            route::dispatch_inbound(&self.router_connector, packet, &self.log);
        }

        if let Some(kind) = failure {
            self.defer_error(kind);
        }
    }
}
