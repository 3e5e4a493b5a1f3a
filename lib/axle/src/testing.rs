//! Shared test doubles: a scriptable in-memory transport, a fake discovery
//! daemon and recording backends driving the real subscribe / method-call
//! flows.

use chassis::ident::{
    ClientId, EventId, MethodId, ProvidedServiceInstanceId, RequiredServiceInstanceId,
    SessionSequence, UnicastAddress,
};
use chassis::integrity::{IntegrityLevel, PeerCredentials};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::calls::{CallFuture, PendingCalls};
use crate::net::message::{
    self, MessageType, NotificationHeader, RequestHeader, SubscribeHeader,
};
use crate::net::packet::PacketShared;
use crate::net::transport::{StreamTransport, TransportConnector};
use crate::reactor::Reactor;
use crate::route::{
    EventBackend, MethodBackend, MethodResponse, ProxyRouter, SubscriptionState,
};
use crate::sd::{
    InstanceEndpoint, ProvidedState, SdEventSink, ServiceDiscoveryClient,
};
use crate::shared::ErrorKind;

pub const WRITE_UNLIMITED: usize = usize::MAX;

// ---- Mock transport -----------------------------------------------------

struct MockState {
    inbox: VecDeque<u8>,
    read_chunk: usize,
    eof: bool,
    outbox: Vec<u8>,
    write_capacity: usize,
    connect_error: Option<io::ErrorKind>,
    shutdown: bool,
}

/// In-memory transport scripted by the test: bytes pushed through
/// `push_readable` appear on reads, writes land in an inspectable outbox,
/// and readiness is signalled through a mio user-space registration.
pub struct MockTransport {
    registration: mio::Registration,
    readiness: mio::SetReadiness,
    peer: PeerCredentials,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn disconnected(integrity: IntegrityLevel, write_capacity: usize) -> Arc<MockTransport> {
        Self::with_credentials(
            PeerCredentials {
                process_id: 4242,
                integrity_level: integrity,
            },
            write_capacity,
        )
    }

    pub fn with_credentials(peer: PeerCredentials, write_capacity: usize) -> Arc<MockTransport> {
        let (registration, readiness) = mio::Registration::new2();

        Arc::new(MockTransport {
            registration,
            readiness,
            peer,
            state: Mutex::new(MockState {
                inbox: VecDeque::new(),
                read_chunk: usize::MAX,
                eof: false,
                outbox: Vec::new(),
                write_capacity,
                connect_error: None,
                shutdown: false,
            }),
        })
    }

    /// Makes `bytes` available for reading and signals readable.
    pub fn push_readable(&self, bytes: &[u8]) {
        self.state.lock().inbox.extend(bytes.iter().copied());
        self.pulse(mio::Ready::readable());
    }

    /// Signals end-of-stream after any already pushed bytes.
    pub fn push_eof(&self) {
        self.state.lock().eof = true;
        self.pulse(mio::Ready::readable());
    }

    /// Caps how many bytes a single read call hands out.
    pub fn set_read_chunk(&self, chunk: usize) {
        self.state.lock().read_chunk = chunk;
    }

    pub fn drop_pending_readable(&self) {
        self.state.lock().inbox.clear();
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().outbox.clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::replace(&mut self.state.lock().outbox, Vec::new())
    }

    /// Raises the write capacity and signals writable.
    pub fn raise_write_limit(&self, capacity: usize) {
        self.state.lock().write_capacity = capacity;
        self.pulse(mio::Ready::writable());
    }

    /// Scripts the next `finish_connect` to fail.
    pub fn fail_connect(&self, kind: io::ErrorKind) {
        self.state.lock().connect_error = Some(kind);
    }

    /// Signals that the non-blocking connect finished.
    pub fn signal_connected(&self) {
        self.pulse(mio::Ready::writable());
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    fn pulse(&self, ready: mio::Ready) {
        let _ = self.readiness.set_readiness(mio::Ready::empty());
        let _ = self.readiness.set_readiness(ready);
    }
}

impl StreamTransport for MockTransport {
    fn register(
        &self,
        poll: &mio::Poll,
        token: mio::Token,
        interest: mio::Ready,
        opts: mio::PollOpt,
    ) -> io::Result<()> {
        poll.register(&self.registration, token, interest, opts)
    }

    fn deregister(&self, poll: &mio::Poll) -> io::Result<()> {
        poll.deregister(&self.registration)
    }

    fn finish_connect(&self) -> io::Result<()> {
        match self.state.lock().connect_error.take() {
            Some(kind) => Err(io::Error::from(kind)),
            None => Ok(()),
        }
    }

    fn read_vectored(&self, buffers: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
        let mut state = self.state.lock();

        if state.inbox.is_empty() {
            return if state.eof {
                Ok(0)
            } else {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            };
        }

        let mut budget = state.read_chunk.min(state.inbox.len());
        let mut copied = 0;

        for buffer in buffers.iter_mut() {
            copied += copied_into(buffer, &mut state.inbox, &mut budget);

            if budget == 0 {
                break;
            }
        }

        Ok(copied)
    }

    fn write_vectored(&self, buffers: &[io::IoSlice<'_>]) -> io::Result<usize> {
        let mut state = self.state.lock();

        let capacity = if state.write_capacity == WRITE_UNLIMITED {
            usize::MAX
        } else {
            state.write_capacity.saturating_sub(state.outbox.len())
        };

        if capacity == 0 {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }

        let mut budget = capacity;
        let mut written = 0;

        for buffer in buffers {
            let take = buffer.len().min(budget);
            state.outbox.extend_from_slice(&buffer[..take]);
            written += take;
            budget -= take;

            if budget == 0 {
                break;
            }
        }

        Ok(written)
    }

    fn peer_credentials(&self) -> io::Result<PeerCredentials> {
        Ok(self.peer)
    }

    fn shutdown(&self) -> io::Result<()> {
        self.state.lock().shutdown = true;
        Ok(())
    }
}

/// Copies from the inbox into one buffer, limited by `budget`.
fn copied_into(
    buffer: &mut io::IoSliceMut<'_>,
    inbox: &mut VecDeque<u8>,
    budget: &mut usize,
) -> usize {
    let mut copied = 0;

    while copied < buffer.len() && *budget > 0 {
        match inbox.pop_front() {
            Some(byte) => {
                buffer[copied] = byte;
                copied += 1;
                *budget -= 1;
            }
            None => break,
        }
    }

    copied
}

// ---- Mock connector -----------------------------------------------------

/// Hands out scripted transports and remembers them for inspection.
pub struct MockConnector {
    integrity: IntegrityLevel,
    write_capacity: usize,
    transports: Mutex<Vec<(UnicastAddress, Arc<MockTransport>)>>,
}

impl MockConnector {
    pub fn new(integrity: IntegrityLevel) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            integrity,
            write_capacity: WRITE_UNLIMITED,
            transports: Mutex::new(Vec::new()),
        })
    }

    pub fn transport_count(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn last(&self) -> Arc<MockTransport> {
        self.transports
            .lock()
            .last()
            .map(|(_, transport)| transport.clone())
            .expect("No transport opened yet")
    }

    pub fn transport_for(&self, address: UnicastAddress) -> Option<Arc<MockTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|(candidate, _)| *candidate == address)
            .map(|(_, transport)| transport.clone())
    }
}

impl TransportConnector for MockConnector {
    fn connect(&self, address: &UnicastAddress) -> io::Result<Arc<dyn StreamTransport>> {
        let transport = MockTransport::disconnected(self.integrity, self.write_capacity);
        self.transports.lock().push((*address, transport.clone()));

        Ok(transport as Arc<dyn StreamTransport>)
    }
}

// ---- Reactor helpers ----------------------------------------------------

pub fn spin(reactor: &Arc<Reactor>, iterations: usize) {
    for _ in 0..iterations {
        reactor
            .poll_once(Some(Duration::from_millis(20)))
            .expect("Reactor poll failed");
    }
}

/// Drives a freshly opened mock transport through the full handshake.
/// Returns any application bytes written immediately after the handshake
/// acknowledge (for example a subscribe triggered by the connected
/// notification).
pub fn establish(reactor: &Arc<Reactor>, transport: &Arc<MockTransport>) -> Vec<u8> {
    // Registration happens in a posted job; run it first.
    spin(reactor, 1);

    transport.signal_connected();
    spin(reactor, 2);

    let hello = transport.take_written();
    assert_eq!(hello.len(), 26, "Client hello must be 26 bytes");

    // Server hello: the server-to-client shm id.
    transport.push_readable(&[7, 0, 0, 0, 0, 0, 0, 0]);
    spin(reactor, 2);

    let mut written = transport.take_written();
    assert!(
        !written.is_empty() && written[0] == 0,
        "Client ack must be a single dummy byte"
    );
    written.remove(0);

    written
}

// ---- Fake service discovery ---------------------------------------------

pub struct FakeServiceDiscovery {
    listeners: Mutex<Vec<(RequiredServiceInstanceId, Arc<dyn SdEventSink>)>>,
}

impl FakeServiceDiscovery {
    pub fn new() -> Arc<FakeServiceDiscovery> {
        Arc::new(FakeServiceDiscovery {
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn fire_up(&self, provided: ProvidedServiceInstanceId, address: UnicastAddress) {
        self.fire(provided, ProvidedState::Up, address);
    }

    pub fn fire_down(&self, provided: ProvidedServiceInstanceId) {
        self.fire(provided, ProvidedState::Down, UnicastAddress::new(0, 0));
    }

    fn fire(
        &self,
        provided: ProvidedServiceInstanceId,
        state: ProvidedState,
        address: UnicastAddress,
    ) {
        let matching: Vec<Arc<dyn SdEventSink>> = self
            .listeners
            .lock()
            .iter()
            .filter(|(required, _)| required.matches(&provided))
            .map(|(_, sink)| sink.clone())
            .collect();

        for sink in matching {
            sink.on_instance_state(
                InstanceEndpoint {
                    instance: provided,
                    address,
                },
                state,
            );
        }
    }
}

impl ServiceDiscoveryClient for FakeServiceDiscovery {
    fn listen_service(&self, required: RequiredServiceInstanceId, sink: Arc<dyn SdEventSink>) {
        self.listeners.lock().push((required, sink));
    }

    fn unlisten_service(&self, required: &RequiredServiceInstanceId) {
        self.listeners.lock().retain(|(candidate, _)| candidate != required);
    }
}

// ---- Recording state handler --------------------------------------------

/// Connection state subscriber that records every callback verbatim.
pub struct RecordingStateHandler {
    pub events: Mutex<Vec<Result<(), ErrorKind>>>,
}

impl RecordingStateHandler {
    pub fn new() -> Arc<RecordingStateHandler> {
        Arc::new(RecordingStateHandler {
            events: Mutex::new(Vec::new()),
        })
    }
}

impl crate::net::connection::StateChangeHandler for RecordingStateHandler {
    fn on_connected(&self, _router_connector: Weak<crate::route::ProxyRouterConnector>) {
        self.events.lock().push(Ok(()));
    }

    fn on_disconnected(&self, reason: ErrorKind) {
        self.events.lock().push(Err(reason));
    }
}

// ---- Recording backends -------------------------------------------------

/// Event backend that drives the real subscribe flow: it sends the
/// SubscribeEvent message once the service is up and the connection stands,
/// and records every subscription state transition.
pub struct RecordingEventBackend {
    router: Weak<ProxyRouter>,
    provided: ProvidedServiceInstanceId,
    event: EventId,
    client: ClientId,
    service_up: AtomicBool,
    connected: AtomicBool,
    want_subscribe: AtomicBool,
    subscribe_sent: AtomicBool,
    pub states: Mutex<Vec<SubscriptionState>>,
    pub notifications: Mutex<Vec<PacketShared>>,
}

impl RecordingEventBackend {
    pub fn new(
        router: &Arc<ProxyRouter>,
        provided: ProvidedServiceInstanceId,
        event: EventId,
        client: ClientId,
    ) -> Arc<RecordingEventBackend> {
        let backend = Arc::new(RecordingEventBackend {
            router: Arc::downgrade(router),
            provided,
            event,
            client,
            service_up: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            want_subscribe: AtomicBool::new(false),
            subscribe_sent: AtomicBool::new(false),
            states: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        });

        router.add_event_backend(
            backend.event,
            Arc::downgrade(&backend) as Weak<dyn EventBackend>,
        );

        backend
    }

    /// User-facing subscribe intent; the message leaves as soon as service
    /// and connection allow.
    pub fn subscribe(&self) {
        self.want_subscribe.store(true, Ordering::SeqCst);
        self.try_send_subscribe();
    }

    pub fn last_state(&self) -> Option<SubscriptionState> {
        self.states.lock().last().copied()
    }

    fn try_send_subscribe(&self) {
        if !self.want_subscribe.load(Ordering::SeqCst)
            || !self.service_up.load(Ordering::SeqCst)
            || !self.connected.load(Ordering::SeqCst)
            || self.subscribe_sent.swap(true, Ordering::SeqCst)
        {
            return;
        }

        let header = SubscribeHeader {
            service: self.provided.service(),
            instance: self.provided.instance(),
            major: self.provided.major(),
            event: self.event,
            client: self.client,
        };
        let packet = message::encode_subscribe(MessageType::SubscribeEvent, &header);

        let sent = self
            .router
            .upgrade()
            .map(|router| router.send(packet).is_ok())
            .unwrap_or(false);

        if !sent {
            self.subscribe_sent.store(false, Ordering::SeqCst);
        }
    }
}

impl EventBackend for RecordingEventBackend {
    fn on_notification(&self, _header: NotificationHeader, packet: PacketShared) {
        self.notifications.lock().push(packet);
    }

    fn on_subscribe_ack(&self, _header: SubscribeHeader) {
        self.states.lock().push(SubscriptionState::Subscribed);
    }

    fn on_subscribe_nack(&self, _header: SubscribeHeader) {
        self.states.lock().push(SubscriptionState::NotSubscribed);
    }

    fn set_service_state(&self, up: bool) {
        self.service_up.store(up, Ordering::SeqCst);

        if up {
            self.try_send_subscribe();
        } else {
            self.subscribe_sent.store(false, Ordering::SeqCst);

            if self.want_subscribe.load(Ordering::SeqCst) {
                self.states.lock().push(SubscriptionState::SubscriptionPending);
            }
        }
    }

    fn on_connection_state(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);

        if connected {
            self.try_send_subscribe();
        } else {
            self.subscribe_sent.store(false, Ordering::SeqCst);
        }
    }
}

/// Method backend issuing real request packets and completing futures from
/// routed responses.
pub struct RecordingMethodBackend {
    router: Weak<ProxyRouter>,
    provided: ProvidedServiceInstanceId,
    method: MethodId,
    client: ClientId,
    sessions: Mutex<SessionSequence>,
    pending: PendingCalls<MethodResponse>,
    available: AtomicBool,
}

impl RecordingMethodBackend {
    pub fn new(
        router: &Arc<ProxyRouter>,
        provided: ProvidedServiceInstanceId,
        method: MethodId,
        client: ClientId,
    ) -> Arc<RecordingMethodBackend> {
        let backend = Arc::new(RecordingMethodBackend {
            router: Arc::downgrade(router),
            provided,
            method,
            client,
            sessions: Mutex::new(SessionSequence::new()),
            pending: PendingCalls::new(),
            available: AtomicBool::new(false),
        });

        router.add_method_backend(
            backend.method,
            Arc::downgrade(&backend) as Weak<dyn MethodBackend>,
        );

        backend
    }

    /// Fires a method request and returns the future of its response.
    pub fn call(&self, payload: &[u8]) -> Result<CallFuture<MethodResponse>, ErrorKind> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ErrorKind::ServiceNotAvailable);
        }

        let session = self.sessions.lock().next();
        let header = RequestHeader {
            service: self.provided.service(),
            instance: self.provided.instance(),
            major: self.provided.major(),
            method: self.method,
            client: self.client,
            session,
        };

        let future = self.pending.register(session);
        let packet = message::encode_request(MessageType::Request, &header, payload);

        let router = self.router.upgrade().ok_or(ErrorKind::Disconnected)?;

        match router.send(packet) {
            Ok(_) => Ok(future),
            Err(kind) => {
                self.pending.forget(session);
                Err(kind)
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl MethodBackend for RecordingMethodBackend {
    fn on_response(&self, response: MethodResponse) {
        match response {
            MethodResponse::Response { header, .. } => {
                self.pending.complete(header.session, response);
            }
            MethodResponse::Error { header, .. } => {
                self.pending
                    .fail(header.request.session, header.return_code.as_error_kind());
            }
            MethodResponse::ApplicationError { header, .. } => {
                self.pending.complete(header.session, response);
            }
        }
    }

    fn set_service_state(&self, up: bool) {
        self.available.store(up, Ordering::SeqCst);

        if !up {
            self.pending.cancel_all(ErrorKind::ServiceNotAvailable);
        }
    }

    fn on_connection_state(&self, connected: bool) {
        if !connected {
            self.pending.cancel_all(ErrorKind::ServiceNotAvailable);
        }
    }
}
