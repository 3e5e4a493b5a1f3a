//! End-to-end exercises of the full stack against scripted transports and a
//! fake discovery daemon.

use chassis::ident::{ProvidedServiceInstanceId, RequiredServiceInstanceId, UnicastAddress};
use chassis::integrity::IntegrityLevel;
use chassis::logging::{self, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::net::connection::{ConnectionState, StateChangeHandler};
use crate::net::manager::ConnectionManagerProxy;
use crate::net::message::{self, MessageType, ProtocolMessage, SubscribeHeader};
use crate::net::transport::TransportConnector;
use crate::reactor::Reactor;
use crate::remote::RemoteServerManager;
use crate::route::{ProxyRouter, ProxyRouterMapper, SubscriptionState};
use crate::sd::ServiceDiscoveryClient;
use crate::shared::ErrorKind;
use crate::testing::{
    establish, spin, FakeServiceDiscovery, MockConnector, RecordingEventBackend,
    RecordingMethodBackend, RecordingStateHandler,
};

struct Harness {
    log: Logger,
    reactor: Arc<Reactor>,
    transports: Arc<MockConnector>,
    conman: Arc<ConnectionManagerProxy>,
    sd: Arc<FakeServiceDiscovery>,
    servers: Arc<RemoteServerManager>,
}

fn harness(peer_integrity: IntegrityLevel) -> Harness {
    let log = logging::discard();
    let reactor = Reactor::new(&log).unwrap();
    let transports = MockConnector::new(peer_integrity);
    let conman = ConnectionManagerProxy::new(
        &reactor,
        transports.clone() as Arc<dyn TransportConnector>,
        RuntimeConfig::default(),
        &log,
    );
    let sd = FakeServiceDiscovery::new();
    let servers = RemoteServerManager::new(
        &conman,
        sd.clone() as Arc<dyn ServiceDiscoveryClient>,
        &log,
    );

    Harness {
        log,
        reactor,
        transports,
        conman,
        sd,
        servers,
    }
}

fn ids(service: u16, instance: u16) -> (ProvidedServiceInstanceId, RequiredServiceInstanceId) {
    (
        ProvidedServiceInstanceId::new(service, instance, 1, 0).unwrap(),
        RequiredServiceInstanceId::new(service, instance, 1, 0),
    )
}

const ADDRESS: UnicastAddress = UnicastAddress { domain: 7, port: 42 };

#[test]
fn test_happy_path_event_subscribe() {
    let h = harness(IntegrityLevel::AsilD);
    let (provided, required) = ids(0x1111, 0x0001);

    let server = h
        .servers
        .request_remote_server(provided, required, IntegrityLevel::Qm);
    let router = ProxyRouter::new(&h.log);
    let backend = RecordingEventBackend::new(&router, provided, 0x1234, 0x0001);

    server.request(0x0001, &router);
    h.sd.fire_up(provided, ADDRESS);

    spin(&h.reactor, 1);
    let transport = h.transports.last();
    establish(&h.reactor, &transport);

    assert!(server.is_connected());

    backend.subscribe();

    let wire = transport.take_written();
    match message::decode_message(&wire).unwrap() {
        ProtocolMessage::SubscribeEvent(header) => {
            assert_eq!(
                header,
                SubscribeHeader {
                    service: 0x1111,
                    instance: 0x0001,
                    major: 1,
                    event: 0x1234,
                    client: 0x0001,
                }
            );
        }
        message => panic!("Unexpected wire message {:?}", message),
    }

    // The server acknowledges the subscription.
    let ack = message::encode_subscribe(
        MessageType::SubscribeEventAck,
        &SubscribeHeader {
            service: 0x1111,
            instance: 0x0001,
            major: 1,
            event: 0x1234,
            client: 0x0001,
        },
    );
    transport.push_readable(ack.bytes());
    spin(&h.reactor, 2);

    assert_eq!(backend.last_state(), Some(SubscriptionState::Subscribed));
}

#[test]
fn test_late_service_discovery() {
    let h = harness(IntegrityLevel::AsilD);
    let (provided, required) = ids(0x1111, 0x0001);

    let server = h
        .servers
        .request_remote_server(provided, required, IntegrityLevel::Qm);
    let router = ProxyRouter::new(&h.log);
    let backend = RecordingEventBackend::new(&router, provided, 0x1234, 0x0001);

    server.request(0x0001, &router);

    // Subscribe intent before the instance is discovered: no wire traffic,
    // not even a transport.
    backend.subscribe();
    spin(&h.reactor, 2);
    assert_eq!(h.transports.transport_count(), 0);

    h.sd.fire_up(provided, ADDRESS);
    spin(&h.reactor, 1);

    let transport = h.transports.last();
    let after_handshake = establish(&h.reactor, &transport);

    // The pending subscribe left exactly once, right after the handshake.
    match message::decode_message(&after_handshake).unwrap() {
        ProtocolMessage::SubscribeEvent(header) => {
            assert_eq!(header.event, 0x1234);
            assert_eq!(header.client, 0x0001);
        }
        message => panic!("Unexpected wire message {:?}", message),
    }
    assert_eq!(
        after_handshake.len(),
        message::GENERIC_HEADER_LENGTH + message::SUBSCRIBE_HEADER_LENGTH
    );

    // The instance goes down before any acknowledge arrives.
    h.sd.fire_down(provided);

    assert_eq!(
        backend.last_state(),
        Some(SubscriptionState::SubscriptionPending)
    );
}

#[test]
fn test_method_call_cancelled_by_disconnect() {
    let h = harness(IntegrityLevel::AsilD);
    let (provided, required) = ids(0x0001, 0x0002);

    let server = h
        .servers
        .request_remote_server(provided, required, IntegrityLevel::Qm);
    let router = ProxyRouter::new(&h.log);
    let backend = RecordingMethodBackend::new(&router, provided, 0x0003, 0x0009);

    server.request(0x0009, &router);
    h.sd.fire_up(provided, ADDRESS);

    spin(&h.reactor, 1);
    let transport = h.transports.last();
    establish(&h.reactor, &transport);

    let future = backend.call(&[0xAB]).unwrap();
    assert_eq!(backend.pending_count(), 1);

    // The request is on the wire with the first session id.
    match message::decode_message(&transport.take_written()).unwrap() {
        ProtocolMessage::Request(header) => {
            assert_eq!(header.service, 0x0001);
            assert_eq!(header.instance, 0x0002);
            assert_eq!(header.method, 0x0003);
            assert_eq!(header.client, 0x0009);
            assert_eq!(header.session, 1);
        }
        message => panic!("Unexpected wire message {:?}", message),
    }

    // The connection drops before any response arrives.
    transport.push_eof();
    spin(&h.reactor, 3);

    assert_eq!(
        future.poll(),
        Some(Err(ErrorKind::ServiceNotAvailable)),
        "Pending call must be cancelled within one reactor cycle"
    );
    assert_eq!(backend.pending_count(), 0);

    // CommunicationFailure permits an automatic reconnect attempt.
    spin(&h.reactor, 1);
    assert!(h.transports.transport_count() >= 2);
}

#[test]
fn test_malformed_header_closes_connection() {
    let h = harness(IntegrityLevel::AsilD);
    let (provided, required) = ids(0x0001, 0x0002);

    let server = h
        .servers
        .request_remote_server(provided, required, IntegrityLevel::Qm);
    let router = ProxyRouter::new(&h.log);
    let event_backend = RecordingEventBackend::new(&router, provided, 0x0010, 0x0009);
    let method_backend = RecordingMethodBackend::new(&router, provided, 0x0003, 0x0009);

    server.request(0x0009, &router);
    h.sd.fire_up(provided, ADDRESS);

    spin(&h.reactor, 1);
    let transport = h.transports.last();
    establish(&h.reactor, &transport);

    let future = method_backend.call(&[]).unwrap();
    transport.take_written();

    // protocol_version 3, message_type 0xFFFFFFFF, total_length 1_000_000 on
    // a connection whose limit is 64 KiB.
    let mut wire = [0u8; message::GENERIC_HEADER_LENGTH];
    wire[..4].copy_from_slice(&[0, 0, 0, 3]);
    wire[4..8].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
    wire[8..12].copy_from_slice(&1_000_000u32.to_le_bytes());
    transport.push_readable(&wire);

    spin(&h.reactor, 3);

    // No packet was delivered, the connection is gone and every pending
    // promise was cancelled.
    assert!(event_backend.notifications.lock().is_empty());
    assert!(!server.is_connected());
    assert!(transport.is_shutdown());
    assert_eq!(future.poll(), Some(Err(ErrorKind::ServiceNotAvailable)));

    // MalformedMessage is final: no reconnect attempt.
    spin(&h.reactor, 2);
    assert_eq!(h.transports.transport_count(), 1);
}

#[test]
fn test_two_proxies_share_one_connection() {
    let h = harness(IntegrityLevel::AsilD);
    let (first_provided, first_required) = ids(0x1111, 0x0001);
    let (second_provided, second_required) = ids(0x2222, 0x0001);

    let first_server =
        h.servers
            .request_remote_server(first_provided, first_required, IntegrityLevel::Qm);
    let second_server =
        h.servers
            .request_remote_server(second_provided, second_required, IntegrityLevel::Qm);

    let first_router = ProxyRouter::new(&h.log);
    let second_router = ProxyRouter::new(&h.log);

    first_server.request(1, &first_router);
    second_server.request(2, &second_router);

    // Both instances live behind the same endpoint.
    h.sd.fire_up(first_provided, ADDRESS);
    h.sd.fire_up(second_provided, ADDRESS);

    spin(&h.reactor, 1);
    assert_eq!(h.transports.transport_count(), 1, "One transport per endpoint");

    let transport = h.transports.last();
    establish(&h.reactor, &transport);

    assert!(first_server.is_connected());
    assert!(second_server.is_connected());
    assert_eq!(h.conman.live_count(), 1);

    // Both service instances are registered on the shared connector.
    let proxy = first_router.connection_proxy().unwrap();
    assert_eq!(proxy.router_connector().mapper_count(), 2);

    // Releasing one proxy leaves the other connected.
    first_server.release(1);
    spin(&h.reactor, 2);

    assert!(second_server.is_connected());
    assert!(!transport.is_shutdown());
    assert_eq!(h.conman.live_count(), 1);
}

#[test]
fn test_integrity_mismatch_closes_before_handshake() {
    // Peer reports QM, expected is ASIL B.
    let h = harness(IntegrityLevel::Qm);
    let (provided, _required) = ids(0x0001, 0x0001);

    let mapper = ProxyRouterMapper::new(&h.log);
    let handler = RecordingStateHandler::new();

    let state = h.conman.connect(
        Arc::downgrade(&handler) as Weak<dyn StateChangeHandler>,
        ADDRESS,
        IntegrityLevel::AsilB,
        provided,
        &mapper,
    );
    assert_eq!(state, ConnectionState::Connecting);

    spin(&h.reactor, 1);
    let transport = h.transports.last();
    transport.signal_connected();
    spin(&h.reactor, 3);

    // Disconnected with exactly IntegrityLevelTooLow, before any byte left.
    assert_eq!(
        *handler.events.lock(),
        vec![Err(ErrorKind::IntegrityLevelTooLow)]
    );
    assert!(transport.written().is_empty());
    assert!(transport.is_shutdown());
    assert_eq!(h.conman.live_count(), 0);
}

#[test]
fn test_connect_disconnect_restores_pool_state() {
    let h = harness(IntegrityLevel::AsilD);
    let (provided, _required) = ids(0x0001, 0x0001);

    let mapper = ProxyRouterMapper::new(&h.log);
    let handler = RecordingStateHandler::new();

    h.conman.connect(
        Arc::downgrade(&handler) as Weak<dyn StateChangeHandler>,
        ADDRESS,
        IntegrityLevel::Qm,
        provided,
        &mapper,
    );
    assert_eq!(h.conman.live_count(), 1);

    h.conman.disconnect(provided, ADDRESS, IntegrityLevel::Qm);
    spin(&h.reactor, 2);

    assert_eq!(h.conman.live_count(), 0);
    assert_eq!(
        h.conman.release_router_mapper(ADDRESS, IntegrityLevel::Qm, provided),
        0
    );
}

#[test]
fn test_handshake_wire_format() {
    let h = harness(IntegrityLevel::AsilD);
    let (provided, required) = ids(0x0001, 0x0001);

    let server = h
        .servers
        .request_remote_server(provided, required, IntegrityLevel::Qm);
    let router = ProxyRouter::new(&h.log);
    server.request(1, &router);
    h.sd.fire_up(provided, ADDRESS);

    spin(&h.reactor, 2);
    let transport = h.transports.last();
    transport.signal_connected();
    spin(&h.reactor, 2);

    let hello = transport.take_written();
    assert_eq!(hello.len(), 26);

    let config = RuntimeConfig::default();

    // protocol version (u16), two shm ids (u64), buffer size hint (u64)
    assert_eq!(
        u16::from_le_bytes([hello[0], hello[1]]),
        config.handshake_protocol_version
    );

    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&hello[2..10]);
    let c2s_shm_id = u64::from_le_bytes(id_bytes);
    id_bytes.copy_from_slice(&hello[10..18]);
    let notification_shm_id = u64::from_le_bytes(id_bytes);

    assert_ne!(c2s_shm_id, notification_shm_id);

    id_bytes.copy_from_slice(&hello[18..26]);
    assert_eq!(u64::from_le_bytes(id_bytes), config.s2c_buffer_size_hint);
}

#[test]
fn test_wait_for_connection_with_reactor_thread() {
    let h = harness(IntegrityLevel::AsilD);
    let (provided, required) = ids(0x0001, 0x0001);

    let server = h
        .servers
        .request_remote_server(provided, required, IntegrityLevel::Qm);
    let router = ProxyRouter::new(&h.log);
    server.request(1, &router);

    let running = Arc::new(AtomicBool::new(true));
    let reactor = h.reactor.clone();
    let running_flag = running.clone();
    let reactor_thread = thread::spawn(move || {
        while running_flag.load(Ordering::Acquire) {
            reactor.poll_once(Some(Duration::from_millis(5))).unwrap();
        }
    });

    h.sd.fire_up(provided, ADDRESS);

    // Wait for the transport to be opened by the reactor thread, then script
    // the server side of the handshake up front.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while h.transports.transport_count() == 0 {
        assert!(std::time::Instant::now() < deadline, "Transport never opened");
        thread::sleep(Duration::from_millis(1));
    }

    let transport = h.transports.last();
    transport.push_readable(&[9, 0, 0, 0, 0, 0, 0, 0]);
    transport.signal_connected();

    assert!(server.wait_for_connection_establishment());
    assert!(server.is_connected());

    running.store(false, Ordering::Release);
    reactor_thread.join().unwrap();
}
