//! Per-proxy routing node.

use chassis::ident::{EventId, MethodId};
use chassis::logging::{self, Logger};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::net::connection::ConnectionProxy;
use crate::net::handler::SendOutcome;
use crate::net::packet::PacketShared;
use crate::route::backend::{EventBackend, FireAndForgetBackend, MethodBackend};
use crate::route::connector::ProxyRouterConnector;
use crate::shared::ErrorKind;

/// Routing state of one proxy object: the backends registered per event and
/// method id, plus the weak path up to the connection.
///
/// The backend tables are written rarely (proxy construction and teardown)
/// and read on every received packet, hence the read-preferring locks.
pub struct ProxyRouter {
    log: Logger,
    connector: Mutex<Weak<ProxyRouterConnector>>,
    events: RwLock<IndexMap<EventId, Weak<dyn EventBackend>>>,
    methods: RwLock<IndexMap<MethodId, Weak<dyn MethodBackend>>>,
    fire_and_forget: RwLock<IndexMap<MethodId, Weak<dyn FireAndForgetBackend>>>,
    service_up: AtomicBool,
}

impl ProxyRouter {
    pub fn new(log: &Logger) -> Arc<ProxyRouter> {
        Arc::new(ProxyRouter {
            log: log.new(logging::o!("component" => "proxy_router")),
            connector: Mutex::new(Weak::new()),
            events: RwLock::new(IndexMap::new()),
            methods: RwLock::new(IndexMap::new()),
            fire_and_forget: RwLock::new(IndexMap::new()),
            service_up: AtomicBool::new(false),
        })
    }

    // ---- Backend registration -------------------------------------------

    pub fn add_event_backend(&self, event: EventId, backend: Weak<dyn EventBackend>) {
        self.events.write().insert(event, backend);
    }

    pub fn release_event_backend(&self, event: EventId) {
        self.events.write().shift_remove(&event);
    }

    pub fn add_method_backend(&self, method: MethodId, backend: Weak<dyn MethodBackend>) {
        self.methods.write().insert(method, backend);
    }

    pub fn release_method_backend(&self, method: MethodId) {
        self.methods.write().shift_remove(&method);
    }

    pub fn add_fire_and_forget_backend(
        &self,
        method: MethodId,
        backend: Weak<dyn FireAndForgetBackend>,
    ) {
        self.fire_and_forget.write().insert(method, backend);
    }

    pub fn release_fire_and_forget_backend(&self, method: MethodId) {
        self.fire_and_forget.write().shift_remove(&method);
    }

    pub fn event_backend(&self, event: EventId) -> Option<Arc<dyn EventBackend>> {
        self.events.read().get(&event).and_then(Weak::upgrade)
    }

    pub fn method_backend(&self, method: MethodId) -> Option<Arc<dyn MethodBackend>> {
        self.methods.read().get(&method).and_then(Weak::upgrade)
    }

    pub fn fire_and_forget_backend(&self, method: MethodId) -> Option<Arc<dyn FireAndForgetBackend>> {
        self.fire_and_forget.read().get(&method).and_then(Weak::upgrade)
    }

    // ---- Connection path ------------------------------------------------

    pub fn set_router_connector(&self, connector: Weak<ProxyRouterConnector>) {
        *self.connector.lock() = connector;
    }

    pub fn connection_proxy(&self) -> Option<Arc<ConnectionProxy>> {
        self.connector
            .lock()
            .upgrade()
            .and_then(|connector| connector.connection_proxy())
    }

    /// Serialised outbound path: follows the weak chain up to the connection
    /// and sends. A broken link anywhere is `Disconnected`.
    pub fn send(&self, packet: PacketShared) -> Result<SendOutcome, ErrorKind> {
        let connector = self
            .connector
            .lock()
            .upgrade()
            .ok_or(ErrorKind::Disconnected)?;
        let proxy = connector.connection_proxy().ok_or(ErrorKind::Disconnected)?;

        proxy.send(packet)
    }

    pub fn service_state(&self) -> bool {
        self.service_up.load(Ordering::Acquire)
    }

    // ---- Fan-out from the remote server ---------------------------------

    pub fn on_service_instance_up(&self) {
        self.service_up.store(true, Ordering::Release);
        logging::debug!(self.log, "service instance up");

        for backend in self.collect_events() {
            backend.set_service_state(true);
        }
        for backend in self.collect_methods() {
            backend.set_service_state(true);
        }
        for backend in self.collect_fire_and_forget() {
            backend.set_service_state(true);
        }
    }

    pub fn on_service_instance_down(&self) {
        self.service_up.store(false, Ordering::Release);
        logging::debug!(self.log, "service instance down");

        for backend in self.collect_events() {
            backend.set_service_state(false);
        }
        for backend in self.collect_methods() {
            backend.set_service_state(false);
        }
        for backend in self.collect_fire_and_forget() {
            backend.set_service_state(false);
        }
    }

    pub fn on_connected(&self, connector: &Weak<ProxyRouterConnector>) {
        *self.connector.lock() = connector.clone();

        for backend in self.collect_events() {
            backend.on_connection_state(true);
        }
        for backend in self.collect_methods() {
            backend.on_connection_state(true);
        }
        for backend in self.collect_fire_and_forget() {
            backend.on_connection_state(true);
        }
    }

    pub fn on_disconnected(&self) {
        *self.connector.lock() = Weak::new();

        for backend in self.collect_events() {
            backend.on_connection_state(false);
        }
        for backend in self.collect_methods() {
            backend.on_connection_state(false);
        }
        for backend in self.collect_fire_and_forget() {
            backend.on_connection_state(false);
        }
    }

    // Backends are collected before invocation so no router lock is held
    // during a callback.

    fn collect_events(&self) -> Vec<Arc<dyn EventBackend>> {
        self.events.read().values().filter_map(Weak::upgrade).collect()
    }

    fn collect_methods(&self) -> Vec<Arc<dyn MethodBackend>> {
        self.methods.read().values().filter_map(Weak::upgrade).collect()
    }

    fn collect_fire_and_forget(&self) -> Vec<Arc<dyn FireAndForgetBackend>> {
        self.fire_and_forget
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::NotificationHeader;
    use crate::route::backend::MethodResponse;
    use std::sync::atomic::AtomicUsize;

    struct FlagBackend {
        ups: AtomicUsize,
        downs: AtomicUsize,
    }

    impl FlagBackend {
        fn new() -> Arc<FlagBackend> {
            Arc::new(FlagBackend {
                ups: AtomicUsize::new(0),
                downs: AtomicUsize::new(0),
            })
        }
    }

    impl EventBackend for FlagBackend {
        fn on_notification(&self, _header: NotificationHeader, _packet: PacketShared) {}
        fn on_subscribe_ack(&self, _header: crate::net::message::SubscribeHeader) {}
        fn on_subscribe_nack(&self, _header: crate::net::message::SubscribeHeader) {}

        fn set_service_state(&self, up: bool) {
            if up {
                self.ups.fetch_add(1, Ordering::SeqCst);
            } else {
                self.downs.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl MethodBackend for FlagBackend {
        fn on_response(&self, _response: MethodResponse) {}

        fn set_service_state(&self, up: bool) {
            if up {
                self.ups.fetch_add(1, Ordering::SeqCst);
            } else {
                self.downs.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_service_state_fans_out_to_all_backends() {
        let router = ProxyRouter::new(&logging::discard());

        let event_backend = FlagBackend::new();
        let method_backend = FlagBackend::new();

        router.add_event_backend(1, Arc::downgrade(&event_backend) as Weak<dyn EventBackend>);
        router.add_method_backend(2, Arc::downgrade(&method_backend) as Weak<dyn MethodBackend>);

        router.on_service_instance_up();
        assert!(router.service_state());
        assert_eq!(event_backend.ups.load(Ordering::SeqCst), 1);
        assert_eq!(method_backend.ups.load(Ordering::SeqCst), 1);

        router.on_service_instance_down();
        assert!(!router.service_state());
        assert_eq!(event_backend.downs.load(Ordering::SeqCst), 1);
        assert_eq!(method_backend.downs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_released_backend_is_not_called() {
        let router = ProxyRouter::new(&logging::discard());
        let backend = FlagBackend::new();

        router.add_event_backend(1, Arc::downgrade(&backend) as Weak<dyn EventBackend>);
        router.release_event_backend(1);

        router.on_service_instance_up();
        assert_eq!(backend.ups.load(Ordering::SeqCst), 0);
        assert!(router.event_backend(1).is_none());
    }

    #[test]
    fn test_dead_backend_lookup_is_none() {
        let router = ProxyRouter::new(&logging::discard());
        let backend = FlagBackend::new();

        router.add_event_backend(1, Arc::downgrade(&backend) as Weak<dyn EventBackend>);
        drop(backend);

        assert!(router.event_backend(1).is_none());
    }

    #[test]
    fn test_send_without_connector_is_disconnected() {
        let router = ProxyRouter::new(&logging::discard());
        let packet = crate::net::packet::Packet::uninit(0).share();

        assert_eq!(router.send(packet).unwrap_err(), ErrorKind::Disconnected);
    }
}
