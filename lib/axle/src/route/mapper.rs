//! Fan-out node between one service instance and its per-client routers.

use chassis::ident::{ClientId, EventId, MethodId};
use chassis::logging::{self, Logger};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};

use crate::route::backend::{EventBackend, FireAndForgetBackend, MethodBackend};
use crate::route::connector::ProxyRouterConnector;
use crate::route::router::ProxyRouter;

/// Growth step of the reused event fan-out scratch vector; bounds the number
/// of reallocations on the notification hot path.
const SCRATCH_GROWTH: usize = 10;

pub struct ProxyRouterMapper {
    log: Logger,
    routers: RwLock<IndexMap<ClientId, Weak<ProxyRouter>>>,
    scratch: Mutex<Vec<Arc<dyn EventBackend>>>,
}

impl ProxyRouterMapper {
    pub fn new(log: &Logger) -> Arc<ProxyRouterMapper> {
        Arc::new(ProxyRouterMapper {
            log: log.new(logging::o!("component" => "router_mapper")),
            routers: RwLock::new(IndexMap::new()),
            scratch: Mutex::new(Vec::new()),
        })
    }

    pub fn add_client(&self, client: ClientId, router: &Arc<ProxyRouter>) {
        logging::debug!(self.log, "client registered"; "client" => client);
        self.routers.write().insert(client, Arc::downgrade(router));
    }

    pub fn release_client(&self, client: ClientId) {
        logging::debug!(self.log, "client released"; "client" => client);
        self.routers.write().shift_remove(&client);
    }

    pub fn client_count(&self) -> usize {
        self.routers.read().len()
    }

    pub fn router(&self, client: ClientId) -> Option<Arc<ProxyRouter>> {
        self.routers.read().get(&client).and_then(Weak::upgrade)
    }

    pub fn event_backend(&self, client: ClientId, event: EventId) -> Option<Arc<dyn EventBackend>> {
        self.router(client).and_then(|router| router.event_backend(event))
    }

    pub fn method_backend(&self, client: ClientId, method: MethodId) -> Option<Arc<dyn MethodBackend>> {
        self.router(client)
            .and_then(|router| router.method_backend(method))
    }

    pub fn fire_and_forget_backend(
        &self,
        client: ClientId,
        method: MethodId,
    ) -> Option<Arc<dyn FireAndForgetBackend>> {
        self.router(client)
            .and_then(|router| router.fire_and_forget_backend(method))
    }

    /// Invokes `deliver` for the event backend of every registered client
    /// that has one for `event`. The backends are staged in a reused scratch
    /// vector so the notification path performs no steady-state allocation;
    /// the router table lock is released before the callbacks run.
    pub fn for_each_event_backend<F>(&self, event: EventId, mut deliver: F)
    where
        F: FnMut(&Arc<dyn EventBackend>),
    {
        let mut scratch = self.scratch.lock();

        {
            let routers = self.routers.read();

            for router in routers.values().filter_map(Weak::upgrade) {
                if let Some(backend) = router.event_backend(event) {
                    if scratch.len() == scratch.capacity() {
                        scratch.reserve_exact(SCRATCH_GROWTH);
                    }

                    scratch.push(backend);
                }
            }
        }

        for backend in scratch.iter() {
            deliver(backend);
        }

        scratch.clear();
    }

    // ---- Fan-out --------------------------------------------------------

    pub fn on_service_instance_up(&self) {
        for router in self.collect_routers() {
            router.on_service_instance_up();
        }
    }

    pub fn on_service_instance_down(&self) {
        for router in self.collect_routers() {
            router.on_service_instance_down();
        }
    }

    pub fn on_connected(&self, connector: &Weak<ProxyRouterConnector>) {
        for router in self.collect_routers() {
            router.on_connected(connector);
        }
    }

    pub fn on_disconnected(&self) {
        for router in self.collect_routers() {
            router.on_disconnected();
        }
    }

    fn collect_routers(&self) -> Vec<Arc<ProxyRouter>> {
        self.routers.read().values().filter_map(Weak::upgrade).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::{NotificationHeader, SubscribeHeader};
    use crate::net::packet::PacketShared;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEventBackend {
        notifications: AtomicUsize,
    }

    impl CountingEventBackend {
        fn new() -> Arc<CountingEventBackend> {
            Arc::new(CountingEventBackend {
                notifications: AtomicUsize::new(0),
            })
        }
    }

    impl EventBackend for CountingEventBackend {
        fn on_notification(&self, _header: NotificationHeader, _packet: PacketShared) {
            self.notifications.fetch_add(1, Ordering::SeqCst);
        }

        fn on_subscribe_ack(&self, _header: SubscribeHeader) {}
        fn on_subscribe_nack(&self, _header: SubscribeHeader) {}
        fn set_service_state(&self, _up: bool) {}
    }

    fn header() -> NotificationHeader {
        NotificationHeader {
            service: 1,
            instance: 1,
            major: 1,
            event: 5,
        }
    }

    #[test]
    fn test_notification_reaches_every_client() {
        let mapper = ProxyRouterMapper::new(&logging::discard());

        let first_router = ProxyRouter::new(&logging::discard());
        let second_router = ProxyRouter::new(&logging::discard());

        let first = CountingEventBackend::new();
        let second = CountingEventBackend::new();

        first_router.add_event_backend(5, Arc::downgrade(&first) as Weak<dyn EventBackend>);
        second_router.add_event_backend(5, Arc::downgrade(&second) as Weak<dyn EventBackend>);

        mapper.add_client(1, &first_router);
        mapper.add_client(2, &second_router);

        let packet = crate::net::packet::Packet::uninit(0).share();
        mapper.for_each_event_backend(5, |backend| {
            backend.on_notification(header(), packet.clone())
        });

        assert_eq!(first.notifications.load(Ordering::SeqCst), 1);
        assert_eq!(second.notifications.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clients_without_matching_event_are_skipped() {
        let mapper = ProxyRouterMapper::new(&logging::discard());

        let router = ProxyRouter::new(&logging::discard());
        let backend = CountingEventBackend::new();
        router.add_event_backend(99, Arc::downgrade(&backend) as Weak<dyn EventBackend>);
        mapper.add_client(1, &router);

        let mut delivered = 0;
        mapper.for_each_event_backend(5, |_| delivered += 1);

        assert_eq!(delivered, 0);
    }

    #[test]
    fn test_released_client_is_not_delivered() {
        let mapper = ProxyRouterMapper::new(&logging::discard());

        let router = ProxyRouter::new(&logging::discard());
        let backend = CountingEventBackend::new();
        router.add_event_backend(5, Arc::downgrade(&backend) as Weak<dyn EventBackend>);

        mapper.add_client(1, &router);
        mapper.release_client(1);

        mapper.for_each_event_backend(5, |backend| {
            backend.on_notification(header(), crate::net::packet::Packet::uninit(0).share())
        });

        assert_eq!(backend.notifications.load(Ordering::SeqCst), 0);
        assert_eq!(mapper.client_count(), 0);
    }

    #[test]
    fn test_scratch_grows_in_increments() {
        let mapper = ProxyRouterMapper::new(&logging::discard());

        let mut keep = Vec::new();
        for client in 0..25u16 {
            let router = ProxyRouter::new(&logging::discard());
            let backend = CountingEventBackend::new();
            router.add_event_backend(5, Arc::downgrade(&backend) as Weak<dyn EventBackend>);
            mapper.add_client(client, &router);
            keep.push((router, backend));
        }

        let mut delivered = 0;
        mapper.for_each_event_backend(5, |_| delivered += 1);
        assert_eq!(delivered, 25);

        let capacity = mapper.scratch.lock().capacity();
        assert!(capacity >= 25);
        assert_eq!(capacity % SCRATCH_GROWTH, 0);
    }
}
