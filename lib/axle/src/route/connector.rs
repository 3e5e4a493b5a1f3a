//! Junction between one connection and the router mappers using it.
//!
//! Exactly one connector exists per live connection, but its lifetime
//! extends beyond the connection proxy: the connection manager keeps it
//! alive per endpoint so mapper registrations survive a proxy teardown until
//! they are explicitly released.

use chassis::ident::{ClientId, EventId, MethodId, ServiceInstanceId};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};

use crate::net::connection::ConnectionProxy;
use crate::route::backend::{EventBackend, MethodBackend};
use crate::route::mapper::ProxyRouterMapper;

pub struct ProxyRouterConnector {
    // Dedicated lock: only set/get of the proxy back-reference, never held
    // across a callback.
    proxy: Mutex<Weak<ConnectionProxy>>,
    mappers: RwLock<IndexMap<ServiceInstanceId, Weak<ProxyRouterMapper>>>,
}

impl ProxyRouterConnector {
    pub fn create() -> Arc<ProxyRouterConnector> {
        Arc::new(ProxyRouterConnector {
            proxy: Mutex::new(Weak::new()),
            mappers: RwLock::new(IndexMap::new()),
        })
    }

    /// Registers a mapper under its service instance key. A mapper is
    /// registered at most once per identifier; a second registration is
    /// refused and reported with `false`.
    pub fn add_router_mapper(
        &self,
        service_instance: ServiceInstanceId,
        mapper: &Arc<ProxyRouterMapper>,
    ) -> bool {
        let mut mappers = self.mappers.write();

        if mappers.contains_key(&service_instance) {
            return false;
        }

        mappers.insert(service_instance, Arc::downgrade(mapper));
        true
    }

    /// Removes the registration and returns the number of mappers left.
    pub fn release_router_mapper(&self, service_instance: ServiceInstanceId) -> usize {
        let mut mappers = self.mappers.write();
        mappers.shift_remove(&service_instance);
        mappers.len()
    }

    pub fn mapper_count(&self) -> usize {
        self.mappers.read().len()
    }

    pub fn mapper(&self, service_instance: &ServiceInstanceId) -> Option<Arc<ProxyRouterMapper>> {
        self.mappers
            .read()
            .get(service_instance)
            .and_then(Weak::upgrade)
    }

    pub fn set_connection_proxy(&self, proxy: Weak<ConnectionProxy>) {
        *self.proxy.lock() = proxy;
    }

    pub fn clear_connection_proxy(&self) {
        *self.proxy.lock() = Weak::new();
    }

    /// Clears the back-reference only while it still points at `expected`.
    /// A proxy tearing down must not wipe the reference to its replacement.
    pub fn clear_connection_proxy_if(&self, expected: &Weak<ConnectionProxy>) {
        let mut proxy = self.proxy.lock();

        if proxy.ptr_eq(expected) {
            *proxy = Weak::new();
        }
    }

    /// Upgrades the proxy back-reference; empty once the proxy terminated.
    pub fn connection_proxy(&self) -> Option<Arc<ConnectionProxy>> {
        self.proxy.lock().upgrade()
    }

    pub fn event_backend(
        &self,
        service_instance: &ServiceInstanceId,
        client: ClientId,
        event: EventId,
    ) -> Option<Arc<dyn EventBackend>> {
        self.mapper(service_instance)
            .and_then(|mapper| mapper.event_backend(client, event))
    }

    pub fn method_backend(
        &self,
        service_instance: &ServiceInstanceId,
        client: ClientId,
        method: MethodId,
    ) -> Option<Arc<dyn MethodBackend>> {
        self.mapper(service_instance)
            .and_then(|mapper| mapper.method_backend(client, method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chassis::logging;

    fn key(instance: u16) -> ServiceInstanceId {
        ServiceInstanceId {
            service: 1,
            instance,
            major: 1,
        }
    }

    #[test]
    fn test_mapper_registered_at_most_once() {
        let connector = ProxyRouterConnector::create();
        let mapper = ProxyRouterMapper::new(&logging::discard());

        assert!(connector.add_router_mapper(key(1), &mapper));
        assert!(!connector.add_router_mapper(key(1), &mapper));
        assert_eq!(connector.mapper_count(), 1);
    }

    #[test]
    fn test_release_returns_remaining_count() {
        let connector = ProxyRouterConnector::create();
        let first = ProxyRouterMapper::new(&logging::discard());
        let second = ProxyRouterMapper::new(&logging::discard());

        connector.add_router_mapper(key(1), &first);
        connector.add_router_mapper(key(2), &second);

        assert_eq!(connector.release_router_mapper(key(1)), 1);
        assert_eq!(connector.release_router_mapper(key(2)), 0);
        assert_eq!(connector.release_router_mapper(key(2)), 0);
    }

    #[test]
    fn test_registrations_survive_dead_proxy_reference() {
        let connector = ProxyRouterConnector::create();
        let mapper = ProxyRouterMapper::new(&logging::discard());
        connector.add_router_mapper(key(1), &mapper);

        connector.clear_connection_proxy();

        assert!(connector.connection_proxy().is_none());
        assert!(connector.mapper(&key(1)).is_some());
    }

    #[test]
    fn test_dead_mapper_lookup_is_none() {
        let connector = ProxyRouterConnector::create();
        let mapper = ProxyRouterMapper::new(&logging::discard());
        connector.add_router_mapper(key(1), &mapper);

        drop(mapper);

        assert!(connector.mapper(&key(1)).is_none());
        // The stale registration still counts until explicitly released.
        assert_eq!(connector.mapper_count(), 1);
    }
}
