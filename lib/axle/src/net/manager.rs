//! Connection pool: one proxy per (endpoint, expected integrity), shared by
//! every service instance routed over that endpoint, with deferred
//! destruction of terminated proxies.

use chassis::ident::{ProvidedServiceInstanceId, UnicastAddress};
use chassis::integrity::IntegrityLevel;
use chassis::logging::{self, Logger};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::config::RuntimeConfig;
use crate::net::connection::{ConnectionProxy, ConnectionState, StateChangeHandler};
use crate::net::transport::TransportConnector;
use crate::reactor::Reactor;
use crate::route::{ProxyRouterConnector, ProxyRouterMapper};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
struct ConnectionKey {
    address: UnicastAddress,
    integrity: IntegrityLevel,
}

struct ManagerInner {
    live: IndexMap<ConnectionKey, Arc<ConnectionProxy>>,
    /// Router connectors outlive their proxies; registrations survive until
    /// the last mapper is released.
    connectors: IndexMap<ConnectionKey, Arc<ProxyRouterConnector>>,
    /// Proxies waiting for their deferred drop.
    terminated: Vec<Arc<ConnectionProxy>>,
    drain_queued: bool,
}

pub struct ConnectionManagerProxy {
    log: Logger,
    weak_self: Weak<ConnectionManagerProxy>,
    reactor: Arc<Reactor>,
    transports: Arc<dyn TransportConnector>,
    config: RuntimeConfig,
    inner: Mutex<ManagerInner>,
}

impl ConnectionManagerProxy {
    pub fn new(
        reactor: &Arc<Reactor>,
        transports: Arc<dyn TransportConnector>,
        config: RuntimeConfig,
        log: &Logger,
    ) -> Arc<ConnectionManagerProxy> {
        Arc::new_cyclic(|weak_self| ConnectionManagerProxy {
            log: log.new(logging::o!("component" => "connection_manager")),
            weak_self: weak_self.clone(),
            reactor: reactor.clone(),
            transports,
            config,
            inner: Mutex::new(ManagerInner {
                live: IndexMap::new(),
                connectors: IndexMap::new(),
                terminated: Vec::new(),
                drain_queued: false,
            }),
        })
    }

    /// Finds or creates the proxy for `address`, registers the mapper on the
    /// endpoint's router connector and the state handler for `provided`, and
    /// returns the connection state as of this call.
    pub fn connect(
        &self,
        state_handler: Weak<dyn StateChangeHandler>,
        address: UnicastAddress,
        expected_integrity: IntegrityLevel,
        provided: ProvidedServiceInstanceId,
        router_mapper: &Arc<ProxyRouterMapper>,
    ) -> ConnectionState {
        let key = ConnectionKey {
            address,
            integrity: expected_integrity,
        };

        let proxy = {
            let mut inner = self.inner.lock();

            let connector = inner
                .connectors
                .entry(key)
                .or_insert_with(ProxyRouterConnector::create)
                .clone();

            connector.add_router_mapper(provided.service_instance(), router_mapper);

            // A proxy already in Disconnecting is never handed out again; a
            // fresh one replaces it while the old one finishes its deferred
            // teardown.
            let reusable = inner
                .live
                .get(&key)
                .filter(|proxy| proxy.get_state() != ConnectionState::Disconnecting)
                .cloned();

            match reusable {
                Some(proxy) => proxy,
                None => {
                    logging::debug!(self.log, "creating connection proxy";
                                    "domain" => address.domain,
                                    "port" => address.port);

                    let proxy = ConnectionProxy::create(
                        &self.reactor,
                        self.weak_self.clone(),
                        self.transports.clone(),
                        connector.clone(),
                        address,
                        expected_integrity,
                        self.config.clone(),
                        &self.log,
                    );

                    connector.set_connection_proxy(Arc::downgrade(&proxy));
                    inner.live.insert(key, proxy.clone());
                    proxy
                }
            }
        };

        proxy.connect(provided, state_handler)
    }

    /// Releases the subscriber for `provided` on the endpoint's proxy. The
    /// proxy tears itself down once its last subscriber is gone.
    pub fn disconnect(
        &self,
        provided: ProvidedServiceInstanceId,
        address: UnicastAddress,
        expected_integrity: IntegrityLevel,
    ) {
        let key = ConnectionKey {
            address,
            integrity: expected_integrity,
        };

        let proxy = self.inner.lock().live.get(&key).cloned();

        if let Some(proxy) = proxy {
            proxy.disconnect(provided);
        }
    }

    /// Deregisters the mapper for `provided` from the endpoint's connector
    /// and returns the number of mappers still registered. The connector is
    /// dropped together with its last registration.
    pub fn release_router_mapper(
        &self,
        address: UnicastAddress,
        expected_integrity: IntegrityLevel,
        provided: ProvidedServiceInstanceId,
    ) -> usize {
        let key = ConnectionKey {
            address,
            integrity: expected_integrity,
        };

        let mut inner = self.inner.lock();

        match inner.connectors.get(&key) {
            Some(connector) => {
                let remaining = connector.release_router_mapper(provided.service_instance());

                if remaining == 0 {
                    inner.connectors.shift_remove(&key);
                }

                remaining
            }
            None => 0,
        }
    }

    /// Called by a proxy from its teardown job: moves it from the live map
    /// to the terminated list and schedules the drop for the next reactor
    /// iteration. Removal and insertion happen under one lock, so a
    /// concurrent `connect` for the same endpoint observes either the live
    /// proxy or none at all.
    pub fn on_disconnect(&self, proxy: &Arc<ConnectionProxy>) {
        let key = ConnectionKey {
            address: proxy.address(),
            integrity: proxy.expected_integrity(),
        };

        let mut inner = self.inner.lock();

        if let Some(current) = inner.live.get(&key) {
            if Arc::ptr_eq(current, proxy) {
                inner.live.shift_remove(&key);
            }
        }

        inner.terminated.push(proxy.clone());

        if !inner.drain_queued {
            inner.drain_queued = true;

            if let Some(manager) = self.weak_self.upgrade() {
                self.reactor.post(move |_| manager.drain_terminated());
            }
        }
    }

    /// Number of live proxies, exposed for introspection and tests.
    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    fn drain_terminated(&self) {
        let dropped = {
            let mut inner = self.inner.lock();
            inner.drain_queued = false;
            std::mem::replace(&mut inner.terminated, Vec::new())
        };

        logging::trace!(self.log, "terminated connections dropped"; "count" => dropped.len());
    }
}
