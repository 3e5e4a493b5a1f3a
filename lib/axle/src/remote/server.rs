//! Shared state of all proxies bound to one provided service instance.

use chassis::ident::{ClientId, ProvidedServiceInstanceId, UnicastAddress};
use chassis::integrity::IntegrityLevel;
use chassis::logging::{self, Logger};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::net::connection::StateChangeHandler;
use crate::net::manager::ConnectionManagerProxy;
use crate::route::{ProxyRouter, ProxyRouterConnector, ProxyRouterMapper};
use crate::sd::ServiceInstanceListener;
use crate::shared::ErrorKind;

/// Upper bound on the blocking wait for connection establishment.
const CONNECTION_ESTABLISHED_TIMEOUT: Duration = Duration::from_secs(10);

struct RemoteInner {
    /// Number of proxies currently holding this server.
    request_count: usize,
    /// Endpoint announced by service discovery; cleared on Down.
    address: Option<UnicastAddress>,
    /// Endpoint the mapper and state handler are registered at with the
    /// connection manager. Survives Down so the registration can be released
    /// when the last proxy goes away.
    registered_address: Option<UnicastAddress>,
    connector: Weak<ProxyRouterConnector>,
}

/// Exactly one instance exists per distinct provided service instance while
/// any proxy holds it. Connections are shared through the connection
/// manager; clients attach through the router mapper.
pub struct RemoteServer {
    log: Logger,
    weak_self: Weak<RemoteServer>,
    conman: Arc<ConnectionManagerProxy>,
    provided: ProvidedServiceInstanceId,
    integrity: IntegrityLevel,
    mapper: Arc<ProxyRouterMapper>,
    inner: Mutex<RemoteInner>,
    connected: AtomicBool,
    service_up: AtomicBool,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

impl RemoteServer {
    pub fn create(
        conman: &Arc<ConnectionManagerProxy>,
        provided: ProvidedServiceInstanceId,
        integrity: IntegrityLevel,
        log: &Logger,
    ) -> Arc<RemoteServer> {
        let log = log.new(logging::o!(
            "component" => "remote_server",
            "service" => provided.service(),
            "instance" => provided.instance()
        ));
        let mapper = ProxyRouterMapper::new(&log);

        Arc::new_cyclic(|weak_self| RemoteServer {
            log,
            weak_self: weak_self.clone(),
            conman: conman.clone(),
            provided,
            integrity,
            mapper,
            inner: Mutex::new(RemoteInner {
                request_count: 0,
                address: None,
                registered_address: None,
                connector: Weak::new(),
            }),
            connected: AtomicBool::new(false),
            service_up: AtomicBool::new(false),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        })
    }

    #[inline]
    pub fn provided(&self) -> ProvidedServiceInstanceId {
        self.provided
    }

    #[inline]
    pub fn mapper(&self) -> &Arc<ProxyRouterMapper> {
        &self.mapper
    }

    pub fn request_count(&self) -> usize {
        self.inner.lock().request_count
    }

    /// Registers a proxy's router under its client id. The first request
    /// with a known endpoint kicks off the connection.
    pub fn request(&self, client: ClientId, router: &Arc<ProxyRouter>) {
        self.mapper.add_client(client, router);

        let (first, address, connector) = {
            let mut inner = self.inner.lock();
            inner.request_count += 1;

            (
                inner.request_count == 1,
                inner.address,
                inner.connector.clone(),
            )
        };

        // Late joiners catch up on state already established for the
        // instance.
        if self.service_up.load(Ordering::Acquire) {
            router.on_service_instance_up();
        }
        if self.connected.load(Ordering::Acquire) {
            router.on_connected(&connector);
        }

        logging::debug!(self.log, "proxy requested remote server";
                        "client" => client,
                        "count" => self.request_count());

        match address {
            Some(address) if first => self.connect_via_manager(address),
            _ => {}
        }
    }

    /// Deregisters a proxy. When the last one is gone the connection is
    /// released and the mapper registration dropped.
    pub fn release(&self, client: ClientId) {
        self.mapper.release_client(client);

        let released_address = {
            let mut inner = self.inner.lock();

            if inner.request_count > 0 {
                inner.request_count -= 1;
            }

            if inner.request_count == 0 {
                inner.registered_address.take()
            } else {
                None
            }
        };

        logging::debug!(self.log, "proxy released remote server";
                        "client" => client,
                        "count" => self.request_count());

        if let Some(address) = released_address {
            self.conman.disconnect(self.provided, address, self.integrity);
            self.conman
                .release_router_mapper(address, self.integrity, self.provided);
        }
    }

    /// Best-effort connection view; may trail reactor-side changes by one
    /// cycle.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_service_up(&self) -> bool {
        self.service_up.load(Ordering::Acquire)
    }

    /// Blocks until the connection is established, bounded by a 10 s
    /// timeout. Returns the connection state at wakeup.
    pub fn wait_for_connection_establishment(&self) -> bool {
        let deadline = Instant::now() + CONNECTION_ESTABLISHED_TIMEOUT;
        let mut guard = self.wait_lock.lock();

        while !self.connected.load(Ordering::Acquire) {
            let now = Instant::now();

            if now >= deadline {
                break;
            }

            self.wait_cv.wait_for(&mut guard, deadline - now);
        }

        self.connected.load(Ordering::Acquire)
    }

    fn update_connection_state(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);

        // Taking the wait lock orders the store against a waiter's check.
        let _guard = self.wait_lock.lock();
        self.wait_cv.notify_all();
    }

    fn connect_via_manager(&self, address: UnicastAddress) {
        self.inner.lock().registered_address = Some(address);

        let handler = self.weak_self.clone() as Weak<dyn StateChangeHandler>;
        let state = self
            .conman
            .connect(handler, address, self.integrity, self.provided, &self.mapper);

        logging::debug!(self.log, "connect requested";
                        "domain" => address.domain,
                        "port" => address.port,
                        "state" => ?state);
    }
}

impl StateChangeHandler for RemoteServer {
    fn on_connected(&self, router_connector: Weak<ProxyRouterConnector>) {
        self.inner.lock().connector = router_connector.clone();
        self.update_connection_state(true);
        self.mapper.on_connected(&router_connector);

        logging::debug!(self.log, "remote server connected");
    }

    fn on_disconnected(&self, reason: ErrorKind) {
        self.update_connection_state(false);

        {
            let mut inner = self.inner.lock();
            inner.connector = Weak::new();
        }

        self.mapper.on_disconnected();

        logging::debug!(self.log, "remote server disconnected"; "reason" => ?reason);

        // A communication failure is the one reason that permits an
        // automatic reconnect; every other reason is final.
        if reason == ErrorKind::CommunicationFailure {
            let retry_address = {
                let inner = self.inner.lock();

                if self.service_up.load(Ordering::Acquire) && inner.request_count > 0 {
                    inner.address
                } else {
                    None
                }
            };

            if let Some(address) = retry_address {
                logging::debug!(self.log, "attempting reconnect");
                self.connect_via_manager(address);
            }
        }
    }
}

impl ServiceInstanceListener for RemoteServer {
    fn on_service_instance_up(&self, address: UnicastAddress) {
        self.service_up.store(true, Ordering::Release);

        let connect_now = {
            let mut inner = self.inner.lock();
            inner.address = Some(address);
            inner.request_count > 0
        };

        self.mapper.on_service_instance_up();

        if connect_now {
            self.connect_via_manager(address);
        }
    }

    fn on_service_instance_down(&self) {
        self.service_up.store(false, Ordering::Release);

        let registered = {
            let mut inner = self.inner.lock();
            inner.address = None;
            inner.registered_address
        };

        if let Some(address) = registered {
            self.conman.disconnect(self.provided, address, self.integrity);
        }

        // Every backend of every attached router observes the down state
        // before this callback returns.
        self.mapper.on_service_instance_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::reactor::Reactor;
    use crate::testing::MockConnector;
    use std::thread;

    fn server() -> Arc<RemoteServer> {
        let log = logging::discard();
        let reactor = Reactor::new(&log).unwrap();
        let conman = ConnectionManagerProxy::new(
            &reactor,
            MockConnector::new(IntegrityLevel::AsilD),
            RuntimeConfig::default(),
            &log,
        );

        RemoteServer::create(
            &conman,
            ProvidedServiceInstanceId::new(1, 2, 1, 0).unwrap(),
            IntegrityLevel::Qm,
            &log,
        )
    }

    #[test]
    fn test_request_release_restores_counter() {
        let server = server();
        let router = ProxyRouter::new(&logging::discard());

        server.request(1, &router);
        assert_eq!(server.request_count(), 1);
        assert_eq!(server.mapper().client_count(), 1);

        server.release(1);
        assert_eq!(server.request_count(), 0);
        assert_eq!(server.mapper().client_count(), 0);
    }

    #[test]
    fn test_not_connected_by_default() {
        let server = server();
        assert!(!server.is_connected());
        assert!(!server.is_service_up());
    }

    #[test]
    fn test_wait_wakes_on_connection() {
        let server = server();

        let waker = server.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            waker.update_connection_state(true);
        });

        assert!(server.wait_for_connection_establishment());
        handle.join().unwrap();
    }

    #[test]
    fn test_request_without_endpoint_stays_pending() {
        let server = server();
        let router = ProxyRouter::new(&logging::discard());

        // No SD Up yet: no endpoint, nothing to connect to.
        server.request(1, &router);
        assert!(!server.is_connected());
        assert_eq!(server.request_count(), 1);
    }
}
