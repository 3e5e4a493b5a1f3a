//! Process-wide deduplication of remote servers.

use chassis::ident::{ProvidedServiceInstanceId, RequiredServiceInstanceId};
use chassis::integrity::IntegrityLevel;
use chassis::logging::{self, Logger};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::net::manager::ConnectionManagerProxy;
use crate::remote::server::RemoteServer;
use crate::sd::{SdEventSink, ServiceDiscoveryClient, ServiceDiscoveryListener, ServiceInstanceListener};

struct Entry {
    server: Weak<RemoteServer>,
    required: RequiredServiceInstanceId,
    // Kept alive here: the discovery client only holds what we hand it.
    _listener: Arc<ServiceDiscoveryListener>,
}

pub struct RemoteServerManager {
    log: Logger,
    conman: Arc<ConnectionManagerProxy>,
    sd: Arc<dyn ServiceDiscoveryClient>,
    servers: Mutex<HashMap<ProvidedServiceInstanceId, Entry>>,
}

impl RemoteServerManager {
    pub fn new(
        conman: &Arc<ConnectionManagerProxy>,
        sd: Arc<dyn ServiceDiscoveryClient>,
        log: &Logger,
    ) -> Arc<RemoteServerManager> {
        Arc::new(RemoteServerManager {
            log: log.new(logging::o!("component" => "remote_server_manager")),
            conman: conman.clone(),
            sd,
            servers: Mutex::new(HashMap::new()),
        })
    }

    /// Hands out the remote server for `provided`, creating it and binding
    /// it to service discovery on first use. Concurrent requests for the
    /// same instance observe the same server.
    pub fn request_remote_server(
        &self,
        provided: ProvidedServiceInstanceId,
        required: RequiredServiceInstanceId,
        integrity: IntegrityLevel,
    ) -> Arc<RemoteServer> {
        let mut servers = self.servers.lock();

        if let Some(entry) = servers.get(&provided) {
            if let Some(server) = entry.server.upgrade() {
                return server;
            }
        }

        logging::debug!(self.log, "creating remote server";
                        "service" => provided.service(),
                        "instance" => provided.instance());

        let server = RemoteServer::create(&self.conman, provided, integrity, &self.log);

        let listener = ServiceDiscoveryListener::new(
            required,
            provided,
            Arc::downgrade(&server) as Weak<dyn ServiceInstanceListener>,
            &self.log,
        );
        self.sd
            .listen_service(required, listener.clone() as Arc<dyn SdEventSink>);

        servers.insert(
            provided,
            Entry {
                server: Arc::downgrade(&server),
                required,
                _listener: listener,
            },
        );

        server
    }

    /// Releases the manager's binding for `provided` once no proxy holds the
    /// server any more. The caller drops its own strong reference right
    /// after, which destroys the server on the caller thread.
    pub fn release_remote_server(&self, provided: ProvidedServiceInstanceId) {
        let mut servers = self.servers.lock();

        let gone = match servers.get(&provided) {
            Some(entry) => entry
                .server
                .upgrade()
                .map(|server| server.request_count() == 0)
                .unwrap_or(true),
            None => return,
        };

        if gone {
            if let Some(entry) = servers.remove(&provided) {
                logging::debug!(self.log, "remote server released";
                                "service" => provided.service(),
                                "instance" => provided.instance());
                self.sd.unlisten_service(&entry.required);
            }
        }
    }

    pub fn server_count(&self) -> usize {
        self.servers.lock().len()
    }
}
