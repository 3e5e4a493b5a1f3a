//! Service discovery binding.
//!
//! The discovery daemon is an external collaborator; the core consumes it as
//! an opaque stream of up/down notifications per required service instance.
//! [`ServiceDiscoveryListener`] translates those notifications for exactly
//! one concrete provided instance and forwards them to its remote server.

use chassis::ident::{ProvidedServiceInstanceId, RequiredServiceInstanceId, UnicastAddress};
use chassis::logging::{self, Logger};
use std::sync::{Arc, Weak};

/// Advertised lifecycle state of a provided instance.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProvidedState {
    Up,
    Down,
}

/// A provided instance together with the endpoint it is reachable at.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InstanceEndpoint {
    pub instance: ProvidedServiceInstanceId,
    pub address: UnicastAddress,
}

/// Callback sink handed to the discovery client per required instance.
pub trait SdEventSink: Send + Sync {
    fn on_instance_state(&self, endpoint: InstanceEndpoint, state: ProvidedState);
}

/// Client interface of the external discovery daemon.
pub trait ServiceDiscoveryClient: Send + Sync {
    fn listen_service(&self, required: RequiredServiceInstanceId, sink: Arc<dyn SdEventSink>);

    fn unlisten_service(&self, required: &RequiredServiceInstanceId);
}

/// Receiver of the translated state stream, implemented by the remote
/// server.
pub trait ServiceInstanceListener: Send + Sync {
    fn on_service_instance_up(&self, address: UnicastAddress);

    fn on_service_instance_down(&self);
}

/// Binds one required instance id to one concrete provided instance and
/// forwards matching discovery events to the target listener. Events for
/// other instances matching a wildcarded required id are ignored here; each
/// concrete instance gets its own listener.
pub struct ServiceDiscoveryListener {
    log: Logger,
    required: RequiredServiceInstanceId,
    provided: ProvidedServiceInstanceId,
    target: Weak<dyn ServiceInstanceListener>,
}

impl ServiceDiscoveryListener {
    pub fn new(
        required: RequiredServiceInstanceId,
        provided: ProvidedServiceInstanceId,
        target: Weak<dyn ServiceInstanceListener>,
        log: &Logger,
    ) -> Arc<ServiceDiscoveryListener> {
        Arc::new(ServiceDiscoveryListener {
            log: log.new(logging::o!(
                "component" => "sd_listener",
                "service" => provided.service(),
                "instance" => provided.instance()
            )),
            required,
            provided,
            target,
        })
    }
}

impl SdEventSink for ServiceDiscoveryListener {
    fn on_instance_state(&self, endpoint: InstanceEndpoint, state: ProvidedState) {
        if endpoint.instance != self.provided {
            logging::trace!(self.log, "event for other instance ignored");
            return;
        }

        if !self.required.matches(&endpoint.instance) {
            logging::warn!(self.log, "discovery event outside the required id, ignored");
            return;
        }

        let target = match self.target.upgrade() {
            Some(target) => target,
            None => {
                logging::trace!(self.log, "listener target gone");
                return;
            }
        };

        match state {
            ProvidedState::Up => {
                logging::debug!(self.log, "service instance up";
                                "domain" => endpoint.address.domain,
                                "port" => endpoint.address.port);
                target.on_service_instance_up(endpoint.address);
            }
            ProvidedState::Down => {
                logging::debug!(self.log, "service instance down");
                target.on_service_instance_down();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingListener {
        events: Mutex<Vec<Option<UnicastAddress>>>,
    }

    impl ServiceInstanceListener for RecordingListener {
        fn on_service_instance_up(&self, address: UnicastAddress) {
            self.events.lock().push(Some(address));
        }

        fn on_service_instance_down(&self) {
            self.events.lock().push(None);
        }
    }

    fn provided(instance: u16) -> ProvidedServiceInstanceId {
        ProvidedServiceInstanceId::new(10, instance, 1, 0).unwrap()
    }

    #[test]
    fn test_matching_events_are_forwarded() {
        let target = Arc::new(RecordingListener {
            events: Mutex::new(Vec::new()),
        });

        let listener = ServiceDiscoveryListener::new(
            RequiredServiceInstanceId::new(10, 1, 1, 0),
            provided(1),
            Arc::downgrade(&target) as Weak<dyn ServiceInstanceListener>,
            &logging::discard(),
        );

        let address = UnicastAddress::new(7, 42);
        listener.on_instance_state(
            InstanceEndpoint {
                instance: provided(1),
                address,
            },
            ProvidedState::Up,
        );
        listener.on_instance_state(
            InstanceEndpoint {
                instance: provided(1),
                address,
            },
            ProvidedState::Down,
        );

        assert_eq!(*target.events.lock(), vec![Some(address), None]);
    }

    #[test]
    fn test_other_instances_are_ignored() {
        let target = Arc::new(RecordingListener {
            events: Mutex::new(Vec::new()),
        });

        let listener = ServiceDiscoveryListener::new(
            RequiredServiceInstanceId::new(10, chassis::ident::INSTANCE_ID_ANY, 1, 0),
            provided(1),
            Arc::downgrade(&target) as Weak<dyn ServiceInstanceListener>,
            &logging::discard(),
        );

        listener.on_instance_state(
            InstanceEndpoint {
                instance: provided(2),
                address: UnicastAddress::new(0, 1),
            },
            ProvidedState::Up,
        );

        assert!(target.events.lock().is_empty());
    }

    #[test]
    fn test_dead_target_does_not_panic() {
        let target = Arc::new(RecordingListener {
            events: Mutex::new(Vec::new()),
        });
        let weak = Arc::downgrade(&target) as Weak<dyn ServiceInstanceListener>;
        drop(target);

        let listener = ServiceDiscoveryListener::new(
            RequiredServiceInstanceId::new(10, 1, 1, 0),
            provided(1),
            weak,
            &logging::discard(),
        );

        listener.on_instance_state(
            InstanceEndpoint {
                instance: provided(1),
                address: UnicastAddress::new(0, 1),
            },
            ProvidedState::Up,
        );
    }
}
