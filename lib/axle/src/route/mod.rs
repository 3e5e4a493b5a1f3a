//! Dispatch graph between one shared connection and the per-client proxy
//! backends.
//!
//! ```text
//! ConnectionProxy <-weak-- ProxyRouterConnector --> {ServiceInstanceId -> Mapper}
//!                          ProxyRouterConnector <-weak-- ProxyRouterMapper
//!                          ProxyRouterMapper --> {ClientId -> ProxyRouter}
//!                          ProxyRouterMapper <-weak-- ProxyRouter
//!                          ProxyRouter --> backends per event / method id
//! ```
//!
//! Downward edges are non-owning registrations of externally owned nodes;
//! every upward edge is a weak handle whose failed upgrade is a defined
//! `Disconnected` error. The connector is the only shared-ownership node.

pub mod backend;
pub mod connector;
pub mod mapper;
pub mod router;

pub use self::backend::{
    EventBackend, FireAndForgetBackend, MethodBackend, MethodResponse, SubscriptionState,
};
pub use self::connector::ProxyRouterConnector;
pub use self::mapper::ProxyRouterMapper;
pub use self::router::ProxyRouter;

use chassis::ident::ServiceInstanceId;
use chassis::logging::{self, Logger};

use crate::net::message::{self, ProtocolMessage};
use crate::net::packet::PacketShared;

/// Routes one received packet to its backend(s). Unroutable packets are
/// dropped with a single log line; they never tear the connection down.
pub fn dispatch_inbound(connector: &ProxyRouterConnector, packet: &PacketShared, log: &Logger) {
    let decoded = match message::decode_message(packet.bytes()) {
        Ok(decoded) => decoded,
        Err(kind) => {
            logging::warn!(log, "undecodable message dropped"; "error" => ?kind);
            return;
        }
    };

    match decoded {
        ProtocolMessage::Response(header) => {
            deliver_method_response(
                connector,
                ServiceInstanceId {
                    service: header.service,
                    instance: header.instance,
                    major: header.major,
                },
                header.client,
                header.method,
                MethodResponse::Response {
                    header,
                    packet: packet.clone(),
                },
                log,
            );
        }
        ProtocolMessage::ErrorResponse(header) => {
            deliver_method_response(
                connector,
                ServiceInstanceId {
                    service: header.request.service,
                    instance: header.request.instance,
                    major: header.request.major,
                },
                header.request.client,
                header.request.method,
                MethodResponse::Error {
                    header,
                    packet: packet.clone(),
                },
                log,
            );
        }
        ProtocolMessage::ApplicationError(header) => {
            deliver_method_response(
                connector,
                ServiceInstanceId {
                    service: header.service,
                    instance: header.instance,
                    major: header.major,
                },
                header.client,
                header.method,
                MethodResponse::ApplicationError {
                    header,
                    packet: packet.clone(),
                },
                log,
            );
        }
        ProtocolMessage::Notification(header) => {
            let key = ServiceInstanceId {
                service: header.service,
                instance: header.instance,
                major: header.major,
            };

            match connector.mapper(&key) {
                Some(mapper) => {
                    mapper.for_each_event_backend(header.event, |backend| {
                        backend.on_notification(header, packet.clone());
                    });
                }
                None => {
                    logging::warn!(log, "notification for unknown service instance dropped";
                                   "service" => header.service,
                                   "instance" => header.instance,
                                   "event" => header.event);
                }
            }
        }
        ProtocolMessage::SubscribeEventAck(header) => {
            with_event_backend(connector, &header, log, |backend| backend.on_subscribe_ack(header));
        }
        ProtocolMessage::SubscribeEventNAck(header) => {
            with_event_backend(connector, &header, log, |backend| {
                backend.on_subscribe_nack(header)
            });
        }
        ProtocolMessage::UnsubscribeEventAck(header) => {
            with_event_backend(connector, &header, log, |backend| {
                backend.on_unsubscribe_ack(header)
            });
        }
        ProtocolMessage::UnsubscribeEventNAck(header) => {
            with_event_backend(connector, &header, log, |backend| {
                backend.on_unsubscribe_nack(header)
            });
        }
        ProtocolMessage::Request(_)
        | ProtocolMessage::RequestNoReturn(_)
        | ProtocolMessage::SubscribeEvent(_)
        | ProtocolMessage::UnsubscribeEvent(_) => {
            logging::warn!(log, "server-bound message received on proxy connection, dropping");
        }
    }
}

fn deliver_method_response(
    connector: &ProxyRouterConnector,
    key: ServiceInstanceId,
    client: chassis::ident::ClientId,
    method: chassis::ident::MethodId,
    response: MethodResponse,
    log: &Logger,
) {
    match connector.method_backend(&key, client, method) {
        Some(backend) => backend.on_response(response),
        None => {
            logging::warn!(log, "method response without backend dropped";
                           "service" => key.service,
                           "instance" => key.instance,
                           "client" => client,
                           "method" => method);
        }
    }
}

fn with_event_backend<F>(
    connector: &ProxyRouterConnector,
    header: &message::SubscribeHeader,
    log: &Logger,
    deliver: F,
) where
    F: FnOnce(&std::sync::Arc<dyn EventBackend>),
{
    let key = ServiceInstanceId {
        service: header.service,
        instance: header.instance,
        major: header.major,
    };

    match connector.event_backend(&key, header.client, header.event) {
        Some(backend) => deliver(&backend),
        None => {
            logging::warn!(log, "subscription message without backend dropped";
                           "service" => header.service,
                           "instance" => header.instance,
                           "client" => header.client,
                           "event" => header.event);
        }
    }
}
