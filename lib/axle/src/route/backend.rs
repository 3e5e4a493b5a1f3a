//! Interfaces of the generated per-event and per-method backends.
//!
//! Backends are owned by the generated proxy layer; the router graph holds
//! weak registrations only. All callbacks run in reactor context and must
//! not block.

use crate::net::message::{ErrorResponseHeader, NotificationHeader, RequestHeader, SubscribeHeader};
use crate::net::packet::PacketShared;

/// Client-side view of an event subscription.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SubscriptionState {
    Subscribed,
    NotSubscribed,
    /// Requested but not acknowledged; entered again whenever the service or
    /// the connection goes away while a subscription is desired.
    SubscriptionPending,
}

/// Everything a method backend can receive in answer to a request.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodResponse {
    Response {
        header: RequestHeader,
        packet: PacketShared,
    },
    Error {
        header: ErrorResponseHeader,
        packet: PacketShared,
    },
    ApplicationError {
        header: RequestHeader,
        packet: PacketShared,
    },
}

pub trait EventBackend: Send + Sync {
    fn on_notification(&self, header: NotificationHeader, packet: PacketShared);

    fn on_subscribe_ack(&self, header: SubscribeHeader);

    fn on_subscribe_nack(&self, header: SubscribeHeader);

    fn on_unsubscribe_ack(&self, _header: SubscribeHeader) {}

    fn on_unsubscribe_nack(&self, _header: SubscribeHeader) {}

    /// Service instance availability as reported by service discovery.
    fn set_service_state(&self, up: bool);

    /// Connection availability of the underlying transport.
    fn on_connection_state(&self, _connected: bool) {}
}

pub trait MethodBackend: Send + Sync {
    fn on_response(&self, response: MethodResponse);

    /// `false` fails new calls fast with `ServiceNotAvailable` and cancels
    /// every pending promise with the same error before returning.
    fn set_service_state(&self, up: bool);

    fn on_connection_state(&self, _connected: bool) {}
}

pub trait FireAndForgetBackend: Send + Sync {
    fn set_service_state(&self, up: bool);

    fn on_connection_state(&self, _connected: bool) {}
}
