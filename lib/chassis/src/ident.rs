//! Identifier types shared by every layer of the binding.
//!
//! The scalar ids are plain aliases; the composite instance ids are strong
//! types because wildcard handling differs between the required and the
//! provided flavour and must be enforced at construction time.

pub type ServiceId = u16;
pub type InstanceId = u16;
pub type MajorVersion = u8;
pub type MinorVersion = u32;
pub type MethodId = u16;
pub type EventId = u16;
pub type ClientId = u16;
pub type SessionId = u16;

/// Wildcard instance id, legal only in a required service instance.
pub const INSTANCE_ID_ANY: InstanceId = 0xFFFF;

/// Wildcard minor version, legal only in a required service instance.
pub const MINOR_VERSION_ANY: MinorVersion = 0xFFFF_FFFF;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IdentError {
    /// A wildcard value was used where a concrete id is required.
    WildcardNotAllowed,
}

/// Key of the dispatch graph: the part of an instance id that is present in
/// every message header.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ServiceInstanceId {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
}

/// Fully concrete identification of a service instance offered by a remote
/// process. Wildcards are rejected at construction, never checked at use.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ProvidedServiceInstanceId {
    service: ServiceId,
    instance: InstanceId,
    major: MajorVersion,
    minor: MinorVersion,
}

impl ProvidedServiceInstanceId {
    pub fn new(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<ProvidedServiceInstanceId, IdentError> {
        if instance == INSTANCE_ID_ANY || minor == MINOR_VERSION_ANY {
            return Err(IdentError::WildcardNotAllowed);
        }

        Ok(ProvidedServiceInstanceId {
            service,
            instance,
            major,
            minor,
        })
    }

    #[inline]
    pub fn service(&self) -> ServiceId {
        self.service
    }

    #[inline]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    #[inline]
    pub fn major(&self) -> MajorVersion {
        self.major
    }

    #[inline]
    pub fn minor(&self) -> MinorVersion {
        self.minor
    }

    /// The dispatch key carried by message headers for this instance.
    #[inline]
    pub fn service_instance(&self) -> ServiceInstanceId {
        ServiceInstanceId {
            service: self.service,
            instance: self.instance,
            major: self.major,
        }
    }
}

/// Possibly wildcarded reference to one or more provided instances.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RequiredServiceInstanceId {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub minor: MinorVersion,
}

impl RequiredServiceInstanceId {
    pub fn new(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> RequiredServiceInstanceId {
        RequiredServiceInstanceId {
            service,
            instance,
            major,
            minor,
        }
    }

    /// Checks whether a concrete provided instance satisfies this reference.
    /// The major version always requires an exact match.
    pub fn matches(&self, provided: &ProvidedServiceInstanceId) -> bool {
        self.service == provided.service()
            && self.major == provided.major()
            && (self.instance == INSTANCE_ID_ANY || self.instance == provided.instance())
            && (self.minor == MINOR_VERSION_ANY || self.minor == provided.minor())
    }
}

/// Abstract transport endpoint. Comparison is lexicographic by
/// (domain, port), equality is structural.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct UnicastAddress {
    pub domain: u32,
    pub port: u32,
}

impl UnicastAddress {
    #[inline]
    pub fn new(domain: u32, port: u32) -> UnicastAddress {
        UnicastAddress { domain, port }
    }
}

/// Per (client, method) session counter. Wraps around skipping 0; a fresh
/// sequence hands out 1 first.
#[derive(Debug, Clone)]
pub struct SessionSequence {
    next: SessionId,
}

impl SessionSequence {
    #[inline]
    pub fn new() -> SessionSequence {
        SessionSequence { next: 1 }
    }

    /// Returns the next session id and advances the counter.
    #[inline]
    pub fn next(&mut self) -> SessionId {
        let current = self.next;

        self.next = match self.next.wrapping_add(1) {
            0 => 1,
            value => value,
        };

        current
    }
}
