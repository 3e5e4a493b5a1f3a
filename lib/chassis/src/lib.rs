#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod ident;
pub mod integrity;
pub mod logging;
pub mod time;

pub use crate::ident::{
    ClientId, EventId, InstanceId, MajorVersion, MethodId, MinorVersion, ServiceId, SessionId,
};
pub use crate::integrity::IntegrityLevel;
