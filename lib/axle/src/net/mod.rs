//! Transport plumbing: packet buffers, wire framing, the per-endpoint
//! connection state machine and the connection pool.

pub mod connection;
pub mod handler;
pub mod iobuf;
pub mod manager;
pub mod message;
pub mod packet;
pub mod transport;
