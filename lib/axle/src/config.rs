//! Runtime limits applied per connection. Loaded from TOML where deployments
//! provide one; the defaults match the plain stream transport.

use serde_derive::{Deserialize, Serialize};

const DEFAULT_MAX_MESSAGE_LENGTH: u32 = 64 * 1024;
const DEFAULT_SEND_QUEUE_LIMIT: usize = 1;
const DEFAULT_HANDSHAKE_PROTOCOL_VERSION: u16 = 1;
const DEFAULT_S2C_BUFFER_SIZE_HINT: u64 = 512 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on `total_length` of a received message. Larger messages
    /// are discarded byte-by-byte without allocation.
    pub max_message_length: u32,

    /// Ceiling of the per-connection send queue. The plain stream transport
    /// keeps this at 1; transports with per-frame overhead may raise it.
    pub send_queue_limit: usize,

    /// Version field of the first handshake message.
    pub handshake_protocol_version: u16,

    /// Hint for the size of the server-to-client buffer, forwarded verbatim
    /// in the first handshake message.
    pub s2c_buffer_size_hint: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            send_queue_limit: DEFAULT_SEND_QUEUE_LIMIT,
            handshake_protocol_version: DEFAULT_HANDSHAKE_PROTOCOL_VERSION,
            s2c_buffer_size_hint: DEFAULT_S2C_BUFFER_SIZE_HINT,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(config: &str) -> Result<RuntimeConfig, serdeconv::Error> {
        serdeconv::from_toml_str(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();

        assert_eq!(config.max_message_length, 64 * 1024);
        assert_eq!(config.send_queue_limit, 1);
        assert_eq!(config.handshake_protocol_version, 1);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = RuntimeConfig::from_toml_str(
            r#"
max_message_length = 1024
send_queue_limit = 4
"#,
        )
        .unwrap();

        assert_eq!(config.max_message_length, 1024);
        assert_eq!(config.send_queue_limit, 4);
        assert_eq!(config.handshake_protocol_version, 1);
    }

    #[test]
    fn test_garbage_toml_is_rejected() {
        assert!(RuntimeConfig::from_toml_str("max_message_length = \"many\"").is_err());
    }
}
