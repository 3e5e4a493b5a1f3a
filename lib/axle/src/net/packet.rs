use std::sync::Arc;

/// Contiguous message buffer.
///
/// Storage is intentionally not zero-initialised: every byte is overwritten
/// either by the serialiser or by the transport read before it is observed,
/// and the zeroing cost is measurable at automotive message rates.
///
/// While a packet is uniquely owned it can be mutated; once converted into a
/// [`PacketShared`] the bytes are immutable for the rest of their lifetime,
/// which makes fan-out to multiple subscribers and concurrent tracing sound.
pub struct Packet {
    data: Box<[u8]>,
}

/// Shared handle under which completed packets travel through the stack.
pub type PacketShared = Arc<Packet>;

impl Packet {
    /// Allocates a packet of `len` bytes without initialising the storage.
    #[inline]
    pub fn uninit(len: usize) -> Packet {
        let mut data = Vec::with_capacity(len);
        unsafe { data.set_len(len) };

        Packet {
            data: data.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn from_vec(data: Vec<u8>) -> Packet {
        Packet {
            data: data.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access, only available before the packet is shared.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Freezes the packet into its shared form.
    #[inline]
    pub fn share(self) -> PacketShared {
        Arc::new(self)
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Packet) -> bool {
        self.data == other.data
    }
}

impl Eq for Packet {}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet({} bytes)", self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uninit_len_and_overwrite() {
        let mut packet = Packet::uninit(64);
        assert_eq!(packet.len(), 64);

        for byte in packet.bytes_mut() {
            *byte = 0xAB;
        }

        let shared = packet.share();
        assert!(shared.bytes().iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_zero_length_packet() {
        let packet = Packet::uninit(0);
        assert_eq!(packet.len(), 0);
        assert!(packet.bytes().is_empty());
    }

    #[test]
    fn test_shared_handles_alias_same_bytes() {
        let mut packet = Packet::uninit(4);
        packet.bytes_mut().copy_from_slice(&[1, 2, 3, 4]);

        let first = packet.share();
        let second = first.clone();

        assert_eq!(first.bytes(), second.bytes());
        assert_eq!(Arc::strong_count(&first), 2);
    }
}
