//! Safety qualification levels of IPC peer processes.

/// Integrity level of a process, as reported by the transport layer for the
/// remote peer. The ordering is total: QM < ASIL A < B < C < D.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum IntegrityLevel {
    Qm = 0,
    AsilA = 1,
    AsilB = 2,
    AsilC = 3,
    AsilD = 4,
}

/// Identity of the remote process once the transport is connected.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PeerCredentials {
    pub process_id: u64,
    pub integrity_level: IntegrityLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(IntegrityLevel::Qm < IntegrityLevel::AsilA);
        assert!(IntegrityLevel::AsilA < IntegrityLevel::AsilB);
        assert!(IntegrityLevel::AsilB < IntegrityLevel::AsilC);
        assert!(IntegrityLevel::AsilC < IntegrityLevel::AsilD);
        assert!(IntegrityLevel::AsilD >= IntegrityLevel::AsilD);
    }
}
