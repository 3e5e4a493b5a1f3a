use std::io;

pub type NetResult<T> = Result<T, NetError>;

/// Two-level error plumbing for the non-blocking IO paths: `Wait` means the
/// operation could not make progress and should be retried on the next
/// readiness event, `Fatal` means the connection is beyond repair.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(ErrorKind),
}

/// Error kinds surfaced across component boundaries.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// Operation on a torn-down connection.
    Disconnected,
    /// Send queue at its ceiling; the packet was dropped.
    QueueFull,
    /// A message header failed length or field validation.
    MalformedMessage,
    /// The peer's integrity level is below the expected one.
    IntegrityLevelTooLow,
    /// Failure during the 3-message connection establishment exchange.
    HandshakeFailed,
    /// IO error on an established connection. The only disconnect reason
    /// after which an automatic reconnect is legal.
    CommunicationFailure,
    /// Service discovery reported the instance down or the connection is
    /// gone; pending calls are cancelled with this kind.
    ServiceNotAvailable,
    UnknownServiceId,
    UnknownInstanceId,
    UnknownMethodId,
    /// Allocation or resource limit failure.
    ResourceExhausted,
    Io(io::ErrorKind),
}

impl ErrorKind {
    /// Collapses transport-level IO errors into the disconnect reason
    /// subscribers observe. Callers compare the result against
    /// `CommunicationFailure` to decide whether a reconnect is allowed.
    #[inline]
    pub fn as_disconnect_reason(self) -> ErrorKind {
        match self {
            ErrorKind::Io(_) => ErrorKind::CommunicationFailure,
            kind => kind,
        }
    }
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetError::Wait);
    }

    #[test]
    fn test_io_error_folds_to_fatal() {
        let err: NetError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(
            err,
            NetError::Fatal(ErrorKind::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_disconnect_reason_collapses_io() {
        assert_eq!(
            ErrorKind::Io(io::ErrorKind::ConnectionReset).as_disconnect_reason(),
            ErrorKind::CommunicationFailure
        );
        assert_eq!(
            ErrorKind::IntegrityLevelTooLow.as_disconnect_reason(),
            ErrorKind::IntegrityLevelTooLow
        );
    }

    #[test]
    fn test_wait_has_not_failed() {
        let result: NetResult<()> = Err(NetError::Wait);
        assert!(!result.has_failed());

        let result: NetResult<()> = Err(NetError::Fatal(ErrorKind::MalformedMessage));
        assert!(result.has_failed());
    }
}
