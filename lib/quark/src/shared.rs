use std::io;
use std::net;

pub type IoResult<T> = Result<T, IoError>;

/// Reason a pipeline direction terminated.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseReason {
    /// Clean end-of-data.
    Completed,
    /// Non-clean termination.
    Lost,
    /// Deadline-based termination.
    Timeout,
}

impl CloseReason {
    #[inline]
    pub fn from_clean(clean: bool) -> CloseReason {
        match clean {
            true => CloseReason::Completed,
            false => CloseReason::Lost,
        }
    }

    #[inline]
    pub fn is_clean(self) -> bool {
        self == CloseReason::Completed
    }
}

/// Error plumbing shared by all pipeline components.
///
/// `Wait` and `MissingControl` are recoverable and must be handled locally by
/// callers; every other variant is terminal for the affected direction or
/// pipeline.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum IoError {
    /// The operation cannot make progress yet.
    Wait,
    /// The peer endpoint has no handler for a named control message.
    MissingControl,
    /// Caller violated the producer/consumer contract.
    Contract(&'static str),
    /// Operation against an already closed direction.
    Closed,
    /// Terminal end-of-data with the recorded close reason.
    Ended(CloseReason),
    /// A blocking reader or writer ran past its deadline.
    Timeout,
    /// Wire format or authentication violation.
    Protocol(&'static str),
    Io(io::ErrorKind),
}

impl From<io::Error> for IoError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => IoError::Wait,
            kind => IoError::Io(kind),
        }
    }
}

impl From<net::AddrParseError> for IoError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        IoError::Contract("malformed network address")
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for IoResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(IoError::Wait) => false,
            Err(IoError::MissingControl) => false,
            _ => true,
        }
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity
/// in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the
/// source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wouldblock_folds_to_wait() {
        let err: IoError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, IoError::Wait);

        let err: IoError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, IoError::Io(io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), IoError>(()).has_failed());
        assert!(!Err::<(), _>(IoError::Wait).has_failed());
        assert!(!Err::<(), _>(IoError::MissingControl).has_failed());
        assert!(Err::<(), _>(IoError::Closed).has_failed());
        assert!(Err::<(), _>(IoError::Ended(CloseReason::Lost)).has_failed());
        assert!(Err::<(), _>(IoError::Protocol("bad")).has_failed());
    }

    #[test]
    fn test_close_reason() {
        assert_eq!(CloseReason::from_clean(true), CloseReason::Completed);
        assert_eq!(CloseReason::from_clean(false), CloseReason::Lost);
        assert!(CloseReason::Completed.is_clean());
        assert!(!CloseReason::Timeout.is_clean());
    }
}
