use crate::value::SyntaxError;
use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-severity error model for all transport paths: `Wait` means the
/// operation would block and should be retried on the next readiness or
/// timer; `Fatal` terminates the connection.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    /// The peer closed the stream.
    Closed,
    /// A stage deadline or the idle timeout elapsed.
    TimedOut,
    /// The negotiation timestamp is outside the replay window.
    Expired,
    /// The asserted identity does not hash from the supplied public key.
    IdentityMismatch,
    /// The possession proof does not verify.
    ProofMismatch,
    /// The requested protocol has no registered handler.
    UnsupportedProtocol,
    /// The peer violated the negotiated protocol.
    ProtocolViolation,
    /// Undecodable bytes on the ciphered stream.
    Syntax(SyntaxError),
    /// A buffer limit was exceeded.
    Overrun,
    /// Key material failed to parse or agree.
    Crypto,
    /// The remote sent `(bye ...)`.
    ByeReceived,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

impl From<SyntaxError> for NetworkError {
    #[inline]
    fn from(err: SyntaxError) -> Self {
        NetworkError::Fatal(ErrorType::Syntax(err))
    }
}

pub trait ErrorUtils {
    /// True for fatal failures; `Wait` does not count.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}
