use std::fmt;
use std::io;

/// Result of an operation that may need the caller to retry later rather
/// than treat the condition as an actual failure. Mirrors
/// `neutronium::net::shared::NetworkError`.
pub type GwResult<T> = Result<T, GwError>;

#[derive(Debug)]
pub enum GwError {
    /// Not an error — the operation would block and should be retried once
    /// the socket is ready again.
    Wait,
    Fatal(FaultKind),
}

#[derive(Debug)]
pub enum FaultKind {
    Io(io::ErrorKind),
    AddrParse,
    Socks5(String),
    Protocol(String),
    Login(String),
}

impl GwError {
    #[inline]
    pub fn fatal<S: Into<String>>(kind: fn(String) -> FaultKind, message: S) -> GwError {
        GwError::Fatal(kind(message.into()))
    }
}

impl fmt::Display for GwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GwError::Wait => write!(f, "operation would block"),
            GwError::Fatal(kind) => write!(f, "{:?}", kind),
        }
    }
}

impl std::error::Error for GwError {}

impl From<io::Error> for GwError {
    #[inline]
    fn from(err: io::Error) -> GwError {
        match err.kind() {
            io::ErrorKind::WouldBlock => GwError::Wait,
            kind => GwError::Fatal(FaultKind::Io(kind)),
        }
    }
}

impl From<std::net::AddrParseError> for GwError {
    #[inline]
    fn from(_: std::net::AddrParseError) -> GwError {
        GwError::Fatal(FaultKind::AddrParse)
    }
}

/// Convenience trait so call sites can write `result.has_failed()` rather
/// than match out `GwError::Wait` by hand every time.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for GwResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(GwError::Wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_is_not_a_failure() {
        let r: GwResult<()> = Err(GwError::Wait);
        assert!(!r.has_failed());
    }

    #[test]
    fn fatal_is_a_failure() {
        let r: GwResult<()> = Err(GwError::Fatal(FaultKind::Protocol("boom".to_string())));
        assert!(r.has_failed());
    }

    #[test]
    fn would_block_io_error_converts_to_wait() {
        let io_err = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(matches!(GwError::from(io_err), GwError::Wait));
    }
}
