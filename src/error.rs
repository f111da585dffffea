//! Server error types and socket error classification.

use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Category of an error on an established client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketErrorKind {
    ConnectionRefused,
    RemoteHostClosed,
    HostNotFound,
    Timeout,
    Network,
    Other,
}

impl SocketErrorKind {
    /// Classify an I/O error from a client socket.
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => return SocketErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => return SocketErrorKind::RemoteHostClosed,
            io::ErrorKind::TimedOut => return SocketErrorKind::Timeout,
            io::ErrorKind::AddrNotAvailable => return SocketErrorKind::HostNotFound,
            io::ErrorKind::NotConnected => return SocketErrorKind::Network,
            _ => {}
        }

        match err.raw_os_error() {
            Some(libc::ENETDOWN) | Some(libc::ENETUNREACH) | Some(libc::ENETRESET) => {
                SocketErrorKind::Network
            }
            Some(libc::EHOSTUNREACH) | Some(libc::EHOSTDOWN) => SocketErrorKind::HostNotFound,
            _ => SocketErrorKind::Other,
        }
    }

    /// Short description used in log lines.
    pub fn description(&self) -> &'static str {
        match self {
            SocketErrorKind::ConnectionRefused => "connection refused",
            SocketErrorKind::RemoteHostClosed => "remote host closed the connection",
            SocketErrorKind::HostNotFound => "host not found",
            SocketErrorKind::Timeout => "connection timed out",
            SocketErrorKind::Network => "network error",
            SocketErrorKind::Other => "socket error",
        }
    }
}

impl fmt::Display for SocketErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Errors returned while starting or running the server.
#[derive(Debug)]
pub enum ServerError {
    /// The configured host/port did not form a socket address.
    InvalidAddress(String),
    /// Binding or listening on the address failed. Not retried.
    Bind { addr: SocketAddr, source: io::Error },
    /// Poll setup or the event loop itself failed.
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::InvalidAddress(addr) => write!(f, "Invalid listen address '{addr}'"),
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to start server on {addr}: {source}")
            }
            ServerError::Io(e) => write!(f, "Server I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::InvalidAddress(_) => None,
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_kind() {
        let cases = [
            (io::ErrorKind::ConnectionRefused, SocketErrorKind::ConnectionRefused),
            (io::ErrorKind::ConnectionReset, SocketErrorKind::RemoteHostClosed),
            (io::ErrorKind::BrokenPipe, SocketErrorKind::RemoteHostClosed),
            (io::ErrorKind::TimedOut, SocketErrorKind::Timeout),
            (io::ErrorKind::InvalidData, SocketErrorKind::Other),
        ];

        for (kind, expected) in cases {
            let err = io::Error::new(kind, "test");
            assert_eq!(SocketErrorKind::classify(&err), expected, "{kind:?}");
        }
    }

    #[test]
    fn test_classify_by_os_error() {
        let err = io::Error::from_raw_os_error(libc::ENETUNREACH);
        assert_eq!(SocketErrorKind::classify(&err), SocketErrorKind::Network);

        let err = io::Error::from_raw_os_error(libc::EHOSTUNREACH);
        assert_eq!(SocketErrorKind::classify(&err), SocketErrorKind::HostNotFound);

        let err = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert_eq!(
            SocketErrorKind::classify(&err),
            SocketErrorKind::RemoteHostClosed
        );
    }

    #[test]
    fn test_bind_error_display() {
        let err = ServerError::Bind {
            addr: "0.0.0.0:50001".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().starts_with("Failed to start server on 0.0.0.0:50001"));
    }
}
