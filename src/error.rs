/// Crate-wide error type.
use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Underlying socket read/write failed.
    SocketError,
    /// Packet body exceeded the maximum frame size.
    PacketTooLarge,
    /// Handshake MAC verification failed.
    BadHandshake,
    /// Auth packet could not be parsed into user/password/backend.
    BadAuthPacket,
    /// Server rejected credentials, with the message it sent back.
    AuthFailed(String),
    /// No such user in the authenticator's table.
    NoSuchUser,
    /// Wrong password for an existing user.
    InvalidPassword,
    /// Requested backend is not configured on the server.
    UnknownBackend,
    /// Dialing the backend failed.
    DialFailed,
    /// Tunnel write mutex observed a prior sticky error.
    TunnelClosed,
    /// Config file could not be read or parsed.
    ConfigError(String),
    /// IO error, preserving the original for logging.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SocketError => write!(f, "socket error"),
            Error::PacketTooLarge => write!(f, "packet exceeds maximum frame size"),
            Error::BadHandshake => write!(f, "handshake verification failed"),
            Error::BadAuthPacket => write!(f, "malformed auth packet"),
            Error::AuthFailed(msg) => write!(f, "auth failed: {}", msg),
            Error::NoSuchUser => write!(f, "no such user"),
            Error::InvalidPassword => write!(f, "invalid password"),
            Error::UnknownBackend => write!(f, "unknown backend"),
            Error::DialFailed => write!(f, "dial failed"),
            Error::TunnelClosed => write!(f, "tunnel closed"),
            Error::ConfigError(msg) => write!(f, "config error: {}", msg),
            Error::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}
