//! Representations of client and engine errors

use std::{error::Error as StdError, fmt, io::Error as IoError, string::FromUtf8Error};

use hyper::{self, StatusCode};

/// Type alias for results returned throughout this crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// No container engine socket was found at any candidate path
    EngineUnavailable,
    /// Connecting to the engine socket failed
    Connection { path: String, detail: String },
    /// The engine refused to upgrade the connection for an attached exec
    ConnectionNotUpgraded,
    SerdeJsonError(serde_json::Error),
    Hyper(hyper::Error),
    Http(http::Error),
    IO(IoError),
    Encoding(FromUtf8Error),
    /// An error status from the engine that maps to no more specific variant
    Fault { code: StatusCode, message: String },
    /// Container does not exist on the engine (HTTP 404)
    ContainerNotFound(String),
    /// Container exists but is not running (HTTP 409)
    ContainerNotRunning(String),
    /// Requested image does not exist (HTTP 404 on an image endpoint)
    ImageNotFound(String),
    /// Path does not exist, inside the container or on the host
    FileNotFound(String),
    /// Operation attempted on a closed session
    SessionClosed,
    /// Operation attempted on a container handle after shutdown
    ContainerClosed,
    /// A `send_and_wait` is already outstanding on this session
    CommandPending,
    /// The streamed result was requested before iteration completed
    StreamPending,
    InvalidParameter(String),
}

impl fmt::Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        match self {
            Error::EngineUnavailable => write!(
                f,
                "no container engine socket found; is Podman or Docker running?"
            ),
            Error::Connection { path, detail } => {
                write!(f, "cannot connect to socket at {}: {}", path, detail)
            }
            Error::ConnectionNotUpgraded => write!(
                f,
                "the engine did not upgrade the connection for an attached exec"
            ),
            Error::SerdeJsonError(err) => err.fmt(f),
            Error::Hyper(err) => err.fmt(f),
            Error::Http(err) => err.fmt(f),
            Error::IO(err) => err.fmt(f),
            Error::Encoding(err) => err.fmt(f),
            Error::Fault { code, message } => write!(f, "HTTP {}: {}", code, message),
            Error::ContainerNotFound(id) => write!(f, "container {}: not found", id),
            Error::ContainerNotRunning(id) => write!(f, "container {}: is not running", id),
            Error::ImageNotFound(image) => write!(f, "image not found: {}", image),
            Error::FileNotFound(path) => write!(f, "path not found: {}", path),
            Error::SessionClosed => write!(f, "session is closed"),
            Error::ContainerClosed => write!(f, "container handle has been shut down"),
            Error::CommandPending => write!(f, "another send_and_wait is already pending"),
            Error::StreamPending => {
                write!(f, "result not available until iteration completes")
            }
            Error::InvalidParameter(msg) => write!(f, "invalid parameter: {}", msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::SerdeJsonError(error)
    }
}

impl From<hyper::Error> for Error {
    fn from(error: hyper::Error) -> Self {
        Error::Hyper(error)
    }
}

impl From<http::Error> for Error {
    fn from(error: http::Error) -> Self {
        Error::Http(error)
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        Error::IO(error)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(error: FromUtf8Error) -> Self {
        Error::Encoding(error)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::SerdeJsonError(err) => Some(err),
            Error::Hyper(err) => Some(err),
            Error::Http(err) => Some(err),
            Error::IO(err) => Some(err),
            Error::Encoding(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use hyper::StatusCode;

    #[test]
    fn fault_displays_code_and_message() {
        let err = Error::Fault {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            message: "container state improper".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP 500 Internal Server Error: container state improper"
        );
    }

    #[test]
    fn domain_errors_name_their_subject() {
        assert_eq!(
            Error::ContainerNotFound("abc123".to_string()).to_string(),
            "container abc123: not found"
        );
        assert_eq!(
            Error::ImageNotFound("pocketdock/minimal".to_string()).to_string(),
            "image not found: pocketdock/minimal"
        );
    }
}
