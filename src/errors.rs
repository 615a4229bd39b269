//! Representations of various client errors

use hyper::{self, http, StatusCode};
use serde_json::Error as SerdeError;
use std::{error::Error as StdError, fmt, io::Error as IoError, string::FromUtf8Error};

#[derive(Debug)]
pub enum Error {
    SerdeJsonError(SerdeError),
    Hyper(hyper::Error),
    Http(http::Error),
    #[allow(clippy::upper_case_acronyms)]
    IO(IoError),
    Encoding(FromUtf8Error),
    #[cfg(feature = "tls")]
    Tls(openssl::error::ErrorStack),
    /// The daemon answered with a non-success status
    Fault {
        code: StatusCode,
        message: String,
    },
    /// The daemon reported an error inside a progress stream
    Daemon(String),
    UnsupportedScheme(String),
    MissingAuthority,
    InvalidGpuSpec(String),
    /// The model path ends without a directory name, like `/`
    InvalidModelPath(String),
    NonUnicodeModelName(String),
}

/// Alias used for every fallible operation in this crate
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// true when the daemon could not find the referenced container or image
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Fault {
                code: StatusCode::NOT_FOUND,
                ..
            }
        )
    }
}

impl From<SerdeError> for Error {
    fn from(error: SerdeError) -> Error {
        Error::SerdeJsonError(error)
    }
}

impl From<hyper::Error> for Error {
    fn from(error: hyper::Error) -> Error {
        Error::Hyper(error)
    }
}

impl From<http::Error> for Error {
    fn from(error: http::Error) -> Error {
        Error::Http(error)
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IO(error)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(error: FromUtf8Error) -> Error {
        Error::Encoding(error)
    }
}

#[cfg(feature = "tls")]
impl From<openssl::error::ErrorStack> for Error {
    fn from(error: openssl::error::ErrorStack) -> Error {
        Error::Tls(error)
    }
}

impl fmt::Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        match self {
            Error::SerdeJsonError(ref err) => err.fmt(f),
            Error::Http(ref err) => err.fmt(f),
            Error::Hyper(ref err) => err.fmt(f),
            Error::IO(ref err) => err.fmt(f),
            Error::Encoding(ref err) => err.fmt(f),
            #[cfg(feature = "tls")]
            Error::Tls(ref err) => err.fmt(f),
            Error::Fault { code, message } => write!(f, "{}: {}", code, message),
            Error::Daemon(message) => write!(f, "{}", message),
            Error::UnsupportedScheme(scheme) => write!(f, "Unsupported scheme '{}'", scheme),
            Error::MissingAuthority => write!(f, "Provided scheme is missing an authority"),
            Error::InvalidGpuSpec(spec) => write!(f, "Invalid GPU selection '{}'", spec),
            Error::InvalidModelPath(path) => {
                write!(f, "Model path '{}' has no final component", path)
            }
            Error::NonUnicodeModelName(path) => {
                write!(f, "Model directory name in '{}' is not valid UTF-8", path)
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::SerdeJsonError(ref err) => Some(err),
            Error::Http(ref err) => Some(err),
            Error::Hyper(ref err) => Some(err),
            Error::IO(ref err) => Some(err),
            Error::Encoding(ref err) => Some(err),
            #[cfg(feature = "tls")]
            Error::Tls(ref err) => Some(err),
            _ => None,
        }
    }
}
