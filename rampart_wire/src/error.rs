use std::error::Error;
use std::fmt::Formatter;

/// The basic error type for this crate
#[derive(Debug)]
pub enum AddrError {
    /// Bad address/port syntax supplied by the caller
    Malformed(String),
    /// Name resolution failed; carries the resolver's message
    Resolution(String),
    /// An OS call failed
    System(std::io::Error),
    /// The caller supplied inconsistent sizes
    BadArgument(&'static str),
    /// A Local (unix-domain) address requires an explicit length
    AmbiguousLength,
    /// The operation is invalid for the current address family
    WrongFamily(&'static str),
}

impl Error for AddrError {}

impl std::fmt::Display for AddrError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AddrError::Malformed(err) => write!(f, "{err}"),
            AddrError::Resolution(err) => write!(f, "{err}"),
            AddrError::System(err) => write!(f, "{err}"),
            AddrError::BadArgument(err) => write!(f, "{err}"),
            AddrError::AmbiguousLength => write!(
                f,
                "the address length must be explicitly specified when setting Local addresses"
            ),
            AddrError::WrongFamily(err) => write!(f, "{err}"),
        }
    }
}

impl From<std::io::Error> for AddrError {
    fn from(err: std::io::Error) -> Self {
        AddrError::System(err)
    }
}

impl From<AddrError> for std::io::Error {
    fn from(val: AddrError) -> Self {
        match val {
            AddrError::System(err) => err,
            other => std::io::Error::new(std::io::ErrorKind::InvalidInput, other.to_string()),
        }
    }
}
