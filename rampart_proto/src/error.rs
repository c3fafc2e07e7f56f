use std::fmt::Formatter;

use rampart_wire::AddrError;

use crate::proto::channel::RequestId;

/// The basic error type for this crate
#[derive(Debug)]
pub enum NetworkError {
    /// Socket-level error
    SocketError(String),
    /// The request outlived its deadline before a reply was produced
    RequestExpired(RequestId),
    /// The connection is draining or closed and accepts no further work
    ConnectionClosing(&'static str),
    /// The caller used the request API in a way the protocol forbids
    ProtocolViolation(&'static str),
    /// Error at the internal library level
    InternalError(&'static str),
    Generic(String),
}

impl std::error::Error for NetworkError {}

impl NetworkError {
    fn msg(&self) -> String {
        match self {
            NetworkError::SocketError(err) => err.clone(),
            NetworkError::RequestExpired(id) => {
                format!("request {id} expired before a reply was sent")
            }
            NetworkError::ConnectionClosing(err) => (*err).to_string(),
            NetworkError::ProtocolViolation(err) => (*err).to_string(),
            NetworkError::InternalError(err) => (*err).to_string(),
            NetworkError::Generic(err) => err.clone(),
        }
    }

    pub fn into_string(self) -> String {
        self.msg()
    }
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg())
    }
}

impl From<AddrError> for NetworkError {
    fn from(err: AddrError) -> Self {
        NetworkError::SocketError(err.to_string())
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        NetworkError::SocketError(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for NetworkError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        NetworkError::Generic(err.to_string())
    }
}
