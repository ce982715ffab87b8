//! tls acceptor services wrapping an accepted endpoint before the next
//! protocol factory runs on the decrypted stream.

#[cfg(feature = "rustls")]
pub mod rustls;

use core::fmt;

use std::io;

use joist_service::Service;

use crate::customize::TlsInfo;

/// outcome of the tls accept step: the (possibly decrypted) endpoint plus
/// session facts for the secure request customizer.
pub struct Accepted<Io> {
    pub io: Io,
    pub tls: Option<TlsInfo>,
}

/// tls layer error.
pub enum TlsError {
    /// handshake or io failure during accept.
    Io(io::Error),
    /// the negotiated application protocol does not match the configured
    /// next protocol. the session was closed gracefully.
    NoMatchingProtocol,
}

impl fmt::Debug for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => fmt::Debug::fmt(e, f),
            Self::NoMatchingProtocol => f.write_str("no matching application protocol negotiated"),
        }
    }
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<io::Error> for TlsError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// pass through acceptor for plain text endpoints.
#[derive(Clone, Copy, Default)]
pub struct NoOpTlsAcceptor;

impl<Io> Service<Io> for NoOpTlsAcceptor {
    type Response = Accepted<Io>;
    type Error = TlsError;

    async fn call(&self, io: Io) -> Result<Self::Response, Self::Error> {
        Ok(Accepted { io, tls: None })
    }
}
