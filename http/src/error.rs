//! service level error types.

use core::{convert::Infallible, fmt};

use std::io;

use tracing::error;

use crate::tls::TlsError;

/// error of serving one connection.
pub enum HttpServiceError<S> {
    /// error detail was already handled elsewhere.
    Ignored,
    Service(S),
    Timeout(TimeoutError),
    Tls(TlsError),
    Io(io::Error),
    H1(crate::h1::Error<S>),
}

impl<S> fmt::Debug for HttpServiceError<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Ignored => f.write_str("error detail is ignored"),
            Self::Service(ref e) => fmt::Debug::fmt(e, f),
            Self::Timeout(ref e) => write!(f, "{e:?} timed out"),
            Self::Tls(ref e) => fmt::Debug::fmt(e, f),
            Self::Io(ref e) => fmt::Debug::fmt(e, f),
            Self::H1(ref e) => fmt::Debug::fmt(e, f),
        }
    }
}

impl<S> HttpServiceError<S>
where
    S: fmt::Debug,
{
    pub fn log(self, target: &str) {
        error!(target = target, ?self);
    }
}

/// async step that ran past its deadline.
#[derive(Debug)]
pub enum TimeoutError {
    TlsAccept,
}

impl<S> From<TlsError> for HttpServiceError<S> {
    fn from(e: TlsError) -> Self {
        Self::Tls(e)
    }
}

impl<S> From<io::Error> for HttpServiceError<S> {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl<S> From<Infallible> for HttpServiceError<S> {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}

impl<S> From<()> for HttpServiceError<S> {
    fn from(_: ()) -> Self {
        Self::Ignored
    }
}
