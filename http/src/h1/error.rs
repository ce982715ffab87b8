use core::fmt;

use std::io;

use crate::error::HttpServiceError;

use super::proto::error::ProtoError;

/// http/1 connection level error.
pub enum Error<S> {
    /// keep-alive timer expired between requests.
    KeepAliveExpire,
    /// no complete request head arrived in the configured time window.
    RequestTimeout,
    /// connection closed by the peer.
    Closed,
    /// service error. terminates the connection right away.
    Service(S),
    /// response body error. terminates the connection right away.
    Body(crate::body::BodyError),
    /// socket or runtime error. terminates the connection right away.
    Io(io::Error),
    /// protocol error. transformed into an error response before the
    /// connection shuts down.
    Proto(ProtoError),
}

impl<S> fmt::Debug for Error<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::KeepAliveExpire => f.write_str("keep-alive timer expired"),
            Self::RequestTimeout => f.write_str("request head timed out"),
            Self::Closed => f.write_str("closed"),
            Self::Service(ref e) => fmt::Debug::fmt(e, f),
            Self::Body(ref e) => fmt::Debug::fmt(e, f),
            Self::Io(ref e) => fmt::Debug::fmt(e, f),
            Self::Proto(ref e) => fmt::Debug::fmt(e, f),
        }
    }
}

impl<S> From<ProtoError> for Error<S> {
    fn from(e: ProtoError) -> Self {
        Self::Proto(e)
    }
}

impl<S> From<io::Error> for Error<S> {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof | ErrorKind::WriteZero => Self::Closed,
            _ => Self::Io(e),
        }
    }
}

impl<S> From<Error<S>> for HttpServiceError<S> {
    fn from(e: Error<S>) -> Self {
        match e {
            Error::Service(e) => Self::Service(e),
            e => Self::H1(e),
        }
    }
}
