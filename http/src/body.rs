//! Response body types produced by handlers and streamed by the dispatcher.

use core::{
    pin::Pin,
    task::{Context, Poll},
};

use std::{boxed::Box, error};

use bytes::Bytes;
use futures_core::stream::Stream;

/// request/response body level error type.
pub type BodyError = Box<dyn error::Error + Send + Sync>;

type LocalBoxStream = Pin<Box<dyn Stream<Item = Result<Bytes, BodyError>>>>;

/// size hint of a response body, deciding between `content-length` and
/// `transfer-encoding: chunked` framing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BodySize {
    /// body with no bytes. responses that must not carry a body (1xx, 204,
    /// 304) also omit the length header.
    None,
    /// exact size known up front.
    Sized(usize),
    /// unknown total size. streamed chunked.
    Stream,
}

/// body of a response. handlers assign one of the three shapes; the
/// dispatcher consumes it as a [Stream] of [Bytes].
#[derive(Default)]
pub enum ResponseBody {
    #[default]
    None,
    Bytes(Bytes),
    Stream(LocalBoxStream),
}

impl ResponseBody {
    #[inline]
    pub fn none() -> Self {
        Self::None
    }

    #[inline]
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self::Bytes(bytes.into())
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BodyError>> + 'static,
    {
        Self::Stream(Box::pin(stream))
    }

    pub fn size(&self) -> BodySize {
        match self {
            Self::None => BodySize::None,
            Self::Bytes(bytes) => BodySize::Sized(bytes.len()),
            Self::Stream(_) => BodySize::Stream,
        }
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, BodyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this {
            Self::None => Poll::Ready(None),
            Self::Bytes(_) => {
                let Self::Bytes(bytes) = core::mem::take(this) else {
                    unreachable!()
                };
                if bytes.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(bytes)))
                }
            }
            Self::Stream(stream) => stream.as_mut().poll_next(cx),
        }
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&'static str> for ResponseBody {
    fn from(s: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for ResponseBody {
    fn from(s: String) -> Self {
        Self::Bytes(Bytes::from(s))
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}
