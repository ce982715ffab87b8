//! Request body as an async spsc channel between the connection task and the
//! handler consuming the body.

use core::{
    future::{poll_fn, Future},
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use std::{
    cell::{RefCell, RefMut},
    collections::VecDeque,
    io,
    rc::Rc,
};

use bytes::Bytes;
use futures_core::stream::Stream;
use http::header::HeaderMap;

// buffered body bytes past this size stop the connection from decoding
// until the consumer catches up.
pub(crate) const MAX_BUFFER_SIZE: usize = 32_768;

#[derive(Clone, Debug)]
enum Inner {
    Some(Rc<RefCell<Shared>>),
    None,
}

impl Inner {
    fn new(eof: bool) -> Self {
        match eof {
            true => Self::None,
            false => Self::Some(Rc::new(RefCell::new(Shared::default()))),
        }
    }
}

/// Buffered stream of request body chunks.
///
/// impl [Stream] producing [Bytes] chunks. after the stream ends
/// [RequestBody::trailers] exposes the trailer field set of a chunked body.
#[derive(Debug)]
pub struct RequestBody(Inner);

impl Default for RequestBody {
    fn default() -> Self {
        Self(Inner::None)
    }
}

impl RequestBody {
    // an async spsc channel. [RequestBodySender] pushes decoded chunks,
    // RequestBody pops them.
    pub(crate) fn channel(eof: bool) -> (RequestBodySender, Self) {
        let inner = Inner::new(eof);
        (RequestBodySender(inner.clone()), RequestBody(inner))
    }

    /// trailer fields of a chunked request body. present only after the
    /// body stream returned its end.
    pub fn trailers(&self) -> Option<HeaderMap> {
        match self.0 {
            Inner::Some(ref inner) => inner.borrow().trailers.clone(),
            Inner::None => None,
        }
    }
}

impl Stream for RequestBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().0 {
            Inner::Some(ref mut inner) => inner.borrow_mut().poll_next_unpin(cx),
            Inner::None => Poll::Ready(None),
        }
    }
}

/// connection side of the body channel.
pub(crate) struct RequestBodySender(Inner);

impl Drop for RequestBodySender {
    fn drop(&mut self) {
        // connection dropped the sender before the body completed.
        if let Some(mut inner) = self.try_inner() {
            if !inner.eof {
                inner.feed_error(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }
}

impl RequestBodySender {
    /// true when the consumer half was dropped without reaching the body
    /// end. nothing will ever read the remaining bytes.
    pub(crate) fn receiver_gone(&self) -> bool {
        match self.0 {
            Inner::Some(ref inner) => Rc::strong_count(inner) == 1,
            Inner::None => true,
        }
    }

    fn try_inner(&mut self) -> Option<RefMut<'_, Shared>> {
        match self.0 {
            // when the consumer half is gone feeding more data is wasted
            // work. the strong count check detects it without a poll.
            Inner::Some(ref inner) => (Rc::strong_count(inner) != 1).then(|| inner.borrow_mut()),
            Inner::None => None,
        }
    }

    pub(crate) fn feed_error(&mut self, e: io::Error) {
        if let Some(mut inner) = self.try_inner() {
            inner.feed_error(e);
        }
    }

    pub(crate) fn feed_eof(&mut self) {
        if let Some(mut inner) = self.try_inner() {
            inner.feed_eof();
        }
    }

    pub(crate) fn feed_trailers(&mut self, trailers: HeaderMap) {
        if let Some(mut inner) = self.try_inner() {
            inner.trailers = Some(trailers);
        }
    }

    pub(crate) fn feed_data(&mut self, data: Bytes) {
        if let Some(mut inner) = self.try_inner() {
            inner.feed_data(data);
        }
    }

    /// resolve when the consumer is able to take more data.
    pub(crate) fn ready(&mut self) -> impl Future<Output = io::Result<()>> + '_ {
        self.ready_with(|inner| !inner.backpressure())
    }

    /// resolve when the consumer started polling the body. used to delay
    /// the interim continue response until the handler wants the body.
    pub(crate) fn wait_for_poll(&mut self) -> impl Future<Output = io::Result<()>> + '_ {
        self.ready_with(|inner| inner.waiting())
    }

    async fn ready_with<F>(&mut self, func: F) -> io::Result<()>
    where
        F: Fn(&mut Shared) -> bool,
    {
        poll_fn(|cx| match self.try_inner() {
            Some(mut inner) => {
                if func(inner.deref_mut()) {
                    Poll::Ready(Ok(()))
                } else {
                    inner.register_io(cx);
                    Poll::Pending
                }
            }
            // consumer half is gone.
            None => Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into())),
        })
        .await
    }
}

#[derive(Debug, Default)]
struct Shared {
    eof: bool,
    // set on the first consumer poll, even when the body is already at its
    // end. drives the lazy continue response for empty expected bodies.
    polled: bool,
    len: usize,
    err: Option<io::Error>,
    items: VecDeque<Bytes>,
    trailers: Option<HeaderMap>,
    task: Option<Waker>,
    io_task: Option<Waker>,
}

impl Shared {
    // wake the task waiting for body data.
    fn wake(&mut self) {
        if let Some(waker) = self.task.take() {
            waker.wake();
        }
    }

    // wake the connection task feeding the channel.
    fn wake_io(&mut self) {
        if let Some(waker) = self.io_task.take() {
            waker.wake();
        }
    }

    // true once the consumer wants body data.
    fn waiting(&self) -> bool {
        self.task.is_some() || self.polled
    }

    fn register(&mut self, cx: &Context<'_>) {
        if self.task.as_ref().map(|w| !cx.waker().will_wake(w)).unwrap_or(true) {
            self.task = Some(cx.waker().clone());
        }
    }

    fn register_io(&mut self, cx: &Context<'_>) {
        if self.io_task.as_ref().map(|w| !cx.waker().will_wake(w)).unwrap_or(true) {
            self.io_task = Some(cx.waker().clone());
        }
    }

    fn feed_error(&mut self, err: io::Error) {
        self.err = Some(err);
        self.wake();
    }

    fn feed_eof(&mut self) {
        self.eof = true;
        self.wake();
    }

    fn feed_data(&mut self, data: Bytes) {
        self.len += data.len();
        self.items.push_back(data);
        self.wake();
    }

    fn backpressure(&self) -> bool {
        self.len >= MAX_BUFFER_SIZE
    }

    fn poll_next_unpin(&mut self, cx: &Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        if !self.polled {
            self.polled = true;
            self.wake_io();
        }
        if let Some(data) = self.items.pop_front() {
            self.len -= data.len();
            Poll::Ready(Some(Ok(data)))
        } else if let Some(err) = self.err.take() {
            Poll::Ready(Some(Err(err)))
        } else if self.eof {
            Poll::Ready(None)
        } else {
            self.register(cx);
            self.wake_io();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use futures_core::Stream;

    fn poll_once(body: &mut RequestBody) -> Poll<Option<io::Result<Bytes>>> {
        let waker = futures_task::noop_waker_ref();
        let mut cx = Context::from_waker(waker);
        Pin::new(body).poll_next(&mut cx)
    }

    #[test]
    fn channel_data_then_eof() {
        let (mut tx, mut body) = RequestBody::channel(false);

        tx.feed_data(Bytes::from_static(b"abc"));
        match poll_once(&mut body) {
            Poll::Ready(Some(Ok(bytes))) => assert_eq!(&bytes[..], b"abc"),
            _ => panic!("expected data"),
        }

        tx.feed_trailers(HeaderMap::new());
        tx.feed_eof();
        assert!(matches!(poll_once(&mut body), Poll::Ready(None)));
        assert!(body.trailers().is_some());
    }

    #[test]
    fn dropped_sender_is_an_error() {
        let (tx, mut body) = RequestBody::channel(false);
        drop(tx);
        assert!(matches!(poll_once(&mut body), Poll::Ready(Some(Err(_)))));
    }
}
