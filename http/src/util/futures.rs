//! Biased two way select used by the dispatcher to race the service call
//! against io work on the same connection.

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project_lite::pin_project;

pub(crate) enum SelectOutput<A, B> {
    A(A),
    B(B),
}

pub(crate) trait Select: Sized {
    /// race two futures. `self` is polled first on every wake.
    fn select<B>(self, other: B) -> SelectFuture<Self, B>;
}

impl<F> Select for F
where
    F: Future,
{
    fn select<B>(self, other: B) -> SelectFuture<Self, B> {
        SelectFuture { a: self, b: other }
    }
}

pin_project! {
    pub(crate) struct SelectFuture<A, B> {
        #[pin]
        a: A,
        #[pin]
        b: B,
    }
}

impl<A, B> Future for SelectFuture<A, B>
where
    A: Future,
    B: Future,
{
    type Output = SelectOutput<A::Output, B::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(a) = this.a.poll(cx) {
            return Poll::Ready(SelectOutput::A(a));
        }

        this.b.poll(cx).map(SelectOutput::B)
    }
}
