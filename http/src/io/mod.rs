//! Readiness based endpoint abstraction the h1 dispatcher runs on.
//!
//! An endpoint is a non blocking bidirectional byte channel: `try_read_buf`
//! and `try_write*` never park the task and signal exhaustion with
//! [io::ErrorKind::WouldBlock]; [AsyncIo::ready] is the async registration
//! point for read/write interest.

pub mod memory;

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use std::io;

use bytes::BufMut;

pub use tokio::io::{Interest, Ready};

pub trait AsyncIo: Unpin {
    /// async wait until the endpoint is ready for the given interest.
    ///
    /// a zero byte read after read readiness means the peer shut down its
    /// sending half.
    fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<Ready>>;

    /// non blocking read into the given buffer. `Ok(0)` signals input EOF.
    fn try_read_buf<B: BufMut>(&mut self, buf: &mut B) -> io::Result<usize>;

    /// non blocking write from the given slice.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// non blocking vectored write.
    fn try_write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize>;

    /// hint whether vectored writes are worth gathering for.
    fn is_vectored_write(&self) -> bool;

    /// shut down the output direction of the endpoint.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

macro_rules! net_impl {
    ($ty: ty) => {
        impl AsyncIo for $ty {
            #[inline]
            fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<Ready>> {
                <$ty>::ready(&*self, interest)
            }

            #[inline]
            fn try_read_buf<B: BufMut>(&mut self, buf: &mut B) -> io::Result<usize> {
                <$ty>::try_read_buf(&*self, buf)
            }

            #[inline]
            fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
                <$ty>::try_write(&*self, buf)
            }

            #[inline]
            fn try_write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
                <$ty>::try_write_vectored(&*self, bufs)
            }

            #[inline]
            fn is_vectored_write(&self) -> bool {
                true
            }

            #[inline]
            fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                tokio::io::AsyncWrite::poll_shutdown(self, cx)
            }
        }
    };
}

net_impl!(tokio::net::TcpStream);

#[cfg(unix)]
net_impl!(tokio::net::UnixStream);

impl<Io> AsyncIo for &mut Io
where
    Io: AsyncIo,
{
    #[inline]
    fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<Ready>> {
        (**self).ready(interest)
    }

    #[inline]
    fn try_read_buf<B: BufMut>(&mut self, buf: &mut B) -> io::Result<usize> {
        (**self).try_read_buf(buf)
    }

    #[inline]
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).try_write(buf)
    }

    #[inline]
    fn try_write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        (**self).try_write_vectored(bufs)
    }

    #[inline]
    fn is_vectored_write(&self) -> bool {
        (**self).is_vectored_write()
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut **self.get_mut()).poll_shutdown(cx)
    }
}
