//! In memory endpoint for driving the dispatcher without a socket.
//!
//! [MemoryIo] plays the server side of a connection over plain byte buffers.
//! The paired [MemoryHandle] is the remote peer: it feeds request bytes in,
//! observes everything the server wrote out and can half close the input.

use core::{
    future::{poll_fn, Future},
    pin::Pin,
    task::{Context, Poll, Waker},
};

use std::{cell::RefCell, io, rc::Rc};

use bytes::{BufMut, BytesMut};

use super::{AsyncIo, Interest, Ready};

#[derive(Default)]
struct Shared {
    // bytes travelling towards the server.
    input: BytesMut,
    input_closed: bool,
    // bytes the server has written.
    output: BytesMut,
    output_shutdown: bool,
    read_waker: Option<Waker>,
}

impl Shared {
    fn wake_read(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

/// server side endpoint of an in memory connection pair.
pub struct MemoryIo(Rc<RefCell<Shared>>);

/// peer side of an in memory connection pair.
pub struct MemoryHandle(Rc<RefCell<Shared>>);

/// construct a connected in memory endpoint pair.
pub fn pair() -> (MemoryIo, MemoryHandle) {
    let shared = Rc::new(RefCell::new(Shared::default()));
    (MemoryIo(shared.clone()), MemoryHandle(shared))
}

impl MemoryHandle {
    /// feed bytes for the server side to read.
    pub fn write(&self, bytes: &[u8]) {
        let mut shared = self.0.borrow_mut();
        shared.input.extend_from_slice(bytes);
        shared.wake_read();
    }

    /// close the input direction. the server observes EOF after the
    /// remaining bytes are drained.
    pub fn close(&self) {
        let mut shared = self.0.borrow_mut();
        shared.input_closed = true;
        shared.wake_read();
    }

    /// take every byte the server has written so far.
    pub fn output(&self) -> BytesMut {
        self.0.borrow_mut().output.split()
    }

    /// true after the server shut down its output direction.
    pub fn is_output_shutdown(&self) -> bool {
        self.0.borrow().output_shutdown
    }
}

impl AsyncIo for MemoryIo {
    fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<Ready>> {
        poll_fn(move |cx| {
            let mut shared = self.0.borrow_mut();

            let mut ready = Ready::EMPTY;
            if interest.is_writable() {
                ready |= Ready::WRITABLE;
            }
            if interest.is_readable() && (!shared.input.is_empty() || shared.input_closed) {
                ready |= Ready::READABLE;
            }

            if ready.is_empty() {
                shared.read_waker = Some(cx.waker().clone());
                Poll::Pending
            } else {
                Poll::Ready(Ok(ready))
            }
        })
    }

    fn try_read_buf<B: BufMut>(&mut self, buf: &mut B) -> io::Result<usize> {
        let mut shared = self.0.borrow_mut();
        if shared.input.is_empty() {
            return if shared.input_closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let bytes = shared.input.split();
        let len = bytes.len();
        buf.put_slice(&bytes);
        Ok(len)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.0.borrow_mut();
        if shared.output_shutdown {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        shared.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn try_write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        let mut written = 0;
        for buf in bufs {
            written += self.try_write(buf)?;
        }
        Ok(written)
    }

    fn is_vectored_write(&self) -> bool {
        false
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().0.borrow_mut().output_shutdown = true;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn read_write_round_trip() {
        let (mut io, handle) = pair();

        handle.write(b"ping");

        let ready = io.ready(Interest::READABLE).await.unwrap();
        assert!(ready.is_readable());

        let mut buf = BytesMut::new();
        assert_eq!(io.try_read_buf(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..], b"ping");

        assert!(matches!(
            io.try_read_buf(&mut buf),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock
        ));

        io.try_write(b"pong").unwrap();
        assert_eq!(&handle.output()[..], b"pong");
    }

    #[tokio::test]
    async fn eof_after_close() {
        let (mut io, handle) = pair();
        handle.write(b"x");
        handle.close();

        let mut buf = BytesMut::new();
        assert_eq!(io.try_read_buf(&mut buf).unwrap(), 1);
        assert_eq!(io.try_read_buf(&mut buf).unwrap(), 0);
    }
}
