//! rustls backed tls acceptor. sni certificate selection is delegated to
//! the [ServerConfig] resolver; alpn picks the application protocol.

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use std::{
    io::{self, Write as _},
    sync::Arc,
};

use bytes::BufMut;
use futures_task::noop_waker;
use joist_service::Service;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::rustls::{ServerConfig, Writer};
use tokio_util::io::poll_read_buf;

use crate::{
    customize::TlsInfo,
    io::{AsyncIo, Interest, Ready},
};

use super::{Accepted, TlsError};

pub type RustlsConfig = Arc<ServerConfig>;

/// accept a plain endpoint and upgrade it to a [TlsStream] running the
/// configured next protocol.
#[derive(Clone)]
pub struct TlsAcceptorService {
    acceptor: tokio_rustls::TlsAcceptor,
    next_protocol: &'static str,
}

impl TlsAcceptorService {
    pub fn new(config: RustlsConfig, next_protocol: &'static str) -> Self {
        Self {
            acceptor: tokio_rustls::TlsAcceptor::from(config),
            next_protocol,
        }
    }
}

impl<Io> Service<Io> for TlsAcceptorService
where
    Io: AsyncIo + AsyncRead + AsyncWrite + Unpin,
{
    type Response = Accepted<TlsStream<Io>>;
    type Error = TlsError;

    async fn call(&self, io: Io) -> Result<Self::Response, Self::Error> {
        let mut stream = self.acceptor.accept(io).await?;

        let conn = &stream.get_ref().1;

        // an alpn outcome other than the configured next protocol ends the
        // session gracefully.
        if let Some(proto) = conn.alpn_protocol() {
            if !proto.eq_ignore_ascii_case(self.next_protocol.as_bytes()) {
                let _ = stream.shutdown().await;
                return Err(TlsError::NoMatchingProtocol);
            }
        }

        let tls = TlsInfo {
            cipher_suite: conn.negotiated_cipher_suite().map(|suite| format!("{:?}", suite.suite())),
            alpn_protocol: conn.alpn_protocol().map(<[u8]>::to_vec),
            server_name: conn.server_name().map(str::to_string),
        };

        Ok(Accepted {
            io: TlsStream { inner: stream },
            tls: Some(tls),
        })
    }
}

/// decrypted endpoint view over the tls session.
pub struct TlsStream<Io> {
    inner: tokio_rustls::server::TlsStream<Io>,
}

impl<Io> AsyncIo for TlsStream<Io>
where
    Io: AsyncIo + AsyncRead + AsyncWrite + Unpin,
{
    fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<Ready>> {
        self.inner.get_mut().0.ready(interest)
    }

    fn try_read_buf<B: BufMut>(&mut self, buf: &mut B) -> io::Result<usize> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        match poll_read_buf(Pin::new(&mut self.inner), &mut cx, buf) {
            Poll::Pending => Err(io::ErrorKind::WouldBlock.into()),
            Poll::Ready(res) => res,
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_with(self, |writer| writer.write(buf))
    }

    fn try_write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        match bufs.iter().find(|buf| !buf.is_empty()) {
            Some(buf) => self.try_write(buf),
            None => Ok(0),
        }
    }

    fn is_vectored_write(&self) -> bool {
        // the session layer frames writes on its own.
        false
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn write_with<Io, F>(stream: &mut TlsStream<Io>, func: F) -> io::Result<usize>
where
    Io: AsyncIo + AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&mut Writer<'_>) -> io::Result<usize>,
{
    let (io, conn) = stream.inner.get_mut();

    // drain session bytes left from an earlier blocked write.
    while conn.wants_write() {
        conn.write_tls(&mut WriteAdapter(io))?;
    }

    // write plaintext into the session buffer and push it towards the wire.
    // write_tls gives no completion guarantee; leftovers drain on the next
    // call.
    let n = func(&mut conn.writer())?;
    conn.write_tls(&mut WriteAdapter(io))?;

    Ok(n)
}

struct WriteAdapter<'a, Io>(&'a mut Io);

impl<Io: AsyncIo> io::Write for WriteAdapter<'_, Io> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
