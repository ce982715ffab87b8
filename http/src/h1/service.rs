//! http/1 connection service: one call serves one accepted endpoint until
//! it closes, upgrades away or times out.

use core::{fmt, pin::pin};

use std::sync::Arc;

use bytes::BytesMut;
use http::{Request, Response};
use joist_server::net::Stream;
use joist_service::Service;
use tokio_util::sync::CancellationToken;

use crate::{
    body::ResponseBody,
    config::HttpConfig,
    customize::ConnectInfo,
    date::{DateTime, DateTimeService},
    error::{HttpServiceError, TimeoutError},
    io::AsyncIo,
    stats::{ConnectionGuard, ConnectorStats},
    tls::Accepted,
    upgrade::UpgradeHandler,
    util::timer::{KeepAlive, Timeout},
};

use super::{body::RequestBody, dispatcher};

pub struct H1Service<S, U, A> {
    pub(crate) cfg: HttpConfig,
    pub(crate) date: DateTimeService,
    pub(crate) service: S,
    pub(crate) upgrade: U,
    pub(crate) tls_acceptor: A,
    pub(crate) stats: Option<Arc<ConnectorStats>>,
}

impl<S, U, A> H1Service<S, U, A> {
    pub(crate) fn new(cfg: HttpConfig, service: S, upgrade: U, tls_acceptor: A, stats: Option<Arc<ConnectorStats>>) -> Self {
        Self {
            cfg,
            date: DateTimeService::new(),
            service,
            upgrade,
            tls_acceptor,
            stats,
        }
    }

    // keep alive timer starting at the tls accept deadline. the one timer
    // instance is reused for every deadline of the connection.
    fn keep_alive(&self) -> KeepAlive {
        let deadline = self.date.get().now() + self.cfg.tls_accept_timeout;
        KeepAlive::new(deadline)
    }
}

impl<S, U, A, TlsSt> Service<(Stream, CancellationToken)> for H1Service<S, U, A>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>>,
    S::Error: fmt::Debug,
    U: UpgradeHandler<TlsSt>,
    A: Service<tokio::net::TcpStream, Response = Accepted<TlsSt>>,
    TlsSt: AsyncIo,
    HttpServiceError<S::Error>: From<A::Error>,
{
    type Response = ();
    type Error = HttpServiceError<S::Error>;

    async fn call(&self, (stream, token): (Stream, CancellationToken)) -> Result<Self::Response, Self::Error> {
        let timer = self.keep_alive();
        let mut timer = pin!(timer);

        let Stream::Tcp(stream, peer_addr) = stream;
        let local_addr = stream.local_addr().ok();
        let stream = tokio::net::TcpStream::from_std(stream)?;

        let accepted = self
            .tls_acceptor
            .call(stream)
            .timeout(timer.as_mut())
            .await
            .map_err(|_| HttpServiceError::Timeout(TimeoutError::TlsAccept))??;

        let Accepted { mut io, tls } = accepted;

        let info = ConnectInfo {
            peer_addr,
            local_addr,
            secure: tls.is_some(),
            tls,
        };

        let guard = self.stats.clone().map(ConnectionGuard::new);

        dispatcher::run(
            &mut io,
            info,
            timer.as_mut(),
            &self.cfg,
            &self.service,
            &self.upgrade,
            self.date.get(),
            guard.as_ref(),
            &token,
            BytesMut::new(),
        )
        .await
        .map_err(Into::into)
    }
}

impl<S, U, A> H1Service<S, U, A> {
    /// serve a single already connected endpoint, e.g. an in memory one or
    /// an endpoint a detecting factory peeked at. `pre_read` carries bytes
    /// consumed before the hand over.
    pub async fn serve_io<Io>(
        &self,
        io: &mut Io,
        info: ConnectInfo,
        token: CancellationToken,
        pre_read: BytesMut,
    ) -> Result<(), HttpServiceError<S::Error>>
    where
        Io: AsyncIo,
        S: Service<Request<RequestBody>, Response = Response<ResponseBody>>,
        S::Error: fmt::Debug,
        U: UpgradeHandler<Io>,
    {
        let timer = self.keep_alive();
        let mut timer = pin!(timer);

        let guard = self.stats.clone().map(ConnectionGuard::new);

        dispatcher::run(
            io,
            info,
            timer.as_mut(),
            &self.cfg,
            &self.service,
            &self.upgrade,
            self.date.get(),
            guard.as_ref(),
            &token,
            pre_read,
        )
        .await
        .map_err(Into::into)
    }
}
