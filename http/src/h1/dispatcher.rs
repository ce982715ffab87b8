//! Per connection http/1 driver: fills the read buffer, decodes request
//! heads, bridges body decoding to the handler service and streams the
//! response back out, honoring pipelining, expectations and upgrades.

use core::{
    convert::Infallible,
    future::{pending, poll_fn, Future},
    pin::{pin, Pin},
    time::Duration,
};

use std::io;

use bytes::BytesMut;
use futures_core::stream::Stream;
use http::{
    header::{HeaderMap, HeaderValue, CONNECTION, UPGRADE},
    Request, Response, StatusCode,
};
use joist_service::Service;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::{
    body::{BodySize, ResponseBody},
    config::HttpConfig,
    customize::ConnectInfo,
    date::DateTime,
    io::{AsyncIo, Interest, Ready},
    stats::ConnectionGuard,
    upgrade::{OnUpgrade, UpgradeHandler},
    util::{
        buffered::{BufWrite, BufferedIo, ListWriteBuf, ReadBuf, WriteBuf},
        futures::{Select, SelectOutput},
        timer::{KeepAlive, KeepAliveExpired, Timeout},
    },
};

use super::{
    body::{RequestBody, RequestBodySender},
    error::Error,
    proto::{
        buf_write::H1BufWrite,
        codec::{ChunkResult, TransferCoding},
        context::{ConnectionType, Context},
        decode::Decoded,
        error::ProtoError,
    },
};

/// run an http/1 connection to completion, generic over the write buffer
/// strategy the endpoint profits from.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run<Io, S, U, D>(
    io: &mut Io,
    info: ConnectInfo,
    timer: Pin<&mut KeepAlive>,
    cfg: &HttpConfig,
    service: &S,
    upgrade: &U,
    date: &D,
    stats: Option<&ConnectionGuard>,
    shutdown: &CancellationToken,
    pre_read: BytesMut,
) -> Result<(), Error<S::Error>>
where
    Io: AsyncIo,
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>>,
    U: UpgradeHandler<Io>,
    D: DateTime,
{
    let read_buf = ReadBuf::with_bytes(cfg.read_buf_size, pre_read);

    if cfg.vectored_write && io.is_vectored_write() {
        let write_buf = ListWriteBuf::new(cfg.write_buf_size, cfg.output_aggregation_size);
        Dispatcher::new(io, read_buf, write_buf, info, timer, cfg, service, upgrade, date, stats, shutdown)
            .run()
            .await
    } else {
        let write_buf = WriteBuf::new(cfg.write_buf_size);
        Dispatcher::new(io, read_buf, write_buf, info, timer, cfg, service, upgrade, date, stats, shutdown)
            .run()
            .await
    }
}

struct Dispatcher<'a, Io, S, U, W, D> {
    io: BufferedIo<'a, Io, W>,
    info: ConnectInfo,
    timer: Pin<&'a mut KeepAlive>,
    cfg: &'a HttpConfig,
    ctx: Context<'a, D>,
    service: &'a S,
    upgrade: &'a U,
    stats: Option<&'a ConnectionGuard>,
    shutdown: &'a CancellationToken,
}

enum Run {
    /// keep serving requests on this connection.
    Continue,
    /// the endpoint was handed to another protocol.
    Detached,
    /// graceful stop observed between requests.
    Shutdown,
}

impl<'a, Io, S, U, W, D> Dispatcher<'a, Io, S, U, W, D>
where
    Io: AsyncIo,
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>>,
    U: UpgradeHandler<Io>,
    W: H1BufWrite,
    D: DateTime,
{
    #[allow(clippy::too_many_arguments)]
    fn new(
        io: &'a mut Io,
        read_buf: ReadBuf,
        write_buf: W,
        info: ConnectInfo,
        timer: Pin<&'a mut KeepAlive>,
        cfg: &'a HttpConfig,
        service: &'a S,
        upgrade: &'a U,
        date: &'a D,
        stats: Option<&'a ConnectionGuard>,
        shutdown: &'a CancellationToken,
    ) -> Self {
        let ctx = Context::new(info.peer_addr, date, info.secure);
        Self {
            io: BufferedIo::new(io, read_buf, write_buf),
            info,
            timer,
            cfg,
            ctx,
            service,
            upgrade,
            stats,
            shutdown,
        }
    }

    async fn run(mut self) -> Result<(), Error<S::Error>> {
        let res = self.run_loop().await;
        if let Some(stats) = self.stats {
            stats.add_bytes(self.io.bytes_read, self.io.bytes_written);
        }
        match res {
            Err(Error::Closed) => Ok(()),
            res => res,
        }
    }

    async fn run_loop(&mut self) -> Result<(), Error<S::Error>> {
        loop {
            match self.ctx.ctype() {
                ConnectionType::Init => self.update_timer(self.cfg.request_head_timeout),
                ConnectionType::KeepAlive => self.update_timer(self.cfg.keep_alive_timeout),
                ConnectionType::Close => return self.io.shutdown().await.map_err(Into::into),
                ConnectionType::Upgrade => return Ok(()),
            }

            match self.serve().await {
                Ok(Run::Continue) => {}
                Ok(Run::Detached) => return Ok(()),
                Ok(Run::Shutdown) => {
                    trace!(target: "h1_dispatcher", "graceful stop. closing after in flight work");
                    self.ctx.set_ctype(ConnectionType::Close);
                }
                Err(Error::KeepAliveExpire) => match self.ctx.ctype() {
                    ConnectionType::Init => {
                        trace!(target: "h1_dispatcher", "slow request detected. shutting down");
                        self.request_error(StatusCode::REQUEST_TIMEOUT);
                    }
                    _ => {
                        trace!(target: "h1_dispatcher", "keep-alive timer expired. shutting down");
                        return Ok(());
                    }
                },
                Err(Error::Proto(ref proto)) => {
                    let status = proto.status();
                    trace!(target: "h1_dispatcher", "protocol error {proto:?}. responding with {status}");
                    self.request_error(status);
                }
                Err(e) => return Err(e),
            }

            self.io.drain_write().await?;
        }
    }

    async fn serve(&mut self) -> Result<Run, Error<S::Error>> {
        if self.io.read_buf.is_empty() {
            match self
                .io
                .read()
                .select(self.shutdown.cancelled())
                .timeout(self.timer.as_mut())
                .await
            {
                Ok(SelectOutput::A(res)) => {
                    res?;
                }
                Ok(SelectOutput::B(_)) => return Ok(Run::Shutdown),
                Err(KeepAliveExpired) => return Err(Error::KeepAliveExpire),
            }
        }

        while let Some(decoded) = self.ctx.decode_head(self.io.read_buf.inner_mut(), self.cfg)? {
            if let Run::Detached = self.serve_decoded(decoded).await? {
                return Ok(Run::Detached);
            }

            // a connection leaving keep-alive must not parse buffered bytes
            // as another request. they may be an unconsumed request body.
            if !matches!(self.ctx.ctype(), ConnectionType::KeepAlive) {
                break;
            }

            // no further request is accepted once graceful stop started,
            // including pipelined ones already buffered.
            if self.shutdown.is_cancelled() {
                return Ok(Run::Shutdown);
            }
        }

        Ok(Run::Continue)
    }

    async fn serve_decoded(&mut self, decoded: Decoded) -> Result<Run, Error<S::Error>> {
        let (req, decoder) = match decoded {
            Decoded::Head(req, decoder) => (req, decoder),
            Decoded::H2Preface => {
                if !self.upgrade.wants_h2c_preface() {
                    return Err(Error::Proto(ProtoError::UpgradeRequired));
                }
                trace!(target: "h1_dispatcher", "http/2 preface. handing endpoint over");
                let read_buf = self.io.read_buf.split();
                let on = OnUpgrade {
                    head: Request::new(()),
                    io: &mut *self.io.io,
                    read_buf,
                };
                self.upgrade.upgrade(on).await.map_err(Error::Io)?;
                self.ctx.set_ctype(ConnectionType::Upgrade);
                return Ok(Run::Detached);
            }
        };

        if let Some(stats) = self.stats {
            stats.message_in();
        }

        // a fresh request pushes the keep alive deadline.
        self.update_timer(self.cfg.keep_alive_timeout);

        if self.ctx.is_upgrade_request() {
            if let Run::Detached = self.try_upgrade(&req).await? {
                let (parts, _) = req.into_parts();
                let read_buf = self.io.read_buf.split();
                let on = OnUpgrade {
                    head: Request::from_parts(parts, ()),
                    io: &mut *self.io.io,
                    read_buf,
                };
                self.upgrade.upgrade(on).await.map_err(Error::Io)?;
                self.ctx.set_ctype(ConnectionType::Upgrade);
                return Ok(Run::Detached);
            }
            // declined. the request dispatches normally and the connection
            // does not out live it.
            self.ctx.set_ctype(ConnectionType::Close);
        }

        let (mut body_reader, body) = BodyReader::from_coding(decoder);

        // hold the dispatch until the first body byte arrived. an expired
        // timer surfaces on the body stream and dispatches anyway.
        if self.cfg.delay_dispatch_until_content
            && !body_reader.decoder.is_eof()
            && !self.ctx.is_expect_header()
            && self.io.read_buf.is_empty()
        {
            match self.io.read().timeout(self.timer.as_mut()).await {
                Ok(res) => {
                    res?;
                }
                Err(KeepAliveExpired) => {
                    trace!(target: "h1_dispatcher", "delayed dispatch timed out. dispatching with failed input");
                    body_reader.feed_error(io::ErrorKind::TimedOut.into(), &mut self.ctx);
                }
            }
        }

        let mut req = req.map(|_| body);
        req.extensions_mut().insert(self.info.clone());

        let service = self.service;
        let (parts, res_body) = match service.call(req).select(self.request_body_handler(&mut body_reader)).await {
            SelectOutput::A(Ok(res)) => res.into_parts(),
            SelectOutput::A(Err(e)) => return Err(Error::Service(e)),
            SelectOutput::B(Err(e)) => return Err(e),
            SelectOutput::B(Ok(i)) => match i {},
        };

        // a dropped body receiver means the remaining request body will
        // never be consumed. decide the close before the head commits so
        // the response can still announce it.
        if !body_reader.decoder.is_eof() && body_reader.tx.receiver_gone() {
            body_reader.set_close(&mut self.ctx);
        }

        let mut encoder = self
            .ctx
            .encode_head(parts, res_body.size(), self.cfg, &mut self.io.write_buf)?;

        self.response_handler(res_body, &mut encoder, &mut body_reader).await?;

        if let Some(stats) = self.stats {
            stats.message_out();
        }

        Ok(Run::Continue)
    }

    /// negotiate a protocol upgrade. `Detached` means the 101 response is
    /// flushed and the endpoint should switch protocols.
    async fn try_upgrade(&mut self, req: &Request<()>) -> Result<Run, Error<S::Error>> {
        let Some(token) = upgrade_token(req.headers(), self.upgrade.protocols()) else {
            return Ok(Run::Continue);
        };

        let mut fields = HeaderMap::new();
        if !self.upgrade.prepare(req, &mut fields) {
            return Ok(Run::Continue);
        }

        let token = HeaderValue::from_str(token).map_err(|_| ProtoError::HeaderValue)?;

        let mut res = Response::new(());
        *res.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *res.version_mut() = req.version();
        res.headers_mut().insert(CONNECTION, HeaderValue::from_static("upgrade"));
        res.headers_mut().insert(UPGRADE, token);
        for (name, value) in fields.drain() {
            if let Some(name) = name {
                res.headers_mut().append(name, value);
            }
        }

        let (parts, _) = res.into_parts();
        self.ctx
            .encode_head(parts, BodySize::None, self.cfg, &mut self.io.write_buf)?;
        self.io.drain_write().await?;

        if let Some(stats) = self.stats {
            stats.message_out();
        }

        Ok(Run::Detached)
    }

    // associated future of the service call. reads and decodes the request
    // body and answers a pending expectation once the body is polled.
    async fn request_body_handler(&mut self, body_reader: &mut BodyReader) -> Result<Infallible, Error<S::Error>> {
        if self.ctx.is_expect_header() {
            // wait for the service future to want the body.
            if body_reader.wait_for_poll().await.is_ok() {
                self.ctx.encode_continue(&mut self.io.write_buf);
                // the continue must reach the client before anything else.
                self.io.drain_write().await?;
            }
        }

        let mut window_start = self.ctx.date.now();
        let mut window_bytes = self.io.bytes_read;

        loop {
            body_reader.ready(&mut self.io.read_buf, &mut self.ctx).await;
            self.io.read().await?;

            if self.cfg.min_request_data_rate > 0 {
                let now = self.ctx.date.now();
                let elapsed = now.saturating_duration_since(window_start);
                if elapsed >= Duration::from_secs(1) {
                    let rate = self.io.bytes_read.saturating_sub(window_bytes) / elapsed.as_secs();
                    if rate < self.cfg.min_request_data_rate {
                        trace!(target: "h1_dispatcher", "request body below minimal data rate");
                        body_reader.feed_error(io::ErrorKind::TimedOut.into(), &mut self.ctx);
                    }
                    window_start = now;
                    window_bytes = self.io.bytes_read;
                }
            }
        }
    }

    async fn response_handler(
        &mut self,
        body: ResponseBody,
        encoder: &mut TransferCoding,
        body_reader: &mut BodyReader,
    ) -> Result<(), Error<S::Error>> {
        let mut body = pin!(body);
        loop {
            match self
                .try_poll_body(body.as_mut())
                .select(io_ready(&mut self.io, body_reader, &mut self.ctx))
                .await
            {
                SelectOutput::A(Some(Ok(bytes))) => encoder.encode(bytes, &mut self.io.write_buf),
                SelectOutput::B(Ok(ready)) => {
                    if ready.is_readable() {
                        match self.io.try_read() {
                            Ok(_) => {}
                            Err(e) => body_reader.feed_error(e, &mut self.ctx),
                        }
                    }
                    if ready.is_writable() {
                        self.try_write_timed().await?;
                    }
                }
                SelectOutput::A(None) => {
                    if !body_reader.decoder.is_eof() {
                        // the request body was not fully consumed. close the
                        // connection instead of draining unbounded bytes.
                        self.ctx.set_ctype(ConnectionType::Close);
                    }
                    encoder.encode_eof(&mut self.io.write_buf);
                    return Ok(());
                }
                SelectOutput::B(Err(e)) => return Err(e.into()),
                SelectOutput::A(Some(Err(e))) => return Err(Error::Body(e)),
            }
        }
    }

    // poll the response body only while the write buffer accepts more.
    fn try_poll_body<'b>(
        &self,
        mut body: Pin<&'b mut ResponseBody>,
    ) -> impl Future<Output = Option<Result<bytes::Bytes, crate::body::BodyError>>> + 'b {
        let want_buf = self.io.write_buf.want_write_buf();
        async move {
            if want_buf {
                poll_fn(|cx| body.as_mut().poll_next(cx)).await
            } else {
                pending().await
            }
        }
    }

    // write with the minimal response data rate applied as a deadline on
    // draining the buffered bytes.
    async fn try_write_timed(&mut self) -> Result<(), Error<S::Error>> {
        self.io.try_write()?;

        if self.cfg.min_response_data_rate > 0 && self.io.write_buf.want_write_io() {
            let budget = (self.cfg.write_buf_size as u64 / self.cfg.min_response_data_rate.max(1)).max(1);
            tokio::time::timeout(Duration::from_secs(budget), self.io.drain_write())
                .await
                .map_err(|_| Error::Io(io::ErrorKind::TimedOut.into()))??;
        }

        Ok(())
    }

    fn update_timer(&mut self, dur: Duration) {
        let deadline = self.ctx.date.now() + dur;
        self.timer.as_mut().update(deadline);
    }

    #[cold]
    #[inline(never)]
    fn request_error(&mut self, status: StatusCode) {
        self.ctx.set_ctype(ConnectionType::Close);

        let mut res = Response::new(());
        *res.status_mut() = status;
        let (parts, _) = res.into_parts();

        if self
            .ctx
            .encode_head(parts, BodySize::None, self.cfg, &mut self.io.write_buf)
            .is_err()
        {
            error!(target: "h1_dispatcher", "failed to encode error response");
        }
    }
}

// wait for io readiness relevant to the current request/response state.
async fn io_ready<Io, W, D>(
    io: &mut BufferedIo<'_, Io, W>,
    body_reader: &mut BodyReader,
    ctx: &mut Context<'_, D>,
) -> io::Result<Ready>
where
    Io: AsyncIo,
    W: BufWrite,
{
    if !io.write_buf.want_write_io() {
        body_reader.ready(&mut io.read_buf, ctx).await;
        io.io.ready(Interest::READABLE).await
    } else {
        match body_reader
            .ready(&mut io.read_buf, ctx)
            .select(io.io.ready(Interest::WRITABLE))
            .await
        {
            SelectOutput::A(_) => io.io.ready(Interest::READABLE | Interest::WRITABLE).await,
            SelectOutput::B(res) => res,
        }
    }
}

fn upgrade_token<'h>(headers: &'h HeaderMap, protocols: &[&str]) -> Option<&'h str> {
    let value = headers.get(UPGRADE)?.to_str().ok()?;
    value
        .split(',')
        .map(str::trim)
        .find(|token| protocols.iter().any(|proto| proto.eq_ignore_ascii_case(token)))
}

struct BodyReader {
    decoder: TransferCoding,
    tx: RequestBodySender,
}

impl BodyReader {
    fn from_coding(decoder: TransferCoding) -> (Self, RequestBody) {
        let (mut tx, body) = RequestBody::channel(false);
        if decoder.is_eof() {
            tx.feed_eof();
        }
        (BodyReader { decoder, tx }, body)
    }

    // must resolve before any io read happens. a pending outcome means the
    // body consumer is in backpressure or does not expect more body.
    async fn ready<D>(&mut self, read_buf: &mut ReadBuf, ctx: &mut Context<'_, D>) {
        loop {
            match self.decoder.decode(read_buf.inner_mut()) {
                ChunkResult::Ok(bytes) => self.tx.feed_data(bytes),
                ChunkResult::InsufficientData => match self.tx.ready().await {
                    Ok(_) => return,
                    // the service dropped the body half way. close the
                    // connection as the remaining length is unknown.
                    Err(_) => self.set_close(ctx),
                },
                ChunkResult::Eof(trailers) => {
                    if let Some(trailers) = trailers {
                        self.tx.feed_trailers(trailers);
                    }
                    self.tx.feed_eof();
                }
                ChunkResult::AlreadyEof => pending().await,
                ChunkResult::Err(e) => self.feed_error(e, ctx),
            }
        }
    }

    #[cold]
    #[inline(never)]
    fn feed_error<D>(&mut self, e: io::Error, ctx: &mut Context<'_, D>) {
        self.tx.feed_error(e);
        self.set_close(ctx);
    }

    #[cold]
    #[inline(never)]
    fn set_close<D>(&mut self, ctx: &mut Context<'_, D>) {
        self.decoder.set_eof();
        ctx.set_ctype(ConnectionType::Close);
    }

    // wait until the service starts consuming the body.
    async fn wait_for_poll(&mut self) -> io::Result<()> {
        self.tx.wait_for_poll().await.inspect_err(|_| {
            // service dropped the body. nothing will ever be read.
            self.decoder.set_eof();
        })
    }
}
