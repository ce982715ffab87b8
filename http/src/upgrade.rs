//! Protocol upgrade hand-off for `Upgrade:` negotiation and the direct
//! http/2 client preface.

use core::future::Future;

use std::io;

use bytes::BytesMut;
use http::{header::HeaderMap, Request};

/// everything an upgraded protocol needs to take over the endpoint: the
/// triggering request head, the raw io and bytes already read past the head.
pub struct OnUpgrade<'a, Io> {
    pub head: Request<()>,
    pub io: &'a mut Io,
    pub read_buf: BytesMut,
}

/// upgrading connection factory. consulted when a request carries an
/// `Upgrade:` header (with the matching `Connection: upgrade` token) and for
/// connections opening with the http/2 preface.
pub trait UpgradeHandler<Io> {
    /// protocol tokens this handler accepts, e.g. `h2c` or `websocket`.
    fn protocols(&self) -> &[&str] {
        &[]
    }

    /// true when a connection opening with the direct http/2 preface should
    /// be handed over instead of answered with 426.
    fn wants_h2c_preface(&self) -> bool {
        false
    }

    /// inspect the request and fill extra fields of the 101 response.
    /// returning false declines; the request then dispatches normally.
    fn prepare(&self, head: &Request<()>, fields: &mut HeaderMap) -> bool {
        let _ = (head, fields);
        true
    }

    /// drive the upgraded protocol on the endpoint until it completes. for
    /// the preface hand-off `head` is a synthetic empty request.
    fn upgrade(&self, on: OnUpgrade<'_, Io>) -> impl Future<Output = io::Result<()>>;
}

/// default upgrade handler declining every protocol.
#[derive(Clone, Copy, Default)]
pub struct NoUpgrade;

impl<Io> UpgradeHandler<Io> for NoUpgrade {
    async fn upgrade(&self, _: OnUpgrade<'_, Io>) -> io::Result<()> {
        // unreachable in practice. an empty protocol list never matches.
        Ok(())
    }
}
