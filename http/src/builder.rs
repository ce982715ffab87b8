//! builder assembling the per worker http/1 connection service.

use core::convert::Infallible;

use std::sync::Arc;

use crate::{
    config::HttpConfig,
    h1::H1Service,
    stats::ConnectorStats,
    tls::NoOpTlsAcceptor,
    upgrade::NoUpgrade,
};

use joist_service::Service;

/// builder of an [H1Service]. constructed once per worker through the
/// server's service factory; [Service::call] with `()` performs the build.
pub struct HttpServiceBuilder<S, U = NoUpgrade, A = NoOpTlsAcceptor> {
    service: S,
    upgrade: U,
    tls_acceptor: A,
    cfg: HttpConfig,
    stats: Option<Arc<ConnectorStats>>,
}

impl<S> HttpServiceBuilder<S> {
    /// http/1 service over the given request service, plain text transport
    /// and no upgrade support.
    pub fn h1(service: S) -> Self {
        Self {
            service,
            upgrade: NoUpgrade,
            tls_acceptor: NoOpTlsAcceptor,
            cfg: HttpConfig::new(),
            stats: None,
        }
    }
}

impl<S, U, A> HttpServiceBuilder<S, U, A> {
    pub fn config(mut self, cfg: HttpConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// wire the connector statistics counter group.
    pub fn stats(mut self, stats: Arc<ConnectorStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// install an upgrade handler consulted for `Upgrade:` requests and the
    /// direct http/2 preface.
    pub fn upgrade<U2>(self, upgrade: U2) -> HttpServiceBuilder<S, U2, A> {
        HttpServiceBuilder {
            service: self.service,
            upgrade,
            tls_acceptor: self.tls_acceptor,
            cfg: self.cfg,
            stats: self.stats,
        }
    }

    /// replace the tls accept service run before the http/1 protocol.
    pub fn with_tls<A2>(self, tls_acceptor: A2) -> HttpServiceBuilder<S, U, A2> {
        HttpServiceBuilder {
            service: self.service,
            upgrade: self.upgrade,
            tls_acceptor,
            cfg: self.cfg,
            stats: self.stats,
        }
    }

    /// terminate tls with rustls. the decrypted stream runs http/1.1 as the
    /// next protocol.
    #[cfg(feature = "rustls")]
    pub fn rustls(
        self,
        config: crate::tls::rustls::RustlsConfig,
    ) -> HttpServiceBuilder<S, U, crate::tls::rustls::TlsAcceptorService> {
        self.with_tls(crate::tls::rustls::TlsAcceptorService::new(config, "http/1.1"))
    }
}

impl<S, U, A> Service for HttpServiceBuilder<S, U, A>
where
    S: Clone,
    U: Clone,
    A: Clone,
{
    type Response = H1Service<S, U, A>;
    type Error = Infallible;

    async fn call(&self, _: ()) -> Result<Self::Response, Self::Error> {
        Ok(H1Service::new(
            self.cfg.clone(),
            self.service.clone(),
            self.upgrade.clone(),
            self.tls_acceptor.clone(),
            self.stats.clone(),
        ))
    }
}
