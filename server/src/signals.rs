use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// process signals the server reacts to.
#[allow(dead_code)]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub(crate) enum Signal {
    /// SIGHUP
    Hup,
    /// SIGINT
    Int,
    /// SIGTERM
    Term,
    /// SIGQUIT
    Quit,
}

pub(crate) struct Signals {
    #[cfg(unix)]
    signals: Vec<(Signal, tokio::signal::unix::Signal)>,
    #[cfg(not(unix))]
    signals: Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>,
}

impl Signals {
    #[cfg(unix)]
    pub(crate) fn start() -> Self {
        use tokio::signal::unix;

        let sig_map = [
            (unix::SignalKind::interrupt(), Signal::Int),
            (unix::SignalKind::hangup(), Signal::Hup),
            (unix::SignalKind::terminate(), Signal::Term),
            (unix::SignalKind::quit(), Signal::Quit),
        ];

        let signals = sig_map
            .iter()
            .filter_map(|(kind, sig)| {
                unix::signal(*kind)
                    .map(|stream| (*sig, stream))
                    .map_err(|e| tracing::error!("can not initialize signal handler for {sig:?} err: {e}"))
                    .ok()
            })
            .collect::<Vec<_>>();

        Self { signals }
    }

    #[cfg(not(unix))]
    pub(crate) fn start() -> Self {
        Self {
            signals: Box::pin(tokio::signal::ctrl_c()),
        }
    }
}

impl Future for Signals {
    type Output = Signal;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        #[cfg(not(unix))]
        {
            self.signals.as_mut().poll(cx).map(|_| Signal::Int)
        }
        #[cfg(unix)]
        {
            for (sig, stream) in self.signals.iter_mut() {
                if stream.poll_recv(cx).is_ready() {
                    return Poll::Ready(*sig);
                }
            }
            Poll::Pending
        }
    }
}
