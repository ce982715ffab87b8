use std::{
    future::Future,
    io, mem,
    pin::Pin,
    task::{ready, Context, Poll},
};

use tracing::info;

use crate::signals::{Signal, Signals};

use super::{handle::ServerHandle, Command, Server};

/// started server as a future resolving when the server stopped.
#[must_use = "ServerFuture must be awaited, spawned or consumed with ServerFuture::wait"]
pub enum ServerFuture {
    Init { server: Server, enable_signal: bool },
    Running(ServerFutureInner),
    Error(io::Error),
    Finished,
}

impl Default for ServerFuture {
    fn default() -> Self {
        Self::Finished
    }
}

impl ServerFuture {
    /// handle for stopping the server from elsewhere.
    ///
    /// a server that failed to start yields its error here.
    pub fn handle(&mut self) -> io::Result<ServerHandle> {
        match *self {
            Self::Init { ref server, .. } => Ok(ServerHandle {
                tx: server.tx_cmd.clone(),
            }),
            Self::Running(ref inner) => Ok(ServerHandle {
                tx: inner.server.tx_cmd.clone(),
            }),
            Self::Error(_) => match mem::take(self) {
                Self::Error(e) => Err(e),
                _ => unreachable!(),
            },
            Self::Finished => panic!("ServerFuture used after finish"),
        }
    }

    /// block the current thread until the server stops through a signal or
    /// a [ServerHandle].
    ///
    /// # Panics
    /// when called from within an async runtime context.
    pub fn wait(self) -> io::Result<()> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(self)
    }
}

pub struct ServerFutureInner {
    pub(crate) server: Server,
    pub(crate) signals: Option<Signals>,
}

impl ServerFutureInner {
    fn new(server: Server, enable_signal: bool) -> Self {
        Self {
            server,
            signals: enable_signal.then(Signals::start),
        }
    }

    fn poll_cmd(&mut self, cx: &mut Context<'_>) -> Poll<Command> {
        if let Some(signals) = self.signals.as_mut() {
            if let Poll::Ready(sig) = Pin::new(signals).poll(cx) {
                info!("signal {sig:?} received");
                let cmd = match sig {
                    Signal::Int | Signal::Quit => Command::ForceStop,
                    Signal::Term => Command::GracefulStop,
                    // terminal hangup does not stop the server. drop the
                    // signal listener and keep running.
                    Signal::Hup => {
                        self.signals = None;
                        return Poll::Pending;
                    }
                };
                return Poll::Ready(cmd);
            }
        }

        match ready!(self.server.rx_cmd.poll_recv(cx)) {
            Some(cmd) => Poll::Ready(cmd),
            None => Poll::Pending,
        }
    }

    fn handle_cmd(&mut self, cmd: Command) {
        match cmd {
            Command::GracefulStop => self.server.stop(true),
            Command::ForceStop => self.server.stop(false),
        }
    }
}

impl Future for ServerFuture {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.as_mut().get_mut();
        match *this {
            Self::Init { .. } => match mem::take(this) {
                Self::Init { server, enable_signal } => {
                    self.set(Self::Running(ServerFutureInner::new(server, enable_signal)));
                    self.poll(cx)
                }
                _ => unreachable!(),
            },
            Self::Running(ref mut inner) => {
                let cmd = ready!(inner.poll_cmd(cx));
                inner.handle_cmd(cmd);
                self.set(Self::Finished);
                Poll::Ready(Ok(()))
            }
            Self::Error(_) => match mem::take(this) {
                Self::Error(e) => Poll::Ready(Err(e)),
                _ => unreachable!(),
            },
            Self::Finished => unreachable!("ServerFuture polled after finish"),
        }
    }
}
