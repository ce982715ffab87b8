mod future;
mod handle;

pub(crate) mod service;

pub use self::future::ServerFuture;
pub use self::handle::ServerHandle;
pub use self::service::BuildServiceFn;

use std::{
    io, mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::builder::Builder;
use crate::worker;

pub struct Server {
    pub(crate) is_graceful_shutdown: Arc<AtomicBool>,
    pub(crate) shutdown_token: CancellationToken,
    pub(crate) tx_cmd: UnboundedSender<Command>,
    pub(crate) rx_cmd: UnboundedReceiver<Command>,
    worker_join_handles: Vec<thread::JoinHandle<()>>,
}

impl Server {
    pub(crate) fn new(builder: Builder) -> io::Result<Self> {
        let Builder {
            worker_threads,
            listeners,
            factories,
            shutdown_timeout,
            ..
        } = builder;

        // listener conversion errors surface before any worker spawns.
        let listeners = listeners
            .into_iter()
            .flat_map(|(name, listeners)| {
                listeners.into_iter().map(move |mut listener| {
                    let listener = listener.into_listener()?;
                    Ok((name.clone(), listener))
                })
            })
            .collect::<io::Result<Vec<_>>>()?;

        let factories = Arc::new(factories);
        let is_graceful_shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_token = CancellationToken::new();

        let worker_join_handles = (0..worker_threads)
            .map(|idx| {
                // every worker accepts from its own clone of the listeners.
                let listeners = listeners
                    .iter()
                    .map(|(name, listener)| Ok((name.clone(), listener.try_clone()?)))
                    .collect::<io::Result<Vec<_>>>()?;

                let factories = factories.clone();
                let is_graceful_shutdown = is_graceful_shutdown.clone();
                let shutdown_token = shutdown_token.clone();

                let (tx, rx) = std::sync::mpsc::sync_channel::<io::Result<()>>(1);

                let handle = thread::Builder::new()
                    .name(format!("joist-server-worker-{idx}"))
                    .spawn(move || {
                        let fut = async {
                            let mut services = Vec::with_capacity(factories.len());
                            for (name, factory) in factories.iter() {
                                match factory.build().await {
                                    Ok(service) => services.push((name.clone(), service)),
                                    Err(_) => {
                                        tx.send(Err(io::Error::other("worker service failed to build"))).unwrap();
                                        return;
                                    }
                                }
                            }

                            tx.send(Ok(())).unwrap();

                            worker::run(listeners, services, shutdown_token, shutdown_timeout, is_graceful_shutdown)
                                .await;
                        };

                        tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .unwrap()
                            .block_on(tokio::task::LocalSet::new().run_until(fut))
                    })?;

                rx.recv()
                    .map_err(|_| io::Error::other("worker exited during start"))??;

                Ok(handle)
            })
            .collect::<io::Result<Vec<_>>>()?;

        let (tx_cmd, rx_cmd) = unbounded_channel();

        Ok(Self {
            is_graceful_shutdown,
            shutdown_token,
            tx_cmd,
            rx_cmd,
            worker_join_handles,
        })
    }

    pub(crate) fn stop(&mut self, graceful: bool) {
        self.is_graceful_shutdown.store(graceful, Ordering::SeqCst);
        self.shutdown_token.cancel();

        mem::take(&mut self.worker_join_handles).into_iter().for_each(|handle| {
            if handle.join().is_err() {
                error!("worker thread panicked during stop");
            }
        });
    }
}

pub(crate) enum Command {
    GracefulStop,
    ForceStop,
}
