//! worker thread runtime: accept loops plus graceful shutdown of the
//! connections they spawned.

mod shutdown;

use std::{io, net, sync::atomic::AtomicBool, sync::Arc, thread, time::Duration};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::net::Stream;
use crate::server::service::RcWorkerService;

use self::shutdown::ShutdownHandle;

pub(crate) async fn run(
    listeners: Vec<(String, net::TcpListener)>,
    services: Vec<(String, RcWorkerService)>,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
    is_graceful_shutdown: Arc<AtomicBool>,
) {
    let handles = listeners
        .into_iter()
        .map(|(name, listener)| {
            let service = services
                .iter()
                .find_map(|(n, service)| (n == &name).then(|| service.clone()))
                .expect("every listener has a service factory registered under its name");

            tokio::task::spawn_local(accept_loop(listener, service, shutdown_token.clone()))
        })
        .collect::<Vec<_>>();

    info!("started {}", worker_name());

    let services = services.into_iter().map(|(_, service)| service).collect();

    for handle in handles {
        handle
            .await
            .unwrap_or_else(|e| error!("{} exited on error: {}", worker_name(), e));
    }

    ShutdownHandle::new(shutdown_timeout, services, is_graceful_shutdown).shutdown().await;
}

async fn accept_loop(listener: net::TcpListener, service: RcWorkerService, shutdown_token: CancellationToken) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("listener registration failed: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => return,
            res = listener.accept() => match res {
                Ok((stream, addr)) => match stream.into_std() {
                    Ok(stream) => {
                        let req = (Stream::Tcp(stream, addr), shutdown_token.clone());
                        drop(tokio::task::spawn_local(service.clone().call(req)));
                    }
                    Err(e) => error!("error detaching accepted stream: {e}"),
                },
                Err(ref e) if connection_error(e) => continue,
                Err(e) => {
                    // resource exhaustion (ENFILE/EMFILE and friends).
                    // pause the loop instead of spinning on the error.
                    error!("error accepting connection: {e}");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

fn worker_name() -> String {
    thread::current()
        .name()
        .map(ToString::to_string)
        .unwrap_or_else(|| String::from("joist-server-worker"))
}

/// errors that are scoped to one failed connection attempt. the next
/// accept may well succeed immediately.
fn connection_error(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::ConnectionRefused
        || e.kind() == io::ErrorKind::ConnectionAborted
        || e.kind() == io::ErrorKind::ConnectionReset
}
