//! graceful drain of in flight connections after the accept loops stopped.

use std::{
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tracing::info;

use crate::server::service::RcWorkerService;

pub(super) struct ShutdownHandle {
    shutdown_timeout: Duration,
    services: Vec<RcWorkerService>,
    is_graceful_shutdown: Arc<AtomicBool>,
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        self.retain_active_services();

        // every connection task holds one extra strong count on its service.
        let remaining = std::mem::take(&mut self.services)
            .into_iter()
            .fold(0, |total, service| total + Rc::strong_count(&service).saturating_sub(1));

        if remaining == 0 {
            info!("gracefully stopped {}", super::worker_name());
        } else {
            info!(
                "force stopped {}. {remaining} connections(estimate) left",
                super::worker_name()
            );
        }
    }
}

impl ShutdownHandle {
    pub(super) fn new(
        shutdown_timeout: Duration,
        services: Vec<RcWorkerService>,
        is_graceful_shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            shutdown_timeout,
            services,
            is_graceful_shutdown,
        }
    }

    pub(super) async fn shutdown(mut self) {
        if self.is_graceful_shutdown.load(Ordering::SeqCst) {
            let start = Instant::now();
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            while start.elapsed() < self.shutdown_timeout {
                self.retain_active_services();

                if self.services.is_empty() {
                    return;
                }

                let _ = interval.tick().await;
            }
        }
    }

    #[inline(never)]
    fn retain_active_services(&mut self) {
        self.services.retain(|service| Rc::strong_count(service) > 1);
    }
}
