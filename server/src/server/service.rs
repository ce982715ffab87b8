//! object safe bridges between the user supplied service factories and the
//! worker accept loops.

use core::fmt;

use std::rc::Rc;

use joist_service::{object::LocalBoxFuture, Service};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::net::Stream;

/// service factory closure: runs once per worker thread to construct the
/// builder service, which in turn builds the connection service.
pub trait BuildServiceFn: Send + Sync + 'static {
    type Build: Service<(), Response = Self::Service, Error = Self::BuildError>;
    type BuildError: fmt::Debug;
    type Service: Service<(Stream, CancellationToken), Response = (), Error = Self::ServiceError> + 'static;
    type ServiceError: fmt::Debug;

    fn call(&self) -> Self::Build;
}

impl<F, T, Svc> BuildServiceFn for F
where
    F: Fn() -> T + Send + Sync + 'static,
    T: Service<(), Response = Svc>,
    T::Error: fmt::Debug,
    Svc: Service<(Stream, CancellationToken), Response = ()> + 'static,
    <Svc as Service<(Stream, CancellationToken)>>::Error: fmt::Debug,
{
    type Build = T;
    type BuildError = T::Error;
    type Service = Svc;
    type ServiceError = <Svc as Service<(Stream, CancellationToken)>>::Error;

    fn call(&self) -> T {
        self()
    }
}

// type erased factory shared with every worker thread. building happens on
// the worker; only the factory itself crosses threads.
pub(crate) trait ServiceFactory: Send + Sync {
    fn build(&self) -> LocalBoxFuture<'_, Result<RcWorkerService, ()>>;
}

pub(crate) struct Factory<F>(F);

impl<F> Factory<F> {
    pub(crate) fn new_boxed(factory: F) -> Box<dyn ServiceFactory>
    where
        F: BuildServiceFn,
    {
        Box::new(Factory(factory))
    }
}

impl<F> ServiceFactory for Factory<F>
where
    F: BuildServiceFn,
{
    fn build(&self) -> LocalBoxFuture<'_, Result<RcWorkerService, ()>> {
        Box::pin(async move {
            let build = self.0.call();
            let service = Service::call(&build, ())
                .await
                .map_err(|e| error!("worker service failed to build: {e:?}"))?;
            Ok(Rc::new(Container(service)) as RcWorkerService)
        })
    }
}

/// worker side connection service. the `Rc` doubles as the live connection
/// count for graceful shutdown accounting.
pub(crate) type RcWorkerService = Rc<dyn WorkerService>;

pub(crate) trait WorkerService {
    fn call(self: Rc<Self>, req: (Stream, CancellationToken)) -> LocalBoxFuture<'static, ()>;
}

struct Container<S>(S);

impl<S> WorkerService for Container<S>
where
    S: Service<(Stream, CancellationToken), Response = ()> + 'static,
    S::Error: fmt::Debug,
{
    fn call(self: Rc<Self>, req: (Stream, CancellationToken)) -> LocalBoxFuture<'static, ()> {
        Box::pin(async move {
            if let Err(e) = self.0.call(req).await {
                error!("connection error: {e:?}");
            }
        })
    }
}
