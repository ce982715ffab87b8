//! Object safe variant of [Service](crate::Service) for storage in
//! heterogeneous collections.

use core::{future::Future, pin::Pin};

use std::boxed::Box;

use crate::Service;

/// Boxed future type produced by [ServiceObject::call].
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Dyn compatible mirror of [Service]. Blanket implemented for every service
/// type so `Box<dyn ServiceObject<..>>` can hold any of them.
pub trait ServiceObject<Req> {
    type Response;
    type Error;

    fn call<'s>(&'s self, req: Req) -> LocalBoxFuture<'s, Result<Self::Response, Self::Error>>
    where
        Req: 's;
}

impl<S, Req> ServiceObject<Req> for S
where
    S: Service<Req>,
{
    type Response = S::Response;
    type Error = S::Error;

    #[inline]
    fn call<'s>(&'s self, req: Req) -> LocalBoxFuture<'s, Result<Self::Response, Self::Error>>
    where
        Req: 's,
    {
        Box::pin(Service::call(self, req))
    }
}
