//! Async service abstraction shared by every layer of joist.
//!
//! A [Service] receives a request and produces a response asynchronously. The
//! server crate composes services for accepted connections, the http crate for
//! protocol dispatch. Building a service is itself expressed as a service call
//! with `()` as request so construction can be async and fallible.

#![forbid(unsafe_code)]

use core::future::Future;

use std::{boxed::Box, rc::Rc, sync::Arc};

pub mod object;

/// An async function of `Req` to `Result<Self::Response, Self::Error>`.
pub trait Service<Req = ()> {
    type Response;
    type Error;

    fn call(&self, req: Req) -> impl Future<Output = Result<Self::Response, Self::Error>>;
}

macro_rules! forward_impl {
    ($ty: ty) => {
        impl<S, Req> Service<Req> for $ty
        where
            S: Service<Req> + ?Sized,
        {
            type Response = S::Response;
            type Error = S::Error;

            #[inline]
            fn call(&self, req: Req) -> impl Future<Output = Result<Self::Response, Self::Error>> {
                (**self).call(req)
            }
        }
    };
}

forward_impl!(&S);
forward_impl!(Box<S>);
forward_impl!(Rc<S>);
forward_impl!(Arc<S>);

/// Shorthand for constructing a [Service] from an async function closure.
///
/// # Examples
/// ```rust
/// # use joist_service::{fn_service, Service};
/// # async fn call() {
/// let service = fn_service(|req: &'static str| async move { Ok::<_, ()>(req.len()) });
/// assert_eq!(service.call("joist").await, Ok(5));
/// # }
/// ```
pub fn fn_service<F, Req, Fut, Res, Err>(f: F) -> FnService<F>
where
    F: Fn(Req) -> Fut,
    Fut: Future<Output = Result<Res, Err>>,
{
    FnService(f)
}

#[derive(Clone, Copy)]
pub struct FnService<F>(F);

impl<F, Req, Fut, Res, Err> Service<Req> for FnService<F>
where
    F: Fn(Req) -> Fut,
    Fut: Future<Output = Result<Res, Err>>,
{
    type Response = Res;
    type Error = Err;

    #[inline]
    fn call(&self, req: Req) -> impl Future<Output = Result<Self::Response, Self::Error>> {
        (self.0)(req)
    }
}

/// Shorthand for a builder service: an async closure without argument that
/// produces another service. Used as the per-worker construction step.
pub fn fn_build<F, Fut, Svc, Err>(f: F) -> FnBuild<F>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Svc, Err>>,
{
    FnBuild(f)
}

#[derive(Clone, Copy)]
pub struct FnBuild<F>(F);

impl<F, Fut, Svc, Err> Service for FnBuild<F>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Svc, Err>>,
{
    type Response = Svc;
    type Error = Err;

    #[inline]
    fn call(&self, _: ()) -> impl Future<Output = Result<Self::Response, Self::Error>> {
        (self.0)()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn fn_service_call() {
        let service = fn_service(|req: usize| async move { Ok::<_, ()>(req + 1) });
        assert_eq!(service.call(1).await, Ok(2));
    }

    #[tokio::test]
    async fn fn_build_then_call() {
        let build = fn_build(|| async { Ok::<_, ()>(fn_service(|req: usize| async move { Ok::<_, ()>(req * 2) })) });
        let service = build.call(()).await.unwrap();
        assert_eq!(service.call(21).await, Ok(42));
    }
}
