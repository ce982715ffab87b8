//! Composable request handler tree and the service dispatching requests
//! into it.
//!
//! A handler receives the request and the in progress response and reports
//! whether it completed the request. Trees compose from leaves, wrappers
//! (zero or one child), lists (ordered, first claiming handler wins) and
//! scoped handlers (two phase: every scope on the chain is established top
//! down before any in scope handling runs).

use core::{any::Any, convert::Infallible, fmt};

use std::{boxed::Box, cell::RefCell, error, rc::Rc};

use joist_service::{object::LocalBoxFuture, Service};

use http::StatusCode;

use crate::{body::ResponseBody, config::HttpConfig, customize::Customizer, h1::RequestBody};

/// request type seen by handlers.
pub type Request = http::Request<RequestBody>;

/// response type built up by handlers.
pub type Response = http::Response<ResponseBody>;

/// error type produced by handlers.
pub type HandlerError = Box<dyn error::Error>;

/// node of the handler tree.
pub trait Handler {
    /// handle the request. `Ok(true)` means this handler completed it and
    /// no sibling is consulted.
    fn handle<'s>(&'s self, req: &'s mut Request, res: &'s mut Response) -> LocalBoxFuture<'s, Result<bool, HandlerError>>;

    /// direct children of this node.
    fn children(&self) -> Vec<Rc<dyn Handler>> {
        Vec::new()
    }

    /// true for handlers participating in the two phase scope protocol.
    fn is_scoped(&self) -> bool {
        false
    }

    /// establish this handler's scope without handling. implemented by
    /// scoped handlers only.
    fn enter_scope<'s>(&'s self, req: &'s mut Request) -> Option<LocalBoxFuture<'s, Result<ScopeGuard, HandlerError>>> {
        let _ = req;
        None
    }
}

/// true when `target` is `root` itself or any of its descendants.
pub fn tree_contains(root: &Rc<dyn Handler>, target: &Rc<dyn Handler>) -> bool {
    if Rc::ptr_eq(root, target) {
        return true;
    }
    root.children().iter().any(|child| tree_contains(child, target))
}

/// rejected tree mutation: the handler would become its own ancestor.
#[derive(Debug)]
pub struct CycleError;

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("handler can not be a descendant of itself")
    }
}

impl error::Error for CycleError {}

fn check_cycle(parent: Rc<dyn Handler>, child: &Rc<dyn Handler>) -> Result<(), CycleError> {
    if tree_contains(child, &parent) {
        return Err(CycleError);
    }
    Ok(())
}

/// leaf handler from an async function closure.
pub struct HandlerFn<F>(F);

/// construct a leaf handler from a closure returning a boxed future.
///
/// # Examples
/// ```rust
/// # use joist_http::handler::{handler_fn, Request, Response};
/// # use joist_http::body::ResponseBody;
/// let ok = handler_fn(|_req: &mut Request, res: &mut Response| {
///     Box::pin(async move {
///         *res.body_mut() = ResponseBody::bytes("hello");
///         Ok(true)
///     })
/// });
/// ```
pub fn handler_fn<F>(f: F) -> Rc<HandlerFn<F>>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> LocalBoxFuture<'a, Result<bool, HandlerError>> + 'static,
{
    Rc::new(HandlerFn(f))
}

impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> LocalBoxFuture<'a, Result<bool, HandlerError>> + 'static,
{
    fn handle<'s>(&'s self, req: &'s mut Request, res: &'s mut Response) -> LocalBoxFuture<'s, Result<bool, HandlerError>> {
        (self.0)(req, res)
    }
}

/// handler with at most one child, delegating to it. building block for
/// handlers that pre and post process around their child.
pub struct Wrapper {
    child: RefCell<Option<Rc<dyn Handler>>>,
}

impl Wrapper {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            child: RefCell::new(None),
        })
    }

    pub fn with_handler(handler: Rc<dyn Handler>) -> Rc<Self> {
        Rc::new(Self {
            child: RefCell::new(Some(handler)),
        })
    }

    /// replace the child. rejects assignments that would make this wrapper
    /// its own descendant.
    pub fn set_handler(self: &Rc<Self>, handler: Rc<dyn Handler>) -> Result<(), CycleError> {
        check_cycle(self.clone(), &handler)?;
        *self.child.borrow_mut() = Some(handler);
        Ok(())
    }

    pub fn handler(&self) -> Option<Rc<dyn Handler>> {
        self.child.borrow().clone()
    }
}

impl Handler for Wrapper {
    fn handle<'s>(&'s self, req: &'s mut Request, res: &'s mut Response) -> LocalBoxFuture<'s, Result<bool, HandlerError>> {
        let child = self.handler();
        Box::pin(async move {
            match child {
                Some(child) => child.handle(req, res).await,
                None => Ok(false),
            }
        })
    }

    fn children(&self) -> Vec<Rc<dyn Handler>> {
        self.handler().into_iter().collect()
    }
}

/// ordered collection of handlers. the first to claim the request wins.
/// membership mutation publishes a new snapshot so iteration never observes
/// a half applied change.
pub struct HandlerList {
    children: RefCell<Rc<[Rc<dyn Handler>]>>,
}

impl HandlerList {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            children: RefCell::new(Rc::from(Vec::new())),
        })
    }

    pub fn add_handler(self: &Rc<Self>, handler: Rc<dyn Handler>) -> Result<(), CycleError> {
        check_cycle(self.clone(), &handler)?;
        let mut handlers = self.snapshot().to_vec();
        handlers.push(handler);
        *self.children.borrow_mut() = Rc::from(handlers);
        Ok(())
    }

    pub fn set_handlers(self: &Rc<Self>, handlers: Vec<Rc<dyn Handler>>) -> Result<(), CycleError> {
        for handler in &handlers {
            check_cycle(self.clone(), handler)?;
        }
        *self.children.borrow_mut() = Rc::from(handlers);
        Ok(())
    }

    fn snapshot(&self) -> Rc<[Rc<dyn Handler>]> {
        self.children.borrow().clone()
    }
}

impl Handler for HandlerList {
    fn handle<'s>(&'s self, req: &'s mut Request, res: &'s mut Response) -> LocalBoxFuture<'s, Result<bool, HandlerError>> {
        let snapshot = self.snapshot();
        Box::pin(async move {
            for handler in snapshot.iter() {
                if handler.handle(req, res).await? {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    fn children(&self) -> Vec<Rc<dyn Handler>> {
        self.snapshot().to_vec()
    }
}

/// teardown token of an established scope. dropping it tears the scope
/// down; guards drop innermost first when the request unwinds.
pub type ScopeGuard = Box<dyn Any>;

/// continuation handed to [Scope::handle] for proceeding to the child
/// handler.
pub struct Next {
    child: Option<Rc<dyn Handler>>,
}

impl Next {
    pub async fn run(&self, req: &mut Request, res: &mut Response) -> Result<bool, HandlerError> {
        match self.child {
            Some(ref child) => child.handle(req, res).await,
            None => Ok(false),
        }
    }
}

/// scope logic of a [ScopedHandler]: establish context for a request, then
/// handle within the fully established scope stack.
pub trait Scope: 'static {
    /// establish scope state for this request.
    fn enter<'s>(&'s self, req: &'s mut Request) -> LocalBoxFuture<'s, Result<ScopeGuard, HandlerError>>;

    /// handle the request. every scope of the chain is established at this
    /// point. call `next.run` to proceed to the child handler.
    fn handle<'s>(
        &'s self,
        req: &'s mut Request,
        res: &'s mut Response,
        next: Next,
    ) -> LocalBoxFuture<'s, Result<bool, HandlerError>>;
}

// scope establishment bookkeeping living in the request extensions for the
// duration of a dispatch. an explicit context value instead of a
// thread local.
#[derive(Clone, Default)]
struct ScopeState {
    entered: Vec<usize>,
}

fn mark_entered(req: &mut Request, addr: usize) {
    if let Some(state) = req.extensions_mut().get_mut::<ScopeState>() {
        state.entered.push(addr);
        return;
    }
    req.extensions_mut().insert(ScopeState { entered: vec![addr] });
}

fn is_entered(req: &Request, addr: usize) -> bool {
    req.extensions()
        .get::<ScopeState>()
        .map(|state| state.entered.contains(&addr))
        .unwrap_or(false)
}

/// handler wrapping a [Scope]. the outermost scoped handler of a chain
/// establishes every scoped descendant top down before any handling runs.
pub struct ScopedHandler<S> {
    scope: S,
    child: RefCell<Option<Rc<dyn Handler>>>,
}

impl<S: Scope> ScopedHandler<S> {
    pub fn new(scope: S) -> Rc<Self> {
        Rc::new(Self {
            scope,
            child: RefCell::new(None),
        })
    }

    pub fn set_handler(self: &Rc<Self>, handler: Rc<dyn Handler>) -> Result<(), CycleError> {
        check_cycle(self.clone(), &handler)?;
        *self.child.borrow_mut() = Some(handler);
        Ok(())
    }

    fn next(&self) -> Next {
        Next {
            child: self.child.borrow().clone(),
        }
    }
}

impl<S: Scope> Handler for ScopedHandler<S> {
    fn is_scoped(&self) -> bool {
        true
    }

    fn enter_scope<'s>(&'s self, req: &'s mut Request) -> Option<LocalBoxFuture<'s, Result<ScopeGuard, HandlerError>>> {
        Some(self.scope.enter(req))
    }

    fn children(&self) -> Vec<Rc<dyn Handler>> {
        self.child.borrow().clone().into_iter().collect()
    }

    fn handle<'s>(&'s self, req: &'s mut Request, res: &'s mut Response) -> LocalBoxFuture<'s, Result<bool, HandlerError>> {
        Box::pin(async move {
            let addr = self as *const Self as *const () as usize;

            if is_entered(req, addr) {
                // the outermost scoped ancestor already established this
                // scope. run the in scope handling directly.
                return self.scope.handle(req, res, self.next()).await;
            }

            // outermost of a scope chain. establish self and every scoped
            // handler reachable through single child links, top down.
            let mut guards: Vec<ScopeGuard> = Vec::new();
            let mut established: Vec<usize> = Vec::new();

            let result = 'dispatch: {
                match self.scope.enter(req).await {
                    Ok(guard) => guards.push(guard),
                    Err(e) => break 'dispatch Err(e),
                }
                mark_entered(req, addr);
                established.push(addr);

                let mut node = self.child.borrow().clone();
                while let Some(handler) = node {
                    if handler.is_scoped() {
                        let handler_addr = Rc::as_ptr(&handler) as *const () as usize;
                        if let Some(enter) = handler.enter_scope(req) {
                            match enter.await {
                                Ok(guard) => guards.push(guard),
                                Err(e) => break 'dispatch Err(e),
                            }
                        }
                        mark_entered(req, handler_addr);
                        established.push(handler_addr);
                    }
                    let children = handler.children();
                    node = if children.len() == 1 {
                        children.into_iter().next()
                    } else {
                        None
                    };
                }

                self.scope.handle(req, res, self.next()).await
            };

            if let Some(state) = req.extensions_mut().get_mut::<ScopeState>() {
                state.entered.retain(|a| !established.contains(a));
            }
            // tear scopes down innermost first.
            while guards.pop().is_some() {}

            result
        })
    }
}

/// error aware handler producing a response for a failed dispatch.
pub trait ErrorHandler {
    fn handle_error<'s>(
        &'s self,
        req: &'s mut Request,
        res: &'s mut Response,
        error: &'s HandlerError,
    ) -> LocalBoxFuture<'s, Result<(), HandlerError>>;
}

/// default error handler: a plain 500 with the status line as body.
#[derive(Clone, Copy, Default)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn handle_error<'s>(
        &'s self,
        _req: &'s mut Request,
        res: &'s mut Response,
        error: &'s HandlerError,
    ) -> LocalBoxFuture<'s, Result<(), HandlerError>> {
        Box::pin(async move {
            tracing::error!("handler error: {error}");
            res.headers_mut().clear();
            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            *res.body_mut() = ResponseBody::bytes("500 Internal Server Error");
            Ok(())
        })
    }
}

/// service bridging the connection dispatcher to the handler tree: applies
/// customizers, invokes the root handler and guards error dispatch loops.
#[derive(Clone)]
pub struct HandlerDispatch {
    root: Rc<dyn Handler>,
    error_handler: Rc<dyn ErrorHandler>,
    customizers: Vec<Rc<dyn Customizer<RequestBody>>>,
    cfg: HttpConfig,
}

impl HandlerDispatch {
    pub fn new(root: Rc<dyn Handler>) -> Self {
        Self {
            root,
            error_handler: Rc::new(DefaultErrorHandler),
            customizers: Vec::new(),
            cfg: HttpConfig::new(),
        }
    }

    pub fn config(mut self, cfg: HttpConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn customizer(mut self, customizer: impl Customizer<RequestBody> + 'static) -> Self {
        self.customizers.push(Rc::new(customizer));
        self
    }

    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Rc::new(handler);
        self
    }
}

impl Service<Request> for HandlerDispatch {
    type Response = Response;
    type Error = Infallible;

    async fn call(&self, mut req: Request) -> Result<Self::Response, Self::Error> {
        for customizer in &self.customizers {
            customizer.customize(&self.cfg, &mut req);
        }

        let mut res = Response::new(ResponseBody::none());
        *res.version_mut() = req.version();

        let mut error = match self.root.handle(&mut req, &mut res).await {
            Ok(true) => return Ok(res),
            Ok(false) => {
                *res.status_mut() = StatusCode::NOT_FOUND;
                *res.body_mut() = ResponseBody::none();
                return Ok(res);
            }
            Err(e) => e,
        };

        let mut dispatches = 0usize;
        loop {
            dispatches += 1;
            if dispatches >= self.cfg.max_error_dispatches {
                // error dispatch loop. short circuit to a bare 500.
                tracing::error!("error dispatch limit reached: {error}");
                let mut res = Response::new(ResponseBody::none());
                *res.version_mut() = req.version();
                *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(res);
            }

            // discard whatever the failed dispatch left behind.
            res = Response::new(ResponseBody::none());
            *res.version_mut() = req.version();

            match self.error_handler.handle_error(&mut req, &mut res, &error).await {
                Ok(()) => return Ok(res),
                Err(e) => error = e,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dummy_request() -> Request {
        http::Request::new(RequestBody::default())
    }

    fn dummy_response() -> Response {
        http::Response::new(ResponseBody::none())
    }

    fn claiming(marker: &'static str) -> Rc<dyn Handler> {
        handler_fn(move |_req: &mut Request, res: &mut Response| {
            Box::pin(async move {
                res.headers_mut()
                    .insert("x-handled-by", http::header::HeaderValue::from_static(marker));
                Ok(true)
            })
        })
    }

    fn declining() -> Rc<dyn Handler> {
        handler_fn(|_req: &mut Request, _res: &mut Response| Box::pin(async { Ok(false) }))
    }

    #[tokio::test]
    async fn list_first_claim_wins() {
        let list = HandlerList::new();
        list.add_handler(declining()).unwrap();
        list.add_handler(claiming("second")).unwrap();
        list.add_handler(claiming("third")).unwrap();

        let mut req = dummy_request();
        let mut res = dummy_response();
        assert!(list.handle(&mut req, &mut res).await.unwrap());
        assert_eq!(res.headers().get("x-handled-by").unwrap(), "second");
    }

    #[tokio::test]
    async fn wrapper_without_child_declines() {
        let wrapper = Wrapper::new();
        let mut req = dummy_request();
        let mut res = dummy_response();
        assert!(!wrapper.handle(&mut req, &mut res).await.unwrap());
    }

    #[test]
    fn cycle_rejected() {
        let outer = Wrapper::new();
        let inner = Wrapper::new();
        outer.set_handler(inner.clone()).unwrap();

        // the outer wrapper must not become a descendant of its child.
        assert!(inner.set_handler(outer.clone() as Rc<dyn Handler>).is_err());

        // a handler is not its own child either.
        assert!(outer.set_handler(outer.clone() as Rc<dyn Handler>).is_err());
    }

    // scope recording enter/handle/teardown order through a shared log.
    struct RecordingScope {
        name: &'static str,
        log: Rc<RefCell<Vec<String>>>,
    }

    struct LogGuard {
        name: &'static str,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Drop for LogGuard {
        fn drop(&mut self) {
            self.log.borrow_mut().push(format!("exit {}", self.name));
        }
    }

    impl Scope for RecordingScope {
        fn enter<'s>(&'s self, _: &'s mut Request) -> LocalBoxFuture<'s, Result<ScopeGuard, HandlerError>> {
            Box::pin(async move {
                self.log.borrow_mut().push(format!("enter {}", self.name));
                Ok(Box::new(LogGuard {
                    name: self.name,
                    log: self.log.clone(),
                }) as ScopeGuard)
            })
        }

        fn handle<'s>(
            &'s self,
            req: &'s mut Request,
            res: &'s mut Response,
            next: Next,
        ) -> LocalBoxFuture<'s, Result<bool, HandlerError>> {
            Box::pin(async move {
                self.log.borrow_mut().push(format!("handle {}", self.name));
                next.run(req, res).await
            })
        }
    }

    #[tokio::test]
    async fn scopes_establish_before_any_handling() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let outer = ScopedHandler::new(RecordingScope {
            name: "outer",
            log: log.clone(),
        });
        let inner = ScopedHandler::new(RecordingScope {
            name: "inner",
            log: log.clone(),
        });

        let leaf_log = log.clone();
        let leaf = handler_fn(move |_req: &mut Request, _res: &mut Response| {
            let log = leaf_log.clone();
            Box::pin(async move {
                log.borrow_mut().push("leaf".to_string());
                Ok(true)
            })
        });

        inner.set_handler(leaf).unwrap();
        outer.set_handler(inner.clone()).unwrap();

        let mut req = dummy_request();
        let mut res = dummy_response();
        assert!(outer.handle(&mut req, &mut res).await.unwrap());

        assert_eq!(
            *log.borrow(),
            [
                "enter outer",
                "enter inner",
                "handle outer",
                "handle inner",
                "leaf",
                "exit inner",
                "exit outer"
            ]
        );
    }

    #[tokio::test]
    async fn dispatch_error_loop_guard() {
        let failing = handler_fn(|_req: &mut Request, _res: &mut Response| {
            Box::pin(async { Err::<bool, HandlerError>("boom".into()) })
        });

        struct FailingErrorHandler;
        impl ErrorHandler for FailingErrorHandler {
            fn handle_error<'s>(
                &'s self,
                _: &'s mut Request,
                _: &'s mut Response,
                _: &'s HandlerError,
            ) -> LocalBoxFuture<'s, Result<(), HandlerError>> {
                Box::pin(async { Err::<(), HandlerError>("still broken".into()) })
            }
        }

        let dispatch = HandlerDispatch::new(failing)
            .config(HttpConfig::new().max_error_dispatches(3))
            .error_handler(FailingErrorHandler);

        let res = dispatch.call(dummy_request()).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unhandled_is_not_found() {
        let dispatch = HandlerDispatch::new(declining());
        let res = dispatch.call(dummy_request()).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
