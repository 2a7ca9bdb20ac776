//! Request interceptors composed around a [`ServiceHandler`].
//!
//! The first middleware installed is the outermost: it sees the request
//! first and the result last.
use crate::context::CallContext;
use crate::handler::{HandlerResult, Request, ServiceHandler};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;

mod guard;
mod observe;
mod resilience;

pub use guard::{Auth, Claims, RateLimit, Validation};
pub use observe::{Logging, MethodStats, Metrics};
pub use resilience::{CircuitBreaker, CircuitState, Recovery, Timeout};

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Inspect or rewrite the call, then either invoke `next` or short-circuit.
    async fn handle(&self, ctx: CallContext, req: Request, next: Next<'_>) -> HandlerResult;
}

enum Tail<'a> {
    Handler(&'a dyn ServiceHandler),
    Then(Box<Next<'a>>),
}

/// The remainder of a middleware chain.
pub struct Next<'a> {
    middleware: &'a [Arc<dyn Middleware>],
    tail: Tail<'a>,
}

impl<'a> Next<'a> {
    pub fn new(middleware: &'a [Arc<dyn Middleware>], handler: &'a dyn ServiceHandler) -> Self {
        Self {
            middleware,
            tail: Tail::Handler(handler),
        }
    }

    pub fn run(self, ctx: CallContext, req: Request) -> BoxFuture<'a, HandlerResult> {
        match self.middleware.split_first() {
            Some((first, rest)) => {
                let next = Next {
                    middleware: rest,
                    tail: self.tail,
                };
                first.handle(ctx, req, next)
            }
            None => match self.tail {
                Tail::Handler(handler) => handler.handle(ctx, req),
                Tail::Then(next) => next.run(ctx, req),
            },
        }
    }
}

/// Several middleware installed as one.
pub struct Chain {
    middleware: Vec<Arc<dyn Middleware>>,
}

pub fn chain(middleware: Vec<Arc<dyn Middleware>>) -> Chain {
    Chain { middleware }
}

#[async_trait]
impl Middleware for Chain {
    async fn handle(&self, ctx: CallContext, req: Request, next: Next<'_>) -> HandlerResult {
        Next {
            middleware: &self.middleware,
            tail: Tail::Then(Box::new(next)),
        }
        .run(ctx, req)
        .await
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handler::{MethodInfo, Response};
    use nrpc_wire::DataMap;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        label: &'static str,
        trace: Trace,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(&self, ctx: CallContext, req: Request, next: Next<'_>) -> HandlerResult {
            self.trace.lock().push(format!("{}-enter", self.label));
            let result = next.run(ctx, req).await;
            self.trace.lock().push(format!("{}-exit", self.label));
            result
        }
    }

    struct Reject;

    #[async_trait]
    impl Middleware for Reject {
        async fn handle(&self, _ctx: CallContext, _req: Request, _next: Next<'_>) -> HandlerResult {
            Err(HandlerError::unauthenticated("nope"))
        }
    }

    struct Recording(Trace);

    #[async_trait]
    impl ServiceHandler for Recording {
        fn name(&self) -> &str {
            "rec"
        }

        fn methods(&self) -> BTreeMap<String, MethodInfo> {
            BTreeMap::new()
        }

        async fn handle(&self, _ctx: CallContext, _req: Request) -> HandlerResult {
            self.0.lock().push("handler".into());
            Ok(Response::default())
        }
    }

    fn recorder(label: &'static str, trace: &Trace) -> Arc<dyn Middleware> {
        Arc::new(Recorder {
            label,
            trace: Arc::clone(trace),
        })
    }

    fn request() -> (CallContext, Request) {
        (
            CallContext::new("r1", "ns.rec.m"),
            Request::new("rec", "m", DataMap::new()),
        )
    }

    #[tokio::test]
    async fn first_installed_runs_outermost() {
        let trace = Trace::default();
        let handler = Recording(Arc::clone(&trace));
        let middleware = vec![recorder("A", &trace), recorder("B", &trace)];
        let (ctx, req) = request();
        Next::new(&middleware, &handler)
            .run(ctx, req)
            .await
            .expect("ok");
        assert_eq!(
            *trace.lock(),
            vec!["A-enter", "B-enter", "handler", "B-exit", "A-exit"]
        );
    }

    #[tokio::test]
    async fn nested_chain_keeps_order() {
        let trace = Trace::default();
        let handler = Recording(Arc::clone(&trace));
        let inner: Arc<dyn Middleware> =
            Arc::new(chain(vec![recorder("B", &trace), recorder("C", &trace)]));
        let middleware = vec![recorder("A", &trace), inner, recorder("D", &trace)];
        let (ctx, req) = request();
        Next::new(&middleware, &handler)
            .run(ctx, req)
            .await
            .expect("ok");
        assert_eq!(
            *trace.lock(),
            vec![
                "A-enter", "B-enter", "C-enter", "D-enter", "handler", "D-exit", "C-exit",
                "B-exit", "A-exit"
            ]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_handler() {
        let trace = Trace::default();
        let handler = Recording(Arc::clone(&trace));
        let middleware = vec![recorder("A", &trace), Arc::new(Reject) as Arc<dyn Middleware>];
        let (ctx, req) = request();
        let err = Next::new(&middleware, &handler)
            .run(ctx, req)
            .await
            .expect_err("rejected");
        assert_eq!(err.code, "unauthenticated");
        assert_eq!(*trace.lock(), vec!["A-enter", "A-exit"]);
    }

    #[test]
    fn panic_message_handles_common_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
