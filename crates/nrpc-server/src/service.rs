//! Closure-backed services and a registry for bundling them.
use crate::context::CallContext;
use crate::error::{HandlerError, Result, ServerError};
use crate::handler::{HandlerResult, MethodInfo, Request, ServiceHandler};
use crate::server::Server;
use crate::is_valid_token;
use ahash::RandomState;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

type MethodFn = Arc<dyn Fn(CallContext, Request) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

struct Method {
    info: MethodInfo,
    call: MethodFn,
}

fn method_fn<F, Fut>(f: F) -> MethodFn
where
    F: Fn(CallContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx, req| f(ctx, req).boxed())
}

/// A [`ServiceHandler`] routing on the method name to registered closures.
pub struct Service {
    name: String,
    methods: RwLock<HashMap<String, Method, RandomState>>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: RwLock::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    pub fn register_method<F, Fut>(&self, info: MethodInfo, handler: F) -> Result<()>
    where
        F: Fn(CallContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(info, method_fn(handler))
    }

    fn insert(&self, info: MethodInfo, call: MethodFn) -> Result<()> {
        if !is_valid_token(&info.name) {
            return Err(ServerError::InvalidName(info.name));
        }
        let mut methods = self.methods.write();
        if methods.contains_key(&info.name) {
            return Err(ServerError::DuplicateMethod {
                service: self.name.clone(),
                method: info.name,
            });
        }
        methods.insert(info.name.clone(), Method { info, call });
        Ok(())
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }
}

#[async_trait]
impl ServiceHandler for Service {
    fn name(&self) -> &str {
        &self.name
    }

    fn methods(&self) -> BTreeMap<String, MethodInfo> {
        self.methods
            .read()
            .iter()
            .map(|(name, method)| (name.clone(), method.info.clone()))
            .collect()
    }

    async fn handle(&self, ctx: CallContext, req: Request) -> HandlerResult {
        let call = self
            .methods
            .read()
            .get(&req.method)
            .map(|method| Arc::clone(&method.call));
        match call {
            Some(call) => call(ctx, req).await,
            None => Err(HandlerError::not_found(&self.name, &req.method)),
        }
    }
}

/// Fluent construction of a [`Service`].
///
/// ```
/// use nrpc_server::{Response, ServiceBuilder, ServiceHandler};
///
/// let service = ServiceBuilder::new("echo")
///     .method("echo", "returns its input", |_ctx, req| async move {
///         Ok(Response::new(req.data))
///     })
///     .build()
///     .expect("build");
/// assert!(service.methods().contains_key("echo"));
/// ```
pub struct ServiceBuilder {
    name: String,
    methods: Vec<(MethodInfo, MethodFn)>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method<F, Fut>(self, name: &str, description: &str, handler: F) -> Self
    where
        F: Fn(CallContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.with_info(MethodInfo::new(name, description), handler)
    }

    /// A method whose handler publishes items through `ctx.stream()`.
    pub fn streaming_method<F, Fut>(self, name: &str, description: &str, handler: F) -> Self
    where
        F: Fn(CallContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.with_info(MethodInfo::new(name, description).streaming(), handler)
    }

    pub fn with_info<F, Fut>(mut self, info: MethodInfo, handler: F) -> Self
    where
        F: Fn(CallContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.methods.push((info, method_fn(handler)));
        self
    }

    pub fn build(self) -> Result<Service> {
        if !is_valid_token(&self.name) {
            return Err(ServerError::InvalidName(self.name));
        }
        let service = Service::new(self.name);
        for (info, call) in self.methods {
            service.insert(info, call)?;
        }
        Ok(service)
    }
}

/// Named set of services, installed onto a [`Server`] in one step.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn ServiceHandler>, RandomState>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Arc<dyn ServiceHandler>) -> Result<()> {
        let name = service.name().to_string();
        let mut services = self.services.write();
        if services.contains_key(&name) {
            return Err(ServerError::DuplicateService(name));
        }
        services.insert(name, service);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.services.read().get(name).cloned()
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.services.write().remove(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    pub fn install(&self, server: &Server) -> Result<()> {
        for name in self.list() {
            if let Some(service) = self.get(&name) {
                server.register_handler(service)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Response;
    use nrpc_wire::{DataMap, Value};

    fn echo() -> Service {
        ServiceBuilder::new("echo")
            .method("echo", "returns its input", |_ctx, req: Request| async move {
                Ok(Response::new(req.data))
            })
            .streaming_method("count", "streams numbers", |_ctx, _req| async move {
                Ok(Response::default())
            })
            .build()
            .expect("build")
    }

    fn request(method: &str) -> (CallContext, Request) {
        let mut data = DataMap::new();
        data.insert("text".into(), Value::from("hi"));
        (
            CallContext::new("r", "ns.echo.m"),
            Request::new("echo", method, data),
        )
    }

    #[tokio::test]
    async fn routes_by_method_name() {
        let service = echo();
        let (ctx, req) = request("echo");
        let response = service.handle(ctx, req).await.expect("echo");
        assert_eq!(response.data["text"], "hi");
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let service = echo();
        let (ctx, req) = request("missing");
        let err = service.handle(ctx, req).await.expect_err("missing");
        assert_eq!(err.code, "method_not_found");
        assert!(err.message.contains("missing"));
    }

    #[test]
    fn method_info_is_exposed() {
        let methods = echo().methods();
        assert_eq!(methods.keys().collect::<Vec<_>>(), vec!["count", "echo"]);
        assert!(methods["count"].streaming);
        assert!(!methods["echo"].streaming);
        assert_eq!(methods["echo"].description, "returns its input");
    }

    #[test]
    fn duplicate_and_invalid_methods_are_rejected() {
        let service = echo();
        let err = service
            .register_method(MethodInfo::new("echo", "again"), |_ctx, _req| async move {
                Ok(Response::default())
            })
            .expect_err("duplicate");
        assert!(matches!(err, ServerError::DuplicateMethod { ref method, .. } if method == "echo"));

        let err = service
            .register_method(MethodInfo::new("a.b", ""), |_ctx, _req| async move {
                Ok(Response::default())
            })
            .expect_err("dotted");
        assert!(matches!(err, ServerError::InvalidName(_)));

        let err = ServiceBuilder::new("svc")
            .method("m", "", |_ctx, _req| async move { Ok(Response::default()) })
            .method("m", "", |_ctx, _req| async move { Ok(Response::default()) })
            .build()
            .err()
            .expect("duplicate in builder");
        assert!(matches!(err, ServerError::DuplicateMethod { .. }));
    }

    #[test]
    fn registry_tracks_services() {
        let registry = ServiceRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(echo())).expect("echo");
        let health = ServiceBuilder::new("health").build().expect("health");
        registry.register(Arc::new(health)).expect("health");
        let err = registry.register(Arc::new(echo())).expect_err("duplicate");
        assert!(matches!(err, ServerError::DuplicateService(ref name) if name == "echo"));

        assert_eq!(registry.list(), vec!["echo", "health"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("echo").is_some());
        assert!(registry.unregister("echo").is_some());
        assert!(registry.get("echo").is_none());
        assert_eq!(registry.len(), 1);
    }
}
