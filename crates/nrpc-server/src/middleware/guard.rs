// Admission middleware: authentication, rate limiting and request validation.
use super::{Middleware, Next};
use crate::context::CallContext;
use crate::error::HandlerError;
use crate::handler::{HandlerResult, Request};
use ahash::RandomState;
use async_trait::async_trait;
use hashbrown::HashMap;
use nrpc_wire::{DataMap, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

const AUTHORIZATION_KEY: &str = "authorization";
const CLIENT_ID_KEY: &str = "client_id";
const ANONYMOUS_CLIENT: &str = "anonymous";

type TokenValidator = Arc<dyn Fn(&str) -> anyhow::Result<DataMap> + Send + Sync>;
type RequestValidator = Arc<dyn Fn(&Request) -> anyhow::Result<()> + Send + Sync>;

/// Claims produced by the [`Auth`] validator, readable downstream via
/// `ctx.value::<Claims>()`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Claims(pub DataMap);

impl Claims {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

/// Requires a string `authorization` metadata entry accepted by the validator.
pub struct Auth {
    validator: TokenValidator,
}

impl Auth {
    pub fn new<F>(validator: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<DataMap> + Send + Sync + 'static,
    {
        Self {
            validator: Arc::new(validator),
        }
    }
}

#[async_trait]
impl Middleware for Auth {
    async fn handle(&self, mut ctx: CallContext, req: Request, next: Next<'_>) -> HandlerResult {
        let Some(token) = req.metadata.get(AUTHORIZATION_KEY).and_then(Value::as_str) else {
            return Err(HandlerError::unauthenticated(
                "authorization token required",
            ));
        };
        let claims = (self.validator)(token)
            .map_err(|err| HandlerError::unauthenticated(format!("invalid token: {err:#}")))?;
        ctx.insert_value(Claims(claims));
        next.run(ctx, req).await
    }
}

struct RateWindow {
    started: Instant,
    counts: HashMap<String, u32, RandomState>,
}

/// Fixed-window limiter keyed by the `client_id` metadata entry.
pub struct RateLimit {
    limit: u32,
    window: Duration,
    state: Mutex<RateWindow>,
}

impl RateLimit {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(RateWindow {
                started: Instant::now(),
                counts: HashMap::with_hasher(RandomState::new()),
            }),
        }
    }

    fn admit(&self, client: &str) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.counts.clear();
        }
        let count = state.counts.entry(client.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count <= self.limit
    }
}

#[async_trait]
impl Middleware for RateLimit {
    async fn handle(&self, ctx: CallContext, req: Request, next: Next<'_>) -> HandlerResult {
        let client = req
            .metadata
            .get(CLIENT_ID_KEY)
            .and_then(Value::as_str)
            .unwrap_or(ANONYMOUS_CLIENT);
        if !self.admit(client) {
            tracing::debug!(client, service = %req.service, "rate limit exceeded");
            return Err(HandlerError::rate_limited("rate limit exceeded"));
        }
        next.run(ctx, req).await
    }
}

/// Rejects requests the predicate refuses before they reach the handler.
pub struct Validation {
    validator: RequestValidator,
}

impl Validation {
    pub fn new<F>(validator: F) -> Self
    where
        F: Fn(&Request) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            validator: Arc::new(validator),
        }
    }
}

#[async_trait]
impl Middleware for Validation {
    async fn handle(&self, ctx: CallContext, req: Request, next: Next<'_>) -> HandlerResult {
        (self.validator)(&req)
            .map_err(|err| HandlerError::invalid_argument(format!("validation failed: {err:#}")))?;
        next.run(ctx, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{MethodInfo, Response, ServiceHandler};
    use std::collections::BTreeMap;

    // Echoes the subject claim back so tests can see what reached the handler.
    struct WhoAmI;

    #[async_trait]
    impl ServiceHandler for WhoAmI {
        fn name(&self) -> &str {
            "who"
        }

        fn methods(&self) -> BTreeMap<String, MethodInfo> {
            BTreeMap::new()
        }

        async fn handle(&self, ctx: CallContext, _req: Request) -> HandlerResult {
            let mut data = DataMap::new();
            if let Some(subject) = ctx.value::<Claims>().and_then(|claims| claims.get("sub")) {
                data.insert("sub".into(), subject.clone());
            }
            Ok(Response::new(data))
        }
    }

    fn request(metadata: &[(&str, &str)]) -> Request {
        let metadata = metadata
            .iter()
            .map(|(key, value)| (key.to_string(), Value::from(*value)))
            .collect();
        Request::new("who", "am_i", DataMap::new()).with_metadata(metadata)
    }

    async fn run(middleware: impl Middleware + 'static, req: Request) -> HandlerResult {
        let stack: Vec<Arc<dyn Middleware>> = vec![Arc::new(middleware)];
        Next::new(&stack, &WhoAmI)
            .run(CallContext::new("r", "ns.who.am_i"), req)
            .await
    }

    fn auth() -> Auth {
        Auth::new(|token| {
            if token == "good" {
                let mut claims = DataMap::new();
                claims.insert("sub".into(), Value::from("alice"));
                Ok(claims)
            } else {
                anyhow::bail!("unknown token")
            }
        })
    }

    #[tokio::test]
    async fn auth_attaches_claims() {
        let response = run(auth(), request(&[("authorization", "good")]))
            .await
            .expect("authorized");
        assert_eq!(response.data["sub"], "alice");
    }

    #[tokio::test]
    async fn auth_rejects_missing_and_invalid_tokens() {
        let missing = run(auth(), request(&[])).await.expect_err("missing");
        assert_eq!(missing.code, "unauthenticated");
        assert_eq!(missing.message, "authorization token required");

        let invalid = run(auth(), request(&[("authorization", "bad")]))
            .await
            .expect_err("invalid");
        assert_eq!(invalid.code, "unauthenticated");
        assert_eq!(invalid.message, "invalid token: unknown token");
    }

    #[tokio::test]
    async fn rate_limit_is_per_client_and_resets_with_window() {
        let limiter = Arc::new(RateLimit::new(2, Duration::from_millis(100)));
        let stack: Vec<Arc<dyn Middleware>> = vec![limiter];
        let call = |client: Option<&'static str>| {
            let req = match client {
                Some(id) => request(&[("client_id", id)]),
                None => request(&[]),
            };
            Next::new(&stack, &WhoAmI).run(CallContext::new("r", "s"), req)
        };

        call(Some("a")).await.expect("first");
        call(Some("a")).await.expect("second");
        let err = call(Some("a")).await.expect_err("third");
        assert_eq!(err.code, "rate_limited");
        call(Some("b")).await.expect("other client");
        call(None).await.expect("anonymous");

        tokio::time::sleep(Duration::from_millis(150)).await;
        call(Some("a")).await.expect("new window");
    }

    #[test]
    fn saturated_counter_keeps_rejecting() {
        let limiter = RateLimit::new(u32::MAX, Duration::from_secs(60));
        limiter.state.lock().counts.insert("hot".to_string(), u32::MAX);
        assert!(!limiter.admit("hot"));
        assert!(!limiter.admit("hot"));
        assert_eq!(limiter.state.lock().counts["hot"], u32::MAX);
        assert!(limiter.admit("cold"));
    }

    #[tokio::test]
    async fn validation_failure_is_invalid_argument() {
        let validation = Validation::new(|req| {
            anyhow::ensure!(req.metadata.contains_key("tenant"), "tenant missing");
            Ok(())
        });
        let err = run(validation, request(&[])).await.expect_err("invalid");
        assert_eq!(err.code, "invalid_argument");
        assert_eq!(err.message, "validation failed: tenant missing");
    }
}
