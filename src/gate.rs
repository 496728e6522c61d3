use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::{HeaderValue, Request, Response, StatusCode};
use serde_json::json;
use thiserror::Error;
use tower::Service;

use crate::breaker::{BreakerRegistry, CircuitBreaker};
use crate::error::{BreakerError, CircuitOpenError, RateLimitExceeded, TaskError};
use crate::executor::TaskExecutor;
use crate::http::{Body, BoxError, HttpService, json_response};
use crate::limiter::{Identity, RateLimitResult, RateLimiter};

type ServiceFuture = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;
type FailurePolicy = Arc<dyn Fn(&Response<Body>) -> bool + Send + Sync>;

/// Why a request was not served.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("{error}")]
    RateLimited {
        #[source]
        error: RateLimitExceeded,
        result: RateLimitResult,
    },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("upstream call failed: {0}")]
    Upstream(BoxError),
}

impl GateError {
    pub fn status(&self) -> StatusCode {
        match self {
            GateError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            GateError::Task(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            GateError::Task(_) | GateError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render as the JSON error response clients receive.
    pub fn into_response(self) -> Response<Body> {
        let status = self.status();
        match self {
            GateError::RateLimited { error, result } => {
                let mut resp = json_response(
                    status,
                    &json!({
                        "error": "RATE_LIMIT_EXCEEDED",
                        "message": format!(
                            "Rate limit exceeded. Try again in {} seconds.",
                            error.retry_after
                        ),
                        "retry_after": error.retry_after,
                    }),
                );
                resp.headers_mut().extend(result.headers());
                resp
            }
            GateError::CircuitOpen(error) => {
                let mut resp = json_response(
                    status,
                    &json!({
                        "error": "CIRCUIT_BREAKER_OPEN",
                        "message": format!("Service temporarily unavailable: {}", error.name),
                    }),
                );
                if let Some(wait) = error.retry_after {
                    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
                    resp.headers_mut()
                        .insert(http::header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
                }
                resp
            }
            GateError::Task(error) if error.is_timeout() => json_response(
                status,
                &json!({ "error": "TIMEOUT", "message": error.to_string() }),
            ),
            other => {
                tracing::error!(error = %other, "request failed");
                json_response(
                    status,
                    &json!({ "error": "INTERNAL_ERROR", "message": "Internal server error" }),
                )
            }
        }
    }
}

/// Entry point for request handlers: rate limiting, breaker-protected
/// calls, and bounded blocking work, composed over shared components.
///
/// Cheaply cloneable; handed to handlers by injection.
#[derive(Clone)]
pub struct RequestGate {
    limiter: RateLimiter,
    breakers: BreakerRegistry,
    executor: TaskExecutor,
}

impl RequestGate {
    pub fn new(limiter: RateLimiter, breakers: BreakerRegistry, executor: TaskExecutor) -> Self {
        Self {
            limiter,
            breakers,
            executor,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Count one request for `identity` against every default window.
    pub async fn check_rate_limit(&self, identity: &Identity) -> Result<RateLimitResult, GateError> {
        let result = self.limiter.check_identity(identity).await;
        if result.allowed {
            return Ok(result);
        }
        Err(GateError::RateLimited {
            error: RateLimitExceeded {
                key: identity.to_string(),
                limit: result.limit,
                retry_after: result.retry_after.unwrap_or(1),
            },
            result,
        })
    }

    /// Run an async call to dependency `name` under its circuit breaker.
    pub async fn call_through_breaker<F, Fut, T, E>(&self, name: &str, f: F) -> Result<T, GateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.breakers
            .breaker(name)
            .call(f)
            .await
            .map_err(|e| match e {
                BreakerError::Open(open) => GateError::CircuitOpen(open),
                BreakerError::Inner(e) => GateError::Upstream(e.into()),
            })
    }

    /// Run blocking work for dependency `name` on the executor, under its
    /// circuit breaker. Timeouts count as breaker failures.
    pub async fn call_blocking<F, T, E>(
        &self,
        name: &str,
        f: F,
        timeout: Option<Duration>,
    ) -> Result<T, GateError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.breakers
            .breaker(name)
            .call(|| self.executor.run(f, timeout))
            .await
            .map_err(|e| match e {
                BreakerError::Open(open) => GateError::CircuitOpen(open),
                BreakerError::Inner(task) => GateError::Task(task),
            })
    }
}

/// Peer address of the connection a request arrived on, inserted as a
/// request extension by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// The caller's identity: `x-user-id` when present, otherwise the first
/// `x-forwarded-for` address, otherwise the connection's [`ClientAddr`].
pub fn identity_from_request<B>(req: &Request<B>) -> Identity {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    if let Some(user) = header("x-user-id") {
        return Identity::User(user.to_string());
    }
    let forwarded = header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(addr) = forwarded {
        return Identity::Ip(addr.to_string());
    }
    match req.extensions().get::<ClientAddr>() {
        Some(ClientAddr(peer)) => Identity::Ip(peer.ip().to_string()),
        None => Identity::Ip("unknown".to_string()),
    }
}

/// Tower layer enforcing the limiter's default windows per caller.
///
/// Denied requests get a 429 JSON response; allowed responses carry the
/// `X-RateLimit-*` headers.
#[derive(Clone)]
pub struct RateLimitLayer {
    gate: RequestGate,
}

impl RateLimitLayer {
    pub fn new(gate: RequestGate) -> Self {
        Self { gate }
    }
}

impl tower::Layer<HttpService> for RateLimitLayer {
    type Service = RateLimitService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        RateLimitService {
            inner,
            gate: self.gate.clone(),
        }
    }
}

pub struct RateLimitService {
    inner: HttpService,
    gate: RequestGate,
}

impl Service<Request<Body>> for RateLimitService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = ServiceFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let identity = identity_from_request(&req);
        let gate = self.gate.clone();
        let fut = self.inner.call(req);

        Box::pin(async move {
            match gate.check_rate_limit(&identity).await {
                Err(rejected) => {
                    drop(fut);
                    Ok(rejected.into_response())
                }
                Ok(result) => {
                    let mut resp = fut.await?;
                    resp.headers_mut().extend(result.headers());
                    Ok(resp)
                }
            }
        })
    }
}

/// Tower layer routing requests through one [`CircuitBreaker`].
///
/// Inner errors and, by default, 5xx responses count as failures. While
/// the breaker is open requests are answered with a 503 JSON response and
/// never reach the inner service.
#[derive(Clone)]
pub struct CircuitBreakerLayer {
    breaker: CircuitBreaker,
    failure_policy: FailurePolicy,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self {
            breaker,
            failure_policy: Arc::new(|resp| resp.status().is_server_error()),
        }
    }

    /// Decide which responses count as failures.
    pub fn failure_policy<F>(mut self, f: F) -> Self
    where
        F: Fn(&Response<Body>) -> bool + Send + Sync + 'static,
    {
        self.failure_policy = Arc::new(f);
        self
    }
}

impl tower::Layer<HttpService> for CircuitBreakerLayer {
    type Service = CircuitBreakerService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        CircuitBreakerService {
            inner,
            breaker: self.breaker.clone(),
            failure_policy: self.failure_policy.clone(),
        }
    }
}

pub struct CircuitBreakerService {
    inner: HttpService,
    breaker: CircuitBreaker,
    failure_policy: FailurePolicy,
}

impl Service<Request<Body>> for CircuitBreakerService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = ServiceFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(open) => {
                let resp = GateError::CircuitOpen(open).into_response();
                return Box::pin(std::future::ready(Ok(resp)));
            }
        };
        let failure_policy = self.failure_policy.clone();
        let fut = self.inner.call(req);

        Box::pin(async move {
            match fut.await {
                Ok(resp) => {
                    permit.record(!failure_policy(&resp));
                    Ok(resp)
                }
                Err(e) => {
                    permit.record(false);
                    Err(e)
                }
            }
        })
    }
}
