//! The admission gate: the boundary between inbound calls and the limiter.
//!
//! A [`Gate`] derives a key and a limit from each inbound request, consumes a
//! unit through an [`Admission`] implementation, and reports the decision with
//! the response metadata the caller should emit.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::ratelimit::{LimitOptions, LimitStatus, Strategy};
use crate::service::AdmissionService;

/// Something that can make admission decisions.
///
/// Implemented by [`AdmissionService`]; gates are generic over it so they can
/// be driven by any limiter.
#[async_trait]
pub trait Admission: Send + Sync {
    /// Status for `key` without consuming anything.
    async fn check(&self, key: &str, options: &LimitOptions) -> LimitStatus;

    /// Consume units for `key` if they are admitted.
    async fn increment(&self, key: &str, options: &LimitOptions) -> LimitStatus;
}

#[async_trait]
impl Admission for AdmissionService {
    async fn check(&self, key: &str, options: &LimitOptions) -> LimitStatus {
        self.check_limit(key, options).await
    }

    async fn increment(&self, key: &str, options: &LimitOptions) -> LimitStatus {
        self.increment_limit(key, options).await
    }
}

/// How a gate picks `max_requests` for a request.
pub enum MaxRequests<R: ?Sized> {
    Fixed(u64),
    /// Computed per request, e.g. from the caller's plan.
    Derived(Arc<dyn Fn(&R) -> u64 + Send + Sync>),
}

impl<R: ?Sized> MaxRequests<R> {
    pub fn derived<F>(f: F) -> Self
    where
        F: Fn(&R) -> u64 + Send + Sync + 'static,
    {
        MaxRequests::Derived(Arc::new(f))
    }

    fn resolve(&self, request: &R) -> u64 {
        match self {
            MaxRequests::Fixed(max) => *max,
            MaxRequests::Derived(f) => f(request),
        }
    }
}

impl<R: ?Sized> Clone for MaxRequests<R> {
    fn clone(&self) -> Self {
        match self {
            MaxRequests::Fixed(max) => MaxRequests::Fixed(*max),
            MaxRequests::Derived(f) => MaxRequests::Derived(f.clone()),
        }
    }
}

impl<R: ?Sized> fmt::Debug for MaxRequests<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxRequests::Fixed(max) => f.debug_tuple("Fixed").field(max).finish(),
            MaxRequests::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// The limit a gate enforces. Unset fields use the service's rules and defaults.
pub struct GatePolicy<R: ?Sized> {
    pub max_requests: MaxRequests<R>,
    pub window_ms: Option<u64>,
    pub strategy: Option<Strategy>,
}

impl<R: ?Sized> Clone for GatePolicy<R> {
    fn clone(&self) -> Self {
        Self {
            max_requests: self.max_requests.clone(),
            window_ms: self.window_ms,
            strategy: self.strategy,
        }
    }
}

impl<R: ?Sized> fmt::Debug for GatePolicy<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatePolicy")
            .field("max_requests", &self.max_requests)
            .field("window_ms", &self.window_ms)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl<R: ?Sized> GatePolicy<R> {
    pub fn new(max_requests: MaxRequests<R>) -> Self {
        Self {
            max_requests,
            window_ms: None,
            strategy: None,
        }
    }

    pub fn with_window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = Some(window_ms);
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    fn options(&self, request: &R) -> LimitOptions {
        LimitOptions {
            max_requests: Some(self.max_requests.resolve(request)),
            window_ms: self.window_ms,
            strategy: self.strategy,
            ..LimitOptions::default()
        }
    }
}

/// Rate limit metadata for a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds
    pub reset_at: u64,
    /// Seconds; only present when the call was limited
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    pub const LIMIT: &'static str = "RateLimit-Limit";
    pub const REMAINING: &'static str = "RateLimit-Remaining";
    pub const RESET: &'static str = "RateLimit-Reset";
    pub const RETRY_AFTER: &'static str = "Retry-After";

    /// Header name/value pairs to emit.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (Self::LIMIT, self.limit.to_string()),
            (Self::REMAINING, self.remaining.to_string()),
            (Self::RESET, self.reset_at.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            pairs.push((Self::RETRY_AFTER, retry_after.to_string()));
        }
        pairs
    }
}

impl From<&LimitStatus> for RateLimitHeaders {
    fn from(status: &LimitStatus) -> Self {
        Self {
            limit: status.limit,
            remaining: status.remaining,
            reset_at: status.reset_at,
            retry_after: status.limited.then_some(status.retry_after),
        }
    }
}

/// What the caller should do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Proceed, emitting the headers.
    Admit(RateLimitHeaders),
    /// Short-circuit the call, emitting the headers.
    Reject(RateLimitHeaders),
    /// No key could be derived; the request is not rate limited.
    Bypass,
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, GateDecision::Reject(_))
    }

    pub fn headers(&self) -> Option<&RateLimitHeaders> {
        match self {
            GateDecision::Admit(headers) | GateDecision::Reject(headers) => Some(headers),
            GateDecision::Bypass => None,
        }
    }
}

/// Applies one limit to inbound requests of type `R`.
pub struct Gate<R: ?Sized, A = AdmissionService> {
    admission: Arc<A>,
    key_fn: Arc<dyn Fn(&R) -> Option<String> + Send + Sync>,
    policy: GatePolicy<R>,
}

impl<R: ?Sized, A: Admission> Gate<R, A> {
    /// Create a gate. `key_fn` returns `None` for requests that should not be
    /// limited.
    pub fn new<F>(admission: Arc<A>, key_fn: F, policy: GatePolicy<R>) -> Self
    where
        F: Fn(&R) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            admission,
            key_fn: Arc::new(key_fn),
            policy,
        }
    }

    pub fn policy(&self) -> &GatePolicy<R> {
        &self.policy
    }

    /// Consume one unit for the request and decide whether it may proceed.
    pub async fn admit(&self, request: &R) -> GateDecision {
        let Some(key) = (self.key_fn)(request) else {
            trace!("No rate limit key for request, bypassing");
            return GateDecision::Bypass;
        };

        let options = self.policy.options(request);
        let status = self.admission.increment(&key, &options).await;
        let headers = RateLimitHeaders::from(&status);

        if status.limited {
            debug!(
                key = %key,
                limit = status.limit,
                retry_after = status.retry_after,
                "Request rejected by gate"
            );
            GateDecision::Reject(headers)
        } else {
            GateDecision::Admit(headers)
        }
    }
}

impl<R: ?Sized, A> Clone for Gate<R, A> {
    fn clone(&self) -> Self {
        Self {
            admission: self.admission.clone(),
            key_fn: self.key_fn.clone(),
            policy: self.policy.clone(),
        }
    }
}
