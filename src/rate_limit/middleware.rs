use crate::envelope::{Envelope, Quota, Rejection, Reply};
use crate::error::GatewayError;
use crate::rate_limit::{Decision, RateLimiter};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that enforces rate limits using a [`RateLimiter`].
///
/// Must sit inside the admission layer: envelopes without a principal are refused.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    limiter: Arc<dyn RateLimiter>,
}

impl RateLimitLayer {
    /// Create a new rate limit layer.
    pub fn new<L: RateLimiter + 'static>(limiter: L) -> Self {
        Self { limiter: Arc::new(limiter) }
    }

    pub fn from_arc(limiter: Arc<dyn RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, limiter: self.limiter.clone() }
    }
}

/// Middleware service that enforces rate limits.
///
/// The quota is attached to the envelope on the way in and to both replies and rejections on
/// the way out, so every authenticated response can report it.
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<dyn RateLimiter>,
}

fn quota_for(decision: Decision) -> Quota {
    match decision {
        Decision::Allowed { limit, remaining } => {
            Quota { limit, remaining: Some(remaining), retry_after: None }
        }
        Decision::Rejected { limit, retry_after } => {
            Quota { limit, remaining: Some(0), retry_after: Some(retry_after) }
        }
        Decision::Unmetered { limit } => Quota { limit, remaining: None, retry_after: None },
    }
}

impl<S> Service<Envelope> for RateLimitService<S>
where
    S: Service<Envelope, Response = Reply, Error = Rejection> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = Rejection;
    type Future = BoxFuture<'static, Result<Reply, Rejection>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Envelope) -> Self::Future {
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let principal_id = match &req.principal {
                Some(p) => p.id.clone(),
                None => return Err(GatewayError::MissingCredential.into()),
            };
            let decision = limiter.admit(&principal_id).await;
            let quota = quota_for(decision);

            if let Decision::Rejected { limit, retry_after } = decision {
                return Err(Rejection {
                    error: GatewayError::RateLimitExceeded { limit, window: retry_after },
                    quota: Some(quota),
                });
            }

            req.quota = Some(quota);
            match inner.call(req).await {
                Ok(mut reply) => {
                    reply.quota.get_or_insert(quota);
                    Ok(reply)
                }
                Err(rejection) => Err(rejection.with_quota(Some(quota))),
            }
        })
    }
}
