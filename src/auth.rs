//! Admission: bearer credential check in front of everything else.
//!
//! The gate runs before rate limiting and payload validation, since limits are scoped per
//! principal and anonymous requests never reach the limiter.

use crate::credential::Keyring;
use crate::envelope::{Envelope, Rejection, Reply};
use crate::error::{Dependency, GatewayError, StoreError};
use crate::telemetry::{AdmissionEvent, GatewayEvent, Telemetry};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

const BEARER_PREFIX: &str = "Bearer ";

/// Authentication failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no credential presented")]
    Missing,
    #[error("malformed credential: {0}")]
    Malformed(String),
    #[error("credential not recognised")]
    Invalid,
    #[error("credential store: {0}")]
    Store(StoreError),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        GatewayError::from(self.clone()).code()
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Missing => GatewayError::MissingCredential,
            AuthError::Malformed(why) => GatewayError::MalformedCredential(why),
            AuthError::Invalid => GatewayError::InvalidCredential,
            AuthError::Store(e) => GatewayError::dependency(Dependency::CredentialStore, e),
        }
    }
}

/// Authenticated identity attached to a request. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Principal {
    pub id: String,
    pub name: String,
}

/// Split `Bearer <secret>` into the secret.
pub fn parse_bearer(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.ok_or(AuthError::Missing)?;
    let token = header
        .strip_prefix(BEARER_PREFIX)
        .ok_or_else(|| AuthError::Malformed("expected Bearer scheme".into()))?
        .trim();
    if token.is_empty() {
        return Err(AuthError::Malformed("API key is empty".into()));
    }
    Ok(token)
}

/// Resolves presented credentials to principals.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    keyring: Keyring,
    telemetry: Telemetry,
}

impl AdmissionGate {
    pub fn new(keyring: Keyring) -> Self {
        Self { keyring, telemetry: Telemetry::default() }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Authenticate the raw `Authorization` header value.
    ///
    /// On success the credential's usage is recorded best-effort; a failed write is logged and
    /// does not block admission.
    pub async fn authenticate(&self, header: Option<&str>) -> Result<Principal, AuthError> {
        let result = self.resolve(header).await;
        let event = match &result {
            Ok(principal) => AdmissionEvent::Admitted { principal: principal.id.clone() },
            Err(err) => AdmissionEvent::Denied { code: err.code() },
        };
        self.telemetry.emit(GatewayEvent::Admission(event)).await;
        result
    }

    async fn resolve(&self, header: Option<&str>) -> Result<Principal, AuthError> {
        let secret = parse_bearer(header)?;
        let credential = self.keyring.verify(secret).await.map_err(AuthError::Store)?;
        let credential = credential.ok_or(AuthError::Invalid)?;

        if let Err(err) = self.keyring.record_use(&credential.id).await {
            tracing::warn!(credential_id = %credential.id, error = %err, "failed to record credential use");
        }
        Ok(Principal { id: credential.id, name: credential.name })
    }
}

/// Layer that authenticates every [`Envelope`] before it reaches the inner service.
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    gate: Arc<AdmissionGate>,
}

impl AdmissionLayer {
    pub fn new(gate: AdmissionGate) -> Self {
        Self { gate: Arc::new(gate) }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService { inner, gate: self.gate.clone() }
    }
}

/// Service produced by [`AdmissionLayer`].
#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    gate: Arc<AdmissionGate>,
}

impl<S> Service<Envelope> for AdmissionService<S>
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
        let gate = self.gate.clone();
        let mut inner = self.inner.clone();
        Box::pin(async move {
            let principal = gate
                .authenticate(req.authorization.as_deref())
                .await
                .map_err(|e| Rejection::from(GatewayError::from(e)))?;
            req.principal = Some(principal);
            inner.call(req).await
        })
    }
}
