//! Authentication gate
//!
//! The authentication engine itself is external and reached through the
//! [`Authenticator`] trait. The gate runs it once per request and turns its
//! answer into an [`AuthOutcome`] carrying the identity the gateway asserts.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::identity::IdentityContext;
use super::request::{InboundRequest, ProxyResponse};
use crate::Result;

/// Who the provider authenticated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Authenticated user name
    pub user: String,
    /// Directory domain, when the provider resolves one
    pub domain: Option<String>,
}

impl Principal {
    /// Principal with a resolved domain
    pub fn with_domain(user: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            domain: Some(domain.into()),
        }
    }

    /// Principal without directory information
    pub fn without_domain(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            domain: None,
        }
    }
}

/// Authentication rejected or could not be processed
#[derive(Debug, Clone)]
pub struct AuthError {
    /// Human-readable reason
    pub message: String,
    /// Response the provider wants sent to the caller, if any
    pub response: Option<ProxyResponse>,
}

impl AuthError {
    /// Failure without a provider response
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            response: None,
        }
    }

    /// Failure with the provider's own response
    #[must_use]
    pub fn with_response(mut self, response: ProxyResponse) -> Self {
        self.response = Some(response);
        self
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AuthError {}

/// What an [`Authenticator`] reports for one request
#[derive(Debug, Clone)]
pub enum ProviderOutcome {
    /// Caller verified
    Authenticated(Principal),
    /// Protocol turnaround: send this response and stop
    Challenge(ProxyResponse),
    /// Caller rejected
    Failed(AuthError),
}

/// Outcome of the gate, produced once per request
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// Proceed with this identity
    Authenticated {
        /// Identity to assert downstream
        identity: IdentityContext,
    },
    /// The caller must answer a challenge first
    Challenge {
        /// Response to relay
        response: ProxyResponse,
    },
    /// Terminal failure for this request
    Failed {
        /// Reason
        error: AuthError,
    },
}

/// External authentication capability
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate one request
    async fn authenticate(&self, request: &InboundRequest) -> ProviderOutcome;

    /// Apply a new property snapshot. Errors leave the previous settings active.
    fn reconfigure(&self, _properties: &BTreeMap<String, String>) -> Result<()> {
        Ok(())
    }

    /// Short name for logs
    fn name(&self) -> &str;
}

/// Runs the authenticator and resolves the asserted identity
#[derive(Clone)]
pub struct AuthenticationGate {
    authenticator: Arc<dyn Authenticator>,
}

impl AuthenticationGate {
    /// Create a gate over `authenticator`
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }

    /// The wrapped authenticator
    #[must_use]
    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    /// Authenticate `request`. A principal without a domain resolves to
    /// `unresolved`.
    pub async fn classify(
        &self,
        request: &InboundRequest,
        unresolved: &IdentityContext,
    ) -> AuthOutcome {
        match self.authenticator.authenticate(request).await {
            ProviderOutcome::Authenticated(Principal {
                user,
                domain: Some(domain),
            }) => {
                debug!(provider = self.authenticator.name(), user = %user, domain = %domain, "Authenticated request");
                AuthOutcome::Authenticated {
                    identity: IdentityContext::new(user, domain),
                }
            }
            ProviderOutcome::Authenticated(Principal { user, domain: None }) => {
                debug!(
                    provider = self.authenticator.name(),
                    user = %user,
                    "Provider reported no domain, asserting unresolved identity"
                );
                AuthOutcome::Authenticated {
                    identity: unresolved.clone(),
                }
            }
            ProviderOutcome::Challenge(response) => {
                debug!(provider = self.authenticator.name(), status = %response.status, "Authentication challenge");
                AuthOutcome::Challenge { response }
            }
            ProviderOutcome::Failed(error) => {
                warn!(provider = self.authenticator.name(), error = %error, "Authentication failed");
                AuthOutcome::Failed { error }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::{HeaderMap, Method, StatusCode, Uri};

    use super::*;

    struct Fixed {
        outcome: ProviderOutcome,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Authenticator for Fixed {
        async fn authenticate(&self, _request: &InboundRequest) -> ProviderOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn gate(outcome: ProviderOutcome) -> (AuthenticationGate, Arc<Fixed>) {
        let auth = Arc::new(Fixed {
            outcome,
            calls: AtomicUsize::new(0),
        });
        (AuthenticationGate::new(auth.clone()), auth)
    }

    fn request() -> InboundRequest {
        InboundRequest::new(Method::GET, Uri::from_static("/"), HeaderMap::new())
    }

    fn unresolved() -> IdentityContext {
        IdentityContext::new("unknown", "unknown")
    }

    #[tokio::test]
    async fn test_domain_principal_becomes_identity() {
        let (gate, auth) = gate(ProviderOutcome::Authenticated(Principal::with_domain(
            "alice", "CORP",
        )));
        let outcome = gate.classify(&request(), &unresolved()).await;
        match outcome {
            AuthOutcome::Authenticated { identity } => {
                assert_eq!(identity, IdentityContext::new("alice", "CORP"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_principal_without_domain_uses_unresolved_identity() {
        let (gate, _) = gate(ProviderOutcome::Authenticated(Principal::without_domain("bob")));
        let outcome = gate.classify(&request(), &unresolved()).await;
        assert!(matches!(
            outcome,
            AuthOutcome::Authenticated { identity } if identity == unresolved()
        ));
    }

    #[tokio::test]
    async fn test_challenge_and_failure_pass_through() {
        let challenge = ProxyResponse::new(StatusCode::UNAUTHORIZED, "");
        let (gate_a, _) = gate(ProviderOutcome::Challenge(challenge));
        assert!(matches!(
            gate_a.classify(&request(), &unresolved()).await,
            AuthOutcome::Challenge { response } if response.status == StatusCode::UNAUTHORIZED
        ));

        let (gate_b, auth) = gate(ProviderOutcome::Failed(AuthError::new("bad credentials")));
        assert!(matches!(
            gate_b.classify(&request(), &unresolved()).await,
            AuthOutcome::Failed { error } if error.message == "bad credentials"
        ));
        // Failures are not retried
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }
}
