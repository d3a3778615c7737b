//! Per-request stage runner: bypass or authenticate, assert identity,
//! rebuild, dispatch, relay

use std::sync::Arc;

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use super::auth::{AuthError, AuthOutcome, AuthenticationGate, Authenticator};
use super::bypass::{fallback_identity, should_bypass};
use super::forwarder::{RequestForwarder, Upstream};
use super::identity::{IdentityContext, IdentityOverlay};
use super::request::{InboundRequest, ProxyResponse};
use super::session::{ExceptionRecorder, SessionStore, session_cookie_header};
use crate::config::Config;
use crate::config_reload::LiveConfig;
use crate::{Error, Result};

/// What happened to a request, before it becomes an HTTP response
#[derive(Debug)]
pub enum PipelineResult {
    /// Destination answered; relay verbatim
    Forwarded(ProxyResponse),
    /// Authenticator challenge; relay verbatim
    Challenged(ProxyResponse),
    /// Authentication failed and was recorded in `session_id`
    Rejected {
        /// Failure
        error: AuthError,
        /// Session holding the failure message
        session_id: String,
    },
    /// Routing, identity or transport failure
    Aborted(Error),
}

/// The authentication → identity → forwarding pipeline
#[derive(Clone)]
pub struct Pipeline {
    live_config: Arc<LiveConfig>,
    gate: AuthenticationGate,
    forwarder: RequestForwarder,
    recorder: ExceptionRecorder,
}

impl Pipeline {
    /// Assemble the pipeline from its capabilities
    pub fn new(
        live_config: Arc<LiveConfig>,
        authenticator: Arc<dyn Authenticator>,
        upstream: Arc<dyn Upstream>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            live_config,
            gate: AuthenticationGate::new(authenticator),
            forwarder: RequestForwarder::new(upstream),
            recorder: ExceptionRecorder::new(sessions),
        }
    }

    /// Failure recorder sharing this pipeline's sessions
    #[must_use]
    pub fn recorder(&self) -> &ExceptionRecorder {
        &self.recorder
    }

    /// Run every stage for one request
    pub async fn run(&self, request: &InboundRequest) -> PipelineResult {
        let config = self.live_config.get();
        self.run_with(&config, request).await
    }

    /// Run every stage against one config snapshot
    async fn run_with(&self, config: &Config, request: &InboundRequest) -> PipelineResult {
        let identity = if should_bypass(config) {
            info!("Authentication bypass active, asserting fallback identity");
            match fallback_identity(config) {
                Some(identity) => identity.clone(),
                None => {
                    return PipelineResult::Aborted(Error::Config(
                        "bypass is on but no fallback identity is configured".to_string(),
                    ));
                }
            }
        } else {
            match self
                .gate
                .classify(request, &config.identity.unresolved)
                .await
            {
                AuthOutcome::Authenticated { identity } => identity,
                AuthOutcome::Challenge { response } => return PipelineResult::Challenged(response),
                AuthOutcome::Failed { error } => {
                    let session_id = self.recorder.record(request.session_id.as_deref(), &error);
                    return PipelineResult::Rejected { error, session_id };
                }
            }
        };

        match self.forward(request, &identity).await {
            Ok(response) => PipelineResult::Forwarded(response),
            Err(e) => {
                warn!(error = %e, "Request not forwarded");
                PipelineResult::Aborted(e)
            }
        }
    }

    async fn forward(
        &self,
        request: &InboundRequest,
        identity: &IdentityContext,
    ) -> Result<ProxyResponse> {
        let overlay = IdentityOverlay::new(request, identity);
        self.forwarder.forward(&overlay).await
    }

    /// Run the pipeline and render the HTTP response.
    ///
    /// The snapshot taken here also names the session cookie, so a reload
    /// during the request cannot split it across two configurations.
    pub async fn handle(&self, request: &InboundRequest) -> Response {
        let config = self.live_config.get();
        let result = self.run_with(&config, request).await;
        render(result, &config.session.cookie_name)
    }
}

/// Turn a pipeline result into the response sent to the caller
#[must_use]
pub fn render(result: PipelineResult, cookie_name: &str) -> Response {
    match result {
        PipelineResult::Forwarded(response) | PipelineResult::Challenged(response) => {
            response.into_response()
        }
        PipelineResult::Rejected { error, session_id } => {
            let mut response = match error.response {
                Some(provider_response) => provider_response,
                None => ProxyResponse::new(StatusCode::UNAUTHORIZED, error.message).with_header(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                ),
            };
            if let Some(cookie) = session_cookie_header(cookie_name, &session_id) {
                response.headers.append(header::SET_COOKIE, cookie);
            }
            response.into_response()
        }
        PipelineResult::Aborted(e) => (e.status_code(), e.to_string()).into_response(),
    }
}
