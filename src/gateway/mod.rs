//! Route-service gateway: authentication gate, identity overlay, forwarding

pub mod auth;
pub mod bypass;
pub mod forwarder;
pub mod identity;
pub mod pipeline;
pub mod provider;
pub mod request;
pub mod router;
mod server;
pub mod session;

pub use auth::{AuthOutcome, AuthenticationGate, Authenticator, Principal, ProviderOutcome};
pub use forwarder::{HttpUpstream, OutboundRequest, RequestForwarder, Upstream};
pub use identity::{DOMAIN_HEADER, IdentityContext, IdentityOverlay, USER_HEADER};
pub use pipeline::{Pipeline, PipelineResult};
pub use router::{AppState, create_router};
pub use server::Gateway;
