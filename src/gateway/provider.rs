//! Authentication providers
//!
//! [`RemoteAuthenticator`] delegates verification to an external endpoint
//! (the provider bind string). The endpoint sees the caller's credentials and
//! answers with an account, a protocol challenge, or a rejection:
//!
//! - `2xx` with `{"user": "...", "properties": {"domain.dns.name": "..."}}`
//! - `401` carrying `WWW-Authenticate`: relayed to the caller as a challenge
//! - anything else: authentication failure

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderValue, StatusCode, header};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, trace, warn};
use url::Url;

use super::auth::{AuthError, Authenticator, Principal, ProviderOutcome};
use super::request::{InboundRequest, ProxyResponse};
use crate::config::{Config, ProviderKind, keys, resolve_secret};
use crate::{Error, Result};

/// Log target for provider exchanges, tuned by `provider.log.level`
pub const LOG_TARGET: &str = "route_auth_gateway::provider";

/// Service account name sent to the verification endpoint
pub const SERVICE_ACCOUNT_HEADER: &str = "x-auth-service-account";
/// Service account password sent to the verification endpoint
pub const SERVICE_PASSWORD_HEADER: &str = "x-auth-service-password";

/// Account property holding the directory domain
pub const DOMAIN_PROPERTY: &str = "domain.dns.name";

/// How user names are presented once the domain is known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CanonicalForm {
    /// `alice`
    #[default]
    Username,
    /// `CORP\alice`
    Backslash,
    /// `alice@CORP`
    Principal,
}

impl CanonicalForm {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "username" => Ok(Self::Username),
            "backslash" => Ok(Self::Backslash),
            "principal" => Ok(Self::Principal),
            other => Err(Error::Config(format!(
                "{} must be username, backslash or principal, got '{other}'",
                keys::CANONICAL_FORM
            ))),
        }
    }

    /// Present `user` in this form
    #[must_use]
    pub fn apply(self, user: &str, domain: Option<&str>) -> String {
        match (self, domain) {
            (Self::Backslash, Some(d)) => format!("{d}\\{user}"),
            (Self::Principal, Some(d)) => format!("{user}@{d}"),
            _ => user.to_string(),
        }
    }
}

/// Typed view of the recognized provider properties
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    /// Verification endpoint
    pub bind_url: Url,
    /// Service account name
    pub service_account: Option<String>,
    /// Service account password, already resolved
    pub service_password: Option<String>,
    /// User name presentation
    pub canonical_form: CanonicalForm,
    /// Directory servers
    pub dns_servers: Vec<String>,
    /// Directory site
    pub dns_site: Option<String>,
    /// Verbosity 0..=4
    pub log_level: Option<u8>,
}

impl ProviderSettings {
    /// Parse the recognized keys. Unrecognized keys are ignored.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| properties.get(key).map(String::as_str).filter(|v| !v.is_empty());

        let bind_str = get(keys::BIND_STR)
            .ok_or_else(|| Error::Config(format!("{} is required", keys::BIND_STR)))?;
        let bind_url = Url::parse(bind_str)
            .map_err(|e| Error::Config(format!("Invalid {} '{bind_str}': {e}", keys::BIND_STR)))?;
        if !matches!(bind_url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "{} must be an http(s) URL",
                keys::BIND_STR
            )));
        }

        let canonical_form = get(keys::CANONICAL_FORM)
            .map(CanonicalForm::parse)
            .transpose()?
            .unwrap_or_default();

        let log_level = get(keys::LOG_LEVEL)
            .map(|v| {
                v.parse::<u8>()
                    .ok()
                    .filter(|l| *l <= 4)
                    .ok_or_else(|| Error::Config(format!("{} must be 0-4, got '{v}'", keys::LOG_LEVEL)))
            })
            .transpose()?;

        let dns_servers = get(keys::DNS_SERVERS)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_url,
            service_account: get(keys::SERVICE_ACCOUNT).map(str::to_string),
            service_password: get(keys::SERVICE_PASSWORD).map(resolve_secret),
            canonical_form,
            dns_servers,
            dns_site: get(keys::DNS_SITE).map(str::to_string),
            log_level,
        })
    }

    /// `tracing` filter directive for the provider target, if a level is set
    #[must_use]
    pub fn log_directive(&self) -> Option<String> {
        self.log_level.map(|level| {
            let filter = match level {
                0 => "error",
                1 => "warn",
                2 => "info",
                3 => "debug",
                _ => "trace",
            };
            format!("{LOG_TARGET}={filter}")
        })
    }
}

#[derive(Debug, Deserialize)]
struct Account {
    user: String,
    #[serde(default)]
    properties: HashMap<String, serde_json::Value>,
}

impl Account {
    fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(serde_json::Value::as_str)
    }
}

/// Delegates authentication to a verification endpoint
pub struct RemoteAuthenticator {
    client: Client,
    settings: RwLock<Arc<ProviderSettings>>,
}

impl RemoteAuthenticator {
    /// Create from the property map
    pub fn new(properties: &BTreeMap<String, String>, timeout: Duration) -> Result<Self> {
        let settings = ProviderSettings::from_properties(properties)?;
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Auth(e.to_string()))?;
        Ok(Self {
            client,
            settings: RwLock::new(Arc::new(settings)),
        })
    }

    /// Current settings snapshot
    #[must_use]
    pub fn settings(&self) -> Arc<ProviderSettings> {
        Arc::clone(&self.settings.read())
    }

    async fn verify(&self, request: &InboundRequest) -> std::result::Result<ProviderOutcome, reqwest::Error> {
        let settings = self.settings();

        let mut call = self
            .client
            .get(settings.bind_url.clone())
            .header("X-Forwarded-Method", request.method.as_str())
            .header("X-Forwarded-Uri", request.uri.to_string());
        for value in request.headers.get_all(header::AUTHORIZATION) {
            call = call.header(header::AUTHORIZATION, value.clone());
        }
        // The caller owns Authorization; the service account travels beside it
        if let Some(account) = &settings.service_account {
            call = call.header(SERVICE_ACCOUNT_HEADER, account.as_str());
            if let Some(password) = &settings.service_password {
                call = call.header(SERVICE_PASSWORD_HEADER, password.as_str());
            }
        }
        if !settings.dns_servers.is_empty() {
            call = call.header("X-Auth-Dns-Servers", settings.dns_servers.join(","));
        }
        if let Some(site) = &settings.dns_site {
            call = call.header("X-Auth-Dns-Site", site.as_str());
        }

        let response = call.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        trace!(target: LOG_TARGET, status = %status, bytes = body.len(), "Provider response");

        if status.is_success() {
            return Ok(match serde_json::from_slice::<Account>(&body) {
                Ok(account) => {
                    let domain = account.property(DOMAIN_PROPERTY).map(str::to_string);
                    let user = settings.canonical_form.apply(&account.user, domain.as_deref());
                    debug!(target: LOG_TARGET, user = %user, domain = ?domain, "Provider accepted caller");
                    ProviderOutcome::Authenticated(Principal { user, domain })
                }
                Err(e) => ProviderOutcome::Failed(AuthError::new(format!(
                    "Provider returned an unreadable account: {e}"
                ))),
            });
        }

        let relayed = ProxyResponse {
            status,
            headers,
            body,
        }
        .without_hop_by_hop();
        if status == StatusCode::UNAUTHORIZED && relayed.headers.contains_key(header::WWW_AUTHENTICATE) {
            return Ok(ProviderOutcome::Challenge(relayed));
        }

        let message = String::from_utf8_lossy(&relayed.body).trim().to_string();
        let message = if message.is_empty() {
            format!("Provider rejected request with status {status}")
        } else {
            message
        };
        Ok(ProviderOutcome::Failed(AuthError::new(message).with_response(relayed)))
    }
}

#[async_trait]
impl Authenticator for RemoteAuthenticator {
    async fn authenticate(&self, request: &InboundRequest) -> ProviderOutcome {
        match self.verify(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(target: LOG_TARGET, error = %e, "Provider unreachable");
                ProviderOutcome::Failed(AuthError::new(format!(
                    "Authentication provider unavailable: {e}"
                )))
            }
        }
    }

    fn reconfigure(&self, properties: &BTreeMap<String, String>) -> Result<()> {
        let settings = ProviderSettings::from_properties(properties)?;
        *self.settings.write() = Arc::new(settings);
        Ok(())
    }

    fn name(&self) -> &str {
        "remote"
    }
}

/// Refuses every request
pub struct RejectAuthenticator;

#[async_trait]
impl Authenticator for RejectAuthenticator {
    async fn authenticate(&self, _request: &InboundRequest) -> ProviderOutcome {
        ProviderOutcome::Failed(
            AuthError::new("No authentication provider configured").with_response(
                ProxyResponse::new(StatusCode::FORBIDDEN, "No authentication provider configured")
                    .with_header(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; charset=utf-8"),
                    ),
            ),
        )
    }

    fn name(&self) -> &str {
        "reject"
    }
}

/// Build the authenticator selected by `config`
pub fn build_authenticator(config: &Config) -> Result<Arc<dyn Authenticator>> {
    match config.provider.kind {
        ProviderKind::Remote => Ok(Arc::new(RemoteAuthenticator::new(
            &config.properties,
            config.upstream.timeout,
        )?)),
        ProviderKind::Reject => Ok(Arc::new(RejectAuthenticator)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_settings_parse_recognized_keys() {
        let settings = ProviderSettings::from_properties(&props(&[
            (keys::BIND_STR, "https://auth.corp.example/verify"),
            (keys::SERVICE_ACCOUNT, "svc-gateway"),
            (keys::SERVICE_PASSWORD, "secret"),
            (keys::CANONICAL_FORM, "BACKSLASH"),
            (keys::DNS_SERVERS, "10.0.0.1, 10.0.0.2,"),
            (keys::DNS_SITE, "HQ"),
            (keys::LOG_LEVEL, "4"),
            ("provider.something.else", "kept"),
        ]))
        .unwrap();

        assert_eq!(settings.bind_url.host_str(), Some("auth.corp.example"));
        assert_eq!(settings.service_account.as_deref(), Some("svc-gateway"));
        assert_eq!(settings.service_password.as_deref(), Some("secret"));
        assert_eq!(settings.canonical_form, CanonicalForm::Backslash);
        assert_eq!(settings.dns_servers, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(settings.dns_site.as_deref(), Some("HQ"));
        assert_eq!(
            settings.log_directive().as_deref(),
            Some("route_auth_gateway::provider=trace")
        );
    }

    #[test]
    fn test_settings_reject_bad_values() {
        assert!(ProviderSettings::from_properties(&props(&[])).is_err());
        assert!(ProviderSettings::from_properties(&props(&[(keys::BIND_STR, "ldap://dc1")])).is_err());
        assert!(
            ProviderSettings::from_properties(&props(&[
                (keys::BIND_STR, "http://auth/verify"),
                (keys::LOG_LEVEL, "9"),
            ]))
            .is_err()
        );
        assert!(
            ProviderSettings::from_properties(&props(&[
                (keys::BIND_STR, "http://auth/verify"),
                (keys::CANONICAL_FORM, "upn"),
            ]))
            .is_err()
        );
    }

    #[test]
    fn test_canonical_forms() {
        assert_eq!(CanonicalForm::Username.apply("alice", Some("CORP")), "alice");
        assert_eq!(CanonicalForm::Backslash.apply("alice", Some("CORP")), "CORP\\alice");
        assert_eq!(CanonicalForm::Principal.apply("alice", Some("CORP")), "alice@CORP");
        assert_eq!(CanonicalForm::Principal.apply("alice", None), "alice");
    }

    #[test]
    fn test_reconfigure_keeps_old_settings_on_error() {
        let auth = RemoteAuthenticator::new(
            &props(&[(keys::BIND_STR, "http://auth-a/verify")]),
            Duration::from_secs(5),
        )
        .unwrap();

        assert!(auth.reconfigure(&props(&[(keys::BIND_STR, "not a url")])).is_err());
        assert_eq!(auth.settings().bind_url.as_str(), "http://auth-a/verify");

        auth.reconfigure(&props(&[(keys::BIND_STR, "http://auth-b/verify")]))
            .unwrap();
        assert_eq!(auth.settings().bind_url.as_str(), "http://auth-b/verify");
    }

    #[tokio::test]
    async fn test_reject_authenticator_fails_with_response() {
        use axum::http::{HeaderMap, Method, Uri};

        let request = InboundRequest::new(Method::GET, Uri::from_static("/"), HeaderMap::new());
        match RejectAuthenticator.authenticate(&request).await {
            ProviderOutcome::Failed(error) => {
                assert_eq!(error.response.unwrap().status, StatusCode::FORBIDDEN);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
