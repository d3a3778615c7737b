//! Configuration management

use std::{
    collections::BTreeMap,
    env,
    net::IpAddr,
    path::Path,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::identity::IdentityContext;
use crate::gateway::provider::ProviderSettings;
use crate::{Error, Result};

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "ROUTE_AUTH_GATEWAY_";

/// Recognized keys of the flat provider property map.
///
/// Keys not listed here are kept in the snapshot untouched.
pub mod keys {
    /// Boolean-like switch that skips authentication entirely
    pub const BYPASS: &str = "gateway.disabled";
    /// Verification endpoint of the authentication provider
    pub const BIND_STR: &str = "provider.bindstr";
    /// Service account presented to the provider
    pub const SERVICE_ACCOUNT: &str = "provider.service.acctname";
    /// Service account password (supports `env:VAR_NAME`)
    pub const SERVICE_PASSWORD: &str = "provider.service.password";
    /// How the provider reports user names (`username`, `backslash`, `principal`)
    pub const CANONICAL_FORM: &str = "provider.account.canonicalForm";
    /// Comma separated directory server addresses
    pub const DNS_SERVERS: &str = "provider.dns.servers";
    /// Directory site hint
    pub const DNS_SITE: &str = "provider.dns.site";
    /// Provider log verbosity, 0 (quiet) to 4 (everything)
    pub const LOG_LEVEL: &str = "provider.log.level";
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Destination transport configuration
    pub upstream: UpstreamConfig,
    /// Authentication provider selection
    pub provider: ProviderConfig,
    /// Flat key/value properties handed to the authentication provider
    pub properties: BTreeMap<String, String>,
    /// Identities asserted when no authenticated identity is available
    pub identity: IdentityConfig,
    /// Server-side session storage
    pub session: SessionConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum buffered request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Destination transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Timeout for a whole destination exchange
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Idle pooled connections are closed after this long
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Which authenticator the gateway runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Forward verification to the endpoint named by `provider.bindstr`
    #[default]
    Remote,
    /// Refuse every request (useful when only bypass mode is intended)
    Reject,
}

/// Authentication provider configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider implementation
    pub kind: ProviderKind,
    /// Name of a bound service in `VCAP_SERVICES` whose credentials are
    /// merged into `properties`
    pub vcap_service: Option<String>,
}

/// Listener settings given on the command line.
///
/// They outrank the file, so they are re-applied to every snapshot read from
/// disk, including hot reloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerOverrides {
    /// Replaces `server.host`
    pub host: Option<String>,
    /// Replaces `server.port`
    pub port: Option<u16>,
}

impl ServerOverrides {
    /// Write the overrides into `config`
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Identity asserted while bypass is on (required in that mode)
    pub fallback: Option<IdentityContext>,
    /// Identity asserted when the provider authenticates a caller but
    /// reports no directory domain
    pub unresolved: IdentityContext,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            fallback: None,
            unresolved: IdentityContext::new("unknown", "unknown"),
        }
    }
}

/// Session storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the cookie carrying the session id
    pub cookie_name: String,
    /// Sessions untouched for this long are discarded
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "GATEWAY_SESSION".to_string(),
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl Config {
    /// Load configuration from file and environment, then validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or describes an unusable snapshot.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();

        // Platform-assigned port wins over the file
        if let Some(port) = env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            config.server.port = port;
        }

        if let Some(service) = config.provider.vcap_service.clone() {
            if let Ok(vcap) = env::var("VCAP_SERVICES") {
                config.merge_vcap(&vcap, &service)?;
            } else {
                tracing::warn!(service = %service, "VCAP_SERVICES not set, no credentials merged");
            }
        }

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Merge credentials of a bound service. Explicit properties win.
    pub fn merge_vcap(&mut self, vcap_json: &str, service: &str) -> Result<()> {
        for (key, value) in vcap_properties(vcap_json, service)? {
            self.properties.entry(key).or_insert(value);
        }
        Ok(())
    }

    /// Check that the snapshot can be served as a whole.
    pub fn validate(&self) -> Result<()> {
        self.server
            .host
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("Invalid host '{}': {e}", self.server.host)))?;

        if self.bypass_enabled() {
            let fallback = self.identity.fallback.as_ref().ok_or_else(|| {
                Error::Config(format!(
                    "{} is on but identity.fallback is not configured",
                    keys::BYPASS
                ))
            })?;
            fallback.validate()?;
        }
        self.identity.unresolved.validate()?;

        if self.provider.kind == ProviderKind::Remote {
            ProviderSettings::from_properties(&self.properties)?;
        }

        if self.session.cookie_name.is_empty()
            || !self
                .session
                .cookie_name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(Error::Config(format!(
                "Invalid session cookie name '{}'",
                self.session.cookie_name
            )));
        }

        Ok(())
    }

    /// Look up a provider property
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Whether the bypass switch is on in this snapshot
    #[must_use]
    pub fn bypass_enabled(&self) -> bool {
        crate::gateway::bypass::should_bypass(self)
    }

    /// Copy of the configuration with secrets masked, for display
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(password) = copy.properties.get_mut(keys::SERVICE_PASSWORD) {
            if !password.starts_with("env:") {
                *password = "********".to_string();
            }
        }
        copy
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in property values
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for value in self.properties.values_mut() {
            *value = expand_string(&re, value);
        }
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Resolve a secret value (`env:VAR_NAME` reads the environment)
#[must_use]
pub fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

/// Extract the credentials of `service` from a `VCAP_SERVICES` document as
/// flat, dot-joined properties.
///
/// # Errors
///
/// Returns an error if the document is not JSON or the service is not bound.
pub fn vcap_properties(vcap_json: &str, service: &str) -> Result<BTreeMap<String, String>> {
    let root: Value = serde_json::from_str(vcap_json)
        .map_err(|e| Error::Config(format!("VCAP_SERVICES is not valid JSON: {e}")))?;

    let credentials = root
        .as_object()
        .into_iter()
        .flat_map(|offerings| offerings.values())
        .filter_map(Value::as_array)
        .flatten()
        .find(|instance| instance.get("name").and_then(Value::as_str) == Some(service))
        .and_then(|instance| instance.get("credentials"))
        .ok_or_else(|| Error::Config(format!("Service '{service}' not found in VCAP_SERVICES")))?;

    let mut out = BTreeMap::new();
    flatten_into(&mut out, None, credentials);
    Ok(out)
}

fn flatten_into(out: &mut BTreeMap<String, String>, prefix: Option<&str>, value: &Value) {
    let key = || prefix.unwrap_or_default().to_string();
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let nested = match prefix {
                    Some(p) => format!("{p}.{k}"),
                    None => k.clone(),
                };
                flatten_into(out, Some(&nested), v);
            }
        }
        Value::Array(items) => {
            let joined = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(",");
            out.insert(key(), joined);
        }
        Value::String(s) => {
            out.insert(key(), s.clone());
        }
        Value::Null => {}
        other => {
            out.insert(key(), other.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_config() -> Config {
        let mut config = Config::default();
        config
            .properties
            .insert(keys::BIND_STR.to_string(), "http://auth.internal/verify".to_string());
        config
    }

    #[test]
    fn test_server_overrides_replace_listener_only() {
        let mut config = remote_config();
        ServerOverrides {
            host: Some("127.0.0.1".to_string()),
            port: None,
        }
        .apply(&mut config);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);

        ServerOverrides::default().apply(&mut config);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.provider.kind, ProviderKind::Remote);
        assert_eq!(config.session.cookie_name, "GATEWAY_SESSION");
        assert_eq!(config.identity.unresolved.user, "unknown");
        assert!(config.identity.fallback.is_none());
    }

    #[test]
    fn test_remote_provider_requires_bind_string() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains(keys::BIND_STR), "got: {err}");
        assert!(remote_config().validate().is_ok());
    }

    #[test]
    fn test_bypass_requires_fallback_identity() {
        let mut config = remote_config();
        config
            .properties
            .insert(keys::BYPASS.to_string(), "yes".to_string());
        assert!(config.validate().is_err());

        config.identity.fallback = Some(IdentityContext::new("svc-user", "CORP"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_host_rejected() {
        let mut config = remote_config();
        config.server.host = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_masks_password() {
        let mut config = remote_config();
        config
            .properties
            .insert(keys::SERVICE_PASSWORD.to_string(), "hunter2".to_string());
        let shown = config.redacted();
        assert_eq!(shown.property(keys::SERVICE_PASSWORD), Some("********"));
        assert_eq!(config.property(keys::SERVICE_PASSWORD), Some("hunter2"));
    }

    #[test]
    fn test_vcap_properties_flatten_credentials() {
        let vcap = r#"{
            "user-provided": [
                {"name": "other", "credentials": {"x": "y"}},
                {"name": "auth-service", "credentials": {
                    "provider": {"bindstr": "http://auth/verify", "dns": {"servers": ["10.0.0.1", "10.0.0.2"]}},
                    "provider.log.level": 3,
                    "unused": null
                }}
            ]
        }"#;

        let props = vcap_properties(vcap, "auth-service").unwrap();
        assert_eq!(props.get("provider.bindstr").unwrap(), "http://auth/verify");
        assert_eq!(props.get("provider.dns.servers").unwrap(), "10.0.0.1,10.0.0.2");
        assert_eq!(props.get("provider.log.level").unwrap(), "3");
        assert!(!props.contains_key("unused"));
        assert!(!props.contains_key("x"));
    }

    #[test]
    fn test_vcap_missing_service_is_config_error() {
        let err = vcap_properties(r#"{"user-provided": []}"#, "auth-service").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(vcap_properties("not json", "auth-service").is_err());
    }

    #[test]
    fn test_merge_vcap_keeps_explicit_properties() {
        let mut config = remote_config();
        let vcap = r#"{"p": [{"name": "svc", "credentials": {"provider.bindstr": "http://other", "provider.dns.site": "hq"}}]}"#;
        config.merge_vcap(vcap, "svc").unwrap();
        assert_eq!(config.property(keys::BIND_STR), Some("http://auth.internal/verify"));
        assert_eq!(config.property(keys::DNS_SITE), Some("hq"));
    }

    #[test]
    fn test_expand_string_with_default() {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        assert_eq!(
            expand_string(&re, "http://${ROUTE_AUTH_TEST_SURELY_UNSET:-auth.local}/verify"),
            "http://auth.local/verify"
        );
    }
}
