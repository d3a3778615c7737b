//! Config hot-reload.
//!
//! The running configuration lives in [`LiveConfig`] as one immutable
//! snapshot. [`ConfigWatcher`] re-reads the file on change, validates it,
//! hands the provider properties to the authenticator and only then swaps
//! the snapshot. A snapshot that fails any step is discarded and the previous
//! one keeps serving.
//!
//! # Limitations
//!
//! Listener address changes (`server.host`, `server.port`) and upstream
//! client settings need a restart. They are reported but not applied.
//! A change to the `provider` section would swap the authenticator itself,
//! so such a reload is rejected and the running snapshot kept.
//!
//! # Example
//!
//! ```no_run
//! use std::{path::PathBuf, sync::Arc};
//! use tokio::sync::broadcast;
//! use route_auth_gateway::config::{Config, ServerOverrides};
//! use route_auth_gateway::config_reload::{ConfigWatcher, LiveConfig};
//! use route_auth_gateway::gateway::provider::RejectAuthenticator;
//!
//! # tokio_test::block_on(async {
//! let (shutdown_tx, _) = broadcast::channel(1);
//! let live = Arc::new(LiveConfig::new(Config::default()));
//!
//! let _watcher = ConfigWatcher::start(
//!     PathBuf::from("gateway.yaml"),
//!     ServerOverrides::default(),
//!     live,
//!     Arc::new(RejectAuthenticator),
//!     shutdown_tx.subscribe(),
//! );
//! # });
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{Config, ServerOverrides};
use crate::gateway::auth::Authenticator;
use crate::{Error, Result};

// ============================================================================
// Live snapshot
// ============================================================================

/// Live, atomically-swappable config snapshot shared across the gateway.
///
/// Readers take a read-lock and clone the inner `Arc`; writers swap the whole
/// `Arc` under a write-lock, so no reader ever sees a partial update.
pub struct LiveConfig {
    inner: RwLock<Arc<Config>>,
}

impl LiveConfig {
    /// Create a new `LiveConfig` seeded with the startup configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    /// Clone the current active configuration snapshot.
    #[must_use]
    pub fn get(&self) -> Arc<Config> {
        Arc::clone(&self.inner.read())
    }

    /// Atomically replace the current config.
    pub fn set(&self, config: Config) {
        *self.inner.write() = Arc::new(config);
    }

    /// Run `prepare` on `config`, then publish it.
    ///
    /// The write lock is held across both steps: readers see the old snapshot
    /// until `prepare` has succeeded and the new one right after. Nothing is
    /// published when `prepare` fails.
    pub fn publish_with(
        &self,
        config: Config,
        prepare: impl FnOnce(&Config) -> Result<()>,
    ) -> Result<()> {
        let mut current = self.inner.write();
        prepare(&config)?;
        *current = Arc::new(config);
        Ok(())
    }
}

// ============================================================================
// Diff computation (pure, synchronous)
// ============================================================================

/// What changed between two snapshots
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigPatch {
    /// Property keys added, removed or changed (values are not kept)
    pub properties_changed: Vec<String>,
    /// Bypass switch flipped
    pub bypass_changed: bool,
    /// Fallback or unresolved identity changed
    pub identity_changed: bool,
    /// Session settings changed
    pub session_changed: bool,
    /// Provider kind or bound service changed (restart required)
    pub provider_changed: bool,
    /// Listener address changed (restart required)
    pub server_changed: bool,
    /// Upstream client settings changed (restart required)
    pub upstream_changed: bool,
}

impl ConfigPatch {
    /// Returns `true` when no changes were detected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Human-readable summary of the patch
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.properties_changed.is_empty() {
            parts.push(format!(
                "properties changed: [{}]",
                self.properties_changed.join(", ")
            ));
        }
        if self.bypass_changed {
            parts.push("bypass switch toggled".to_string());
        }
        if self.identity_changed {
            parts.push("identity settings changed".to_string());
        }
        if self.session_changed {
            parts.push("session settings changed".to_string());
        }
        if self.provider_changed {
            parts.push("provider section changed (restart required)".to_string());
        }
        if self.server_changed {
            parts.push("server address changed (restart required)".to_string());
        }
        if self.upstream_changed {
            parts.push("upstream settings changed (restart required)".to_string());
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Compute the diff between two config snapshots.
///
/// # Examples
///
/// ```
/// use route_auth_gateway::config::Config;
/// use route_auth_gateway::config_reload::compute_diff;
///
/// let patch = compute_diff(&Config::default(), &Config::default());
/// assert!(patch.is_empty());
/// ```
#[must_use]
pub fn compute_diff(old: &Config, new: &Config) -> ConfigPatch {
    let mut properties_changed: Vec<String> = old
        .properties
        .iter()
        .filter(|(k, v)| new.properties.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    properties_changed.extend(
        new.properties
            .keys()
            .filter(|k| !old.properties.contains_key(*k))
            .cloned(),
    );
    properties_changed.sort();

    ConfigPatch {
        properties_changed,
        bypass_changed: old.bypass_enabled() != new.bypass_enabled(),
        identity_changed: serde_json::to_string(&old.identity).ok()
            != serde_json::to_string(&new.identity).ok(),
        session_changed: serde_json::to_string(&old.session).ok()
            != serde_json::to_string(&new.session).ok(),
        provider_changed: old.provider != new.provider,
        server_changed: old.server.host != new.server.host || old.server.port != new.server.port,
        upstream_changed: serde_json::to_string(&old.upstream).ok()
            != serde_json::to_string(&new.upstream).ok(),
    }
}

// ============================================================================
// Applying a snapshot
// ============================================================================

/// Validate `new`, push its properties to the authenticator, then publish it.
///
/// Nothing is published when any step fails. The running authenticator was
/// built for the current `provider` section, so a snapshot that changes it is
/// refused with [`Error::Config`].
pub fn apply_snapshot(
    live_config: &LiveConfig,
    authenticator: &dyn Authenticator,
    new: Config,
) -> Result<ConfigPatch> {
    new.validate()?;

    let old = live_config.get();
    let patch = compute_diff(&old, &new);
    if patch.is_empty() {
        return Ok(patch);
    }

    if patch.provider_changed {
        return Err(Error::Config(format!(
            "provider section changed ({:?} -> {:?}), restart required to apply it",
            old.provider.kind, new.provider.kind
        )));
    }
    if patch.server_changed || patch.upstream_changed {
        warn!("Config reload: server/upstream settings changed, restart required to apply them");
    }
    let properties_changed = !patch.properties_changed.is_empty();
    let bypass_now = new.bypass_enabled();
    live_config.publish_with(new, |new| {
        if properties_changed {
            authenticator.reconfigure(&new.properties)?;
        }
        Ok(())
    })?;

    if patch.bypass_changed {
        if bypass_now {
            warn!("Config reload: authentication bypass ENABLED");
        } else {
            info!("Config reload: authentication bypass disabled");
        }
    }
    Ok(patch)
}

/// Parse the config file and apply it, keeping the current snapshot on error.
///
/// `overrides` are the command-line listener settings, applied on top of the
/// file exactly as at startup.
pub fn reload_once(
    config_path: &Path,
    overrides: &ServerOverrides,
    live_config: &LiveConfig,
    authenticator: &dyn Authenticator,
) -> Result<ConfigPatch> {
    let mut new_config = Config::load(Some(config_path))?;
    overrides.apply(&mut new_config);
    let patch = apply_snapshot(live_config, authenticator, new_config)?;
    if patch.is_empty() {
        tracing::debug!("Config reload: no changes detected");
    } else {
        info!(changes = %patch.summary(), "Config reload: complete");
    }
    Ok(patch)
}

// ============================================================================
// File watcher
// ============================================================================

/// File watcher that triggers config hot-reload on changes to the config file.
///
/// Holds the underlying `notify` watcher alive for the lifetime of the struct.
pub struct ConfigWatcher {
    /// Kept alive to prevent the OS watcher from being dropped.
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConfigWatcher {
    /// Start watching `config_path` for changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `notify` watcher cannot be created.
    pub fn start(
        config_path: PathBuf,
        overrides: ServerOverrides,
        live_config: Arc<LiveConfig>,
        authenticator: Arc<dyn Authenticator>,
        shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<Self> {
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(32);

        let watcher = Self::create_notify_watcher(event_tx, &config_path)?;

        Self::spawn_reload_task(
            config_path,
            overrides,
            live_config,
            authenticator,
            event_rx,
            shutdown_rx,
        );

        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Create the low-level `notify` watcher.
    fn create_notify_watcher(
        event_tx: tokio::sync::mpsc::Sender<()>,
        config_path: &Path,
    ) -> Result<RecommendedWatcher> {
        let watch_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let file_name = config_path.file_name().map(std::ffi::OsStr::to_owned);

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let is_relevant = result
                    .as_ref()
                    .is_ok_and(|e| is_config_event(e, file_name.as_deref()));
                if is_relevant {
                    let _ = event_tx.try_send(());
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Internal(format!("Failed to create config watcher: {e}")))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Internal(format!("Failed to watch config path: {e}")))?;

        Ok(watcher)
    }

    /// Spawn the debounced reload task.
    fn spawn_reload_task(
        config_path: PathBuf,
        overrides: ServerOverrides,
        live_config: Arc<LiveConfig>,
        authenticator: Arc<dyn Authenticator>,
        mut event_rx: tokio::sync::mpsc::Receiver<()>,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            const DEBOUNCE: Duration = Duration::from_millis(500);
            let mut last_event: Option<Instant> = None;
            let mut pending = false;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));

            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        last_event = Some(Instant::now());
                        pending = true;
                    }
                    _ = ticker.tick() => {
                        if pending && last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                            pending = false;
                            last_event = None;
                            if let Err(e) = reload_once(&config_path, &overrides, &live_config, authenticator.as_ref()) {
                                warn!(error = %e, "Config reload: rejected, keeping current config");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Config watcher shutting down");
                        break;
                    }
                }
            }
        });
    }
}

/// Returns `true` for create/modify events on the watched config file.
fn is_config_event(event: &Event, file_name: Option<&std::ffi::OsStr>) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some() && p.file_name() == file_name)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{ProviderKind, keys};
    use crate::gateway::auth::ProviderOutcome;
    use crate::gateway::identity::IdentityContext;
    use crate::gateway::request::InboundRequest;

    struct Recording {
        reconfigured: Mutex<Vec<BTreeMap<String, String>>>,
        fail: bool,
    }

    impl Recording {
        fn new(fail: bool) -> Self {
            Self {
                reconfigured: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl Authenticator for Recording {
        async fn authenticate(&self, _request: &InboundRequest) -> ProviderOutcome {
            unreachable!("not used by reload tests")
        }

        fn reconfigure(&self, properties: &BTreeMap<String, String>) -> Result<()> {
            if self.fail {
                return Err(Error::Config("provider refused properties".to_string()));
            }
            self.reconfigured.lock().push(properties.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn base() -> Config {
        let mut config = Config::default();
        config
            .properties
            .insert(keys::BIND_STR.to_string(), "http://auth/verify".to_string());
        config
    }

    #[test]
    fn diff_identical_configs_returns_empty_patch() {
        let patch = compute_diff(&base(), &base());
        assert!(patch.is_empty(), "expected empty patch, got: {}", patch.summary());
        assert_eq!(patch.summary(), "no changes");
    }

    #[test]
    fn diff_lists_changed_property_keys() {
        let old = base();
        let mut new = base();
        new.properties
            .insert(keys::BIND_STR.to_string(), "http://auth2/verify".to_string());
        new.properties
            .insert(keys::DNS_SITE.to_string(), "HQ".to_string());

        let patch = compute_diff(&old, &new);
        assert_eq!(
            patch.properties_changed,
            vec![keys::BIND_STR.to_string(), keys::DNS_SITE.to_string()]
        );
        assert!(!patch.bypass_changed);
    }

    #[test]
    fn diff_detects_bypass_toggle_and_server_change() {
        let old = base();
        let mut new = base();
        new.properties.insert(keys::BYPASS.to_string(), "1".to_string());
        new.server.port = 9090;

        let patch = compute_diff(&old, &new);
        assert!(patch.bypass_changed);
        assert!(patch.server_changed);
        let s = patch.summary();
        assert!(s.contains("bypass"), "missing bypass: {s}");
        assert!(s.contains("restart required"), "missing server: {s}");
    }

    #[test]
    fn live_config_set_updates_snapshot() {
        let live = LiveConfig::new(Config::default());
        let held = live.get();
        let mut new_cfg = Config::default();
        new_cfg.server.port = 12345;
        live.set(new_cfg);
        assert_eq!(live.get().server.port, 12345);
        // Earlier readers keep their whole snapshot
        assert_eq!(held.server.port, 8080);
    }

    #[test]
    fn apply_snapshot_reconfigures_then_publishes() {
        let live = LiveConfig::new(base());
        let auth = Recording::new(false);
        let mut new = base();
        new.properties
            .insert(keys::DNS_SITE.to_string(), "HQ".to_string());

        let patch = apply_snapshot(&live, &auth, new).unwrap();
        assert_eq!(patch.properties_changed, vec![keys::DNS_SITE.to_string()]);
        assert_eq!(live.get().property(keys::DNS_SITE), Some("HQ"));
        assert_eq!(auth.reconfigured.lock().len(), 1);
    }

    #[test]
    fn invalid_snapshot_keeps_previous() {
        let live = LiveConfig::new(base());
        let auth = Recording::new(false);

        // Bypass without a fallback identity is not servable
        let mut invalid = base();
        invalid
            .properties
            .insert(keys::BYPASS.to_string(), "true".to_string());
        assert!(apply_snapshot(&live, &auth, invalid).is_err());
        assert!(!live.get().bypass_enabled());
        assert!(auth.reconfigured.lock().is_empty());

        let mut valid = base();
        valid
            .properties
            .insert(keys::BYPASS.to_string(), "true".to_string());
        valid.identity.fallback = Some(IdentityContext::new("svc", "LAB"));
        apply_snapshot(&live, &auth, valid).unwrap();
        assert!(live.get().bypass_enabled());
    }

    #[test]
    fn provider_refusal_keeps_previous() {
        let live = LiveConfig::new(base());
        let auth = Recording::new(true);
        let mut new = base();
        new.properties
            .insert(keys::DNS_SITE.to_string(), "HQ".to_string());

        assert!(apply_snapshot(&live, &auth, new).is_err());
        assert_eq!(live.get().property(keys::DNS_SITE), None);
    }

    #[test]
    fn reload_once_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(
            &path,
            "properties:\n  provider.bindstr: http://auth/verify\n  provider.dns.site: EU\n",
        )
        .unwrap();

        let live = LiveConfig::new(base());
        let auth = Recording::new(false);
        let patch = reload_once(&path, &ServerOverrides::default(), &live, &auth).unwrap();
        assert_eq!(patch.properties_changed, vec![keys::DNS_SITE.to_string()]);
        assert_eq!(live.get().property(keys::DNS_SITE), Some("EU"));

        std::fs::write(&path, "server: [not, a, map]\n").unwrap();
        assert!(reload_once(&path, &ServerOverrides::default(), &live, &auth).is_err());
        assert_eq!(live.get().property(keys::DNS_SITE), Some("EU"));
    }

    #[test]
    fn provider_kind_change_is_refused() {
        let live = LiveConfig::new(base());
        let auth = Recording::new(false);
        let mut new = base();
        new.provider.kind = ProviderKind::Reject;

        let patch = compute_diff(&live.get(), &new);
        assert!(patch.provider_changed);
        assert!(patch.summary().contains("provider section changed"));

        let err = apply_snapshot(&live, &auth, new).unwrap_err();
        assert!(err.to_string().contains("restart required"), "got {err}");
        assert_eq!(live.get().provider.kind, ProviderKind::Remote);
    }

    #[test]
    fn provider_change_with_property_edits_never_reconfigures() {
        let live = LiveConfig::new(base());
        let auth = Recording::new(false);
        let mut new = Config::default();
        new.provider.kind = ProviderKind::Reject;
        new.provider.vcap_service = Some("auth-service".to_string());

        assert!(apply_snapshot(&live, &auth, new).is_err());
        assert!(auth.reconfigured.lock().is_empty());
        assert_eq!(live.get().property(keys::BIND_STR), Some("http://auth/verify"));
    }

    struct LockObserver {
        live: Arc<LiveConfig>,
        readable_during_reconfigure: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl Authenticator for LockObserver {
        async fn authenticate(&self, _request: &InboundRequest) -> ProviderOutcome {
            unreachable!("not used by reload tests")
        }

        fn reconfigure(&self, _properties: &BTreeMap<String, String>) -> Result<()> {
            *self.readable_during_reconfigure.lock() = Some(self.live.inner.try_read().is_some());
            Ok(())
        }

        fn name(&self) -> &str {
            "lock-observer"
        }
    }

    #[test]
    fn readers_wait_while_provider_is_reconfigured() {
        let live = Arc::new(LiveConfig::new(base()));
        let auth = LockObserver {
            live: Arc::clone(&live),
            readable_during_reconfigure: Mutex::new(None),
        };
        let mut new = base();
        new.properties
            .insert(keys::DNS_SITE.to_string(), "HQ".to_string());

        apply_snapshot(&live, &auth, new).unwrap();

        assert_eq!(*auth.readable_during_reconfigure.lock(), Some(false));
        assert_eq!(live.get().property(keys::DNS_SITE), Some("HQ"));
    }

    #[test]
    fn publish_with_failure_keeps_previous() {
        let live = LiveConfig::new(base());
        let mut new = base();
        new.server.port = 9999;

        let result = live.publish_with(new, |_| Err(Error::Config("refused".to_string())));

        assert!(result.is_err());
        assert_eq!(live.get().server.port, 8080);
    }

    #[test]
    fn reload_keeps_command_line_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 8080\nproperties:\n  provider.bindstr: http://auth/verify\n  provider.dns.site: EU\n",
        )
        .unwrap();

        let overrides = ServerOverrides {
            host: Some("127.0.0.1".to_string()),
            port: Some(9000),
        };
        let mut startup = base();
        overrides.apply(&mut startup);
        let live = LiveConfig::new(startup);
        let auth = Recording::new(false);

        let patch = reload_once(&path, &overrides, &live, &auth).unwrap();

        assert!(!patch.server_changed, "got: {}", patch.summary());
        assert_eq!(live.get().server.port, 9000);
        assert_eq!(live.get().server.host, "127.0.0.1");
        assert_eq!(live.get().property(keys::DNS_SITE), Some("EU"));
    }
}
