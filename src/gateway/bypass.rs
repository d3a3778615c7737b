//! Operator switch that skips authentication
//!
//! The switch is read from the live property map, never from the request, so a
//! client cannot turn it on.

use super::identity::IdentityContext;
use crate::config::{Config, keys};

/// Whether `config` turns authentication off.
///
/// `true`/`yes` in any letter case and `1` enable bypass. Anything else,
/// including absence, leaves authentication on.
#[must_use]
pub fn should_bypass(config: &Config) -> bool {
    config.property(keys::BYPASS).is_some_and(is_enabled_value)
}

fn is_enabled_value(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1" || value.eq_ignore_ascii_case("yes")
}

/// Identity to assert for a bypassed request.
///
/// `None` only for snapshots that failed validation.
#[must_use]
pub fn fallback_identity(config: &Config) -> Option<&IdentityContext> {
    config.identity.fallback.as_ref()
}
