//! Route-Auth Gateway Library
//!
//! Authenticating route-service gateway. Requests arrive from an outer routing
//! layer carrying `X-CF-Forwarded-Url`, `X-CF-Proxy-Metadata` and
//! `X-CF-Proxy-Signature`. The gateway authenticates the caller, asserts
//! `X-Remote-User` / `X-Remote-Domain`, strips the routing headers and forwards
//! the request to the named destination, relaying the response unchanged.
//!
//! # Features
//!
//! - **Pluggable authentication**: any [`gateway::Authenticator`], with a
//!   forward-verification provider built in
//! - **Trusted identity**: client-supplied identity headers never reach the backend
//! - **Bypass switch**: operator-controlled, read from the live configuration
//! - **Hot reload**: validated snapshots swapped atomically

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod config_reload;
pub mod error;
pub mod gateway;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` wins over `level`. `extra_directives` (e.g. the provider log
/// level) are added on top of either.
pub fn setup_tracing(level: &str, format: Option<&str>, extra_directives: &[String]) -> Result<()> {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    for directive in extra_directives {
        let parsed = directive
            .parse()
            .map_err(|e| Error::Config(format!("Invalid log directive '{directive}': {e}")))?;
        filter = filter.add_directive(parsed);
    }

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
