//! Gateway-asserted identity and the request view that carries it
//!
//! Downstream of the authentication gate the gateway is the only source of
//! the user and domain headers. [`IdentityOverlay`] enforces that on lookup:
//! whatever the client sent under those names is shadowed by the resolved
//! [`IdentityContext`].

use axum::http::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use super::request::InboundRequest;
use crate::{Error, Result};

/// Header carrying the asserted user on the outbound request
pub const USER_HEADER: &str = "x-remote-user";
/// Header carrying the asserted domain on the outbound request
pub const DOMAIN_HEADER: &str = "x-remote-domain";

/// The (user, domain) pair the gateway asserts for a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityContext {
    /// Asserted user
    pub user: String,
    /// Asserted domain
    pub domain: String,
}

impl IdentityContext {
    /// Create an identity
    pub fn new(user: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            domain: domain.into(),
        }
    }

    /// Check both values are usable as header values
    pub fn validate(&self) -> Result<()> {
        if self.user.is_empty() || self.domain.is_empty() {
            return Err(Error::Config(
                "identity user and domain must not be empty".to_string(),
            ));
        }
        self.header_values().map(|_| ())
    }

    /// Values for the user and domain headers
    pub fn header_values(&self) -> Result<(HeaderValue, HeaderValue)> {
        let user = HeaderValue::from_str(&self.user)
            .map_err(|_| Error::InvalidIdentity(format!("user '{}'", self.user)))?;
        let domain = HeaderValue::from_str(&self.domain)
            .map_err(|_| Error::InvalidIdentity(format!("domain '{}'", self.domain)))?;
        Ok((user, domain))
    }
}

/// Which identity header a name refers to, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentityHeader {
    User,
    Domain,
}

fn identity_header(name: &str) -> Option<IdentityHeader> {
    if name.eq_ignore_ascii_case(USER_HEADER) {
        Some(IdentityHeader::User)
    } else if name.eq_ignore_ascii_case(DOMAIN_HEADER) {
        Some(IdentityHeader::Domain)
    } else {
        None
    }
}

/// Read-only view of an inbound request wearing a resolved identity
#[derive(Debug, Clone, Copy)]
pub struct IdentityOverlay<'a> {
    request: &'a InboundRequest,
    identity: &'a IdentityContext,
}

impl<'a> IdentityOverlay<'a> {
    /// Wrap `request` with `identity`
    #[must_use]
    pub fn new(request: &'a InboundRequest, identity: &'a IdentityContext) -> Self {
        Self { request, identity }
    }

    /// The underlying request
    #[must_use]
    pub fn request(&self) -> &'a InboundRequest {
        self.request
    }

    /// The asserted identity
    #[must_use]
    pub fn identity(&self) -> &'a IdentityContext {
        self.identity
    }

    /// Single-value header lookup.
    ///
    /// Identity names always answer with the context. Other names answer with
    /// the underlying header, falling back to a same-named query parameter.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&'a str> {
        match identity_header(name) {
            Some(IdentityHeader::User) => Some(self.identity.user.as_str()),
            Some(IdentityHeader::Domain) => Some(self.identity.domain.as_str()),
            None => self
                .request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .or_else(|| self.request.parameter(name)),
        }
    }

    /// All values of a header. Parameters are not merged here.
    pub fn header_values(&self, name: &str) -> Result<Vec<HeaderValue>> {
        match identity_header(name) {
            Some(which) => {
                let (user, domain) = self.identity.header_values()?;
                Ok(vec![match which {
                    IdentityHeader::User => user,
                    IdentityHeader::Domain => domain,
                }])
            }
            None => Ok(self
                .request
                .headers
                .get_all(name)
                .iter()
                .cloned()
                .collect()),
        }
    }

    /// Header names, then parameter names, then both identity names.
    /// Duplicates are kept.
    #[must_use]
    pub fn header_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .request
            .headers
            .keys()
            .map(HeaderName::to_string)
            .collect();
        names.extend(self.request.parameter_names().map(str::to_string));
        names.push(USER_HEADER.to_string());
        names.push(DOMAIN_HEADER.to_string());
        names
    }

    /// Query parameter lookup on the underlying request
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&'a str> {
        self.request.parameter(name)
    }
}
