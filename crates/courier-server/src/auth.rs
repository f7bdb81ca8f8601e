//! Upgrade-request authorization.
//!
//! An [`Authorizer`] inspects the HTTP upgrade request and yields the
//! [`Principal`] the socket belongs to. A rejected request is answered with
//! 401 and the error text as body.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, Uri};
use courier_core::UserId;

/// Authenticated owner of a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    /// User id the connection is registered under.
    pub id: UserId,
}

impl Principal {
    /// Principal for `id`.
    pub fn new(id: impl Into<UserId>) -> Self {
        Self { id: id.into() }
    }
}

/// Authorization failure.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The request is not allowed to connect.
    #[error("{0}")]
    Unauthorized(String),
}

/// Decides who an upgrade request belongs to.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    /// Authorize the request described by `headers` and `uri`.
    async fn authorize(&self, headers: &HeaderMap, uri: &Uri) -> Result<Principal, AuthError>;
}

/// Accepts every request as the same user.
#[derive(Clone, Debug)]
pub struct StaticAuthorizer {
    principal: Principal,
}

impl StaticAuthorizer {
    /// Authorize everyone as `id`.
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            principal: Principal::new(id),
        }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, _headers: &HeaderMap, _uri: &Uri) -> Result<Principal, AuthError> {
        Ok(self.principal.clone())
    }
}

/// Rejects every request.
#[derive(Clone, Copy, Debug, Default)]
pub struct DenyAllAuthorizer;

#[async_trait]
impl Authorizer for DenyAllAuthorizer {
    async fn authorize(&self, _headers: &HeaderMap, _uri: &Uri) -> Result<Principal, AuthError> {
        Err(AuthError::Unauthorized("unimplemented yet".into()))
    }
}

/// Takes the user id from a request header, falling back to a query
/// parameter for browser clients that cannot set upgrade headers.
#[derive(Clone, Debug)]
pub struct HeaderAuthorizer {
    header: HeaderName,
    query_param: String,
}

impl HeaderAuthorizer {
    /// Default header name.
    pub const DEFAULT_HEADER: &'static str = "x-user-id";
    /// Default query parameter name.
    pub const DEFAULT_QUERY_PARAM: &'static str = "user_id";

    /// Read the id from `header`, or the `query_param` query parameter.
    pub fn new(header: HeaderName, query_param: impl Into<String>) -> Self {
        Self {
            header,
            query_param: query_param.into(),
        }
    }

    fn from_query(&self, uri: &Uri) -> Option<String> {
        uri.query()?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == self.query_param)
            .map(|(_, value)| value.to_string())
    }
}

impl Default for HeaderAuthorizer {
    fn default() -> Self {
        Self::new(
            HeaderName::from_static(Self::DEFAULT_HEADER),
            Self::DEFAULT_QUERY_PARAM,
        )
    }
}

#[async_trait]
impl Authorizer for HeaderAuthorizer {
    async fn authorize(&self, headers: &HeaderMap, uri: &Uri) -> Result<Principal, AuthError> {
        let from_header = headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .map(str::to_string);

        from_header
            .or_else(|| self.from_query(uri))
            .filter(|id| !id.is_empty())
            .map(Principal::new)
            .ok_or_else(|| AuthError::Unauthorized(format!("missing {} header", self.header)))
    }
}
