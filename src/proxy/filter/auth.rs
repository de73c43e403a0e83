use super::FilterResult;
use crate::auth::{Authenticator, Claims};
use crate::config::AuthConfig;
use crate::error::{AuthError, GatewayError};
use crate::proxy::context::{problem_for, RequestContext};
use crate::routing::pattern;
use globset::GlobSet;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::sync::Arc;

static X_AUTH_ERROR: HeaderName = HeaderName::from_static("x-auth-error");

/// Bearer-token authentication. The gateway is the trust boundary: identity
/// headers arriving from the client are always removed, and set again only
/// from verified claims.
pub struct AuthFilter {
    authenticator: Arc<Authenticator>,
    ignore: GlobSet,
    user_id_header: HeaderName,
    username_header: HeaderName,
    roles_header: HeaderName,
    tenant_header: HeaderName,
}

impl AuthFilter {
    pub fn new(cfg: &AuthConfig, authenticator: Arc<Authenticator>) -> anyhow::Result<Self> {
        let header = |name: &str| {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| anyhow::anyhow!("invalid identity header name '{}': {}", name, e))
        };
        Ok(Self {
            authenticator,
            ignore: pattern::compile_set(&cfg.ignore_paths)?,
            user_id_header: header(&cfg.user_id_header)?,
            username_header: header(&cfg.username_header)?,
            roles_header: header(&cfg.roles_header)?,
            tenant_header: header(&cfg.tenant_header)?,
        })
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    pub(super) async fn on_request(&self, ctx: &mut RequestContext) -> FilterResult {
        for name in self.identity_headers() {
            ctx.headers.remove(name);
        }

        if self.ignore.is_match(&ctx.uri_path) {
            return FilterResult::Continue;
        }

        let result = match bearer_token(&ctx.headers) {
            Some(token) => self.authenticator.authenticate(token).await,
            None => Err(AuthError::Missing),
        };

        match result {
            Ok(claims) => {
                self.inject_identity(&mut ctx.headers, &claims);
                ctx.claims = Some(claims);
                FilterResult::Continue
            }
            Err(e) => {
                tracing::debug!(
                    "filter: auth: rejected, path={}, code={}, reason={}",
                    ctx.uri_path,
                    e.code(),
                    e
                );
                ctx.finalize_metrics(StatusCode::UNAUTHORIZED.as_u16());
                FilterResult::Reject(unauthorized(&e))
            }
        }
    }

    fn identity_headers(&self) -> [&HeaderName; 4] {
        [
            &self.user_id_header,
            &self.username_header,
            &self.roles_header,
            &self.tenant_header,
        ]
    }

    fn inject_identity(&self, headers: &mut HeaderMap, claims: &Claims) {
        let roles = claims.joined_roles();
        let values = [
            (&self.user_id_header, Some(claims.subject.as_str())),
            (&self.username_header, claims.username.as_deref()),
            (&self.roles_header, Some(roles.as_str()).filter(|r| !r.is_empty())),
            (&self.tenant_header, claims.tenant_id.as_deref()),
        ];
        for (name, value) in values {
            let Some(value) = value else { continue };
            match HeaderValue::from_str(value) {
                Ok(v) => {
                    headers.insert(name.clone(), v);
                }
                Err(_) => {
                    tracing::debug!("filter: auth: claim not representable as header, header={}", name);
                }
            }
        }
    }
}

/// Token from `Authorization: Bearer <token>`; the scheme is matched
/// case-insensitively.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

fn unauthorized(err: &AuthError) -> hyper::Response<crate::proxy::BoxBody> {
    let mut resp = problem_for(&GatewayError::Auth(err.clone()));
    let challenge = match err {
        AuthError::Missing => HeaderValue::from_static("Bearer"),
        _ => HeaderValue::from_str(&format!(
            "Bearer error=\"invalid_token\", error_description=\"{}\"",
            err.code()
        ))
        .unwrap_or_else(|_| HeaderValue::from_static("Bearer")),
    };
    let headers = resp.headers_mut();
    headers.insert(WWW_AUTHENTICATE, challenge);
    headers.insert(X_AUTH_ERROR.clone(), HeaderValue::from_static(err.code()));
    resp
}
