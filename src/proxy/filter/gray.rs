use super::FilterResult;
use crate::gray::GrayRouter;
use crate::proxy::context::{BoxBody, RequestContext};
use http::{HeaderName, HeaderValue};
use std::sync::Arc;

/// Picks the backend version for the request and tags both directions with
/// it: the upstream request for routing, the response for the caller.
pub struct GrayFilter {
    router: Arc<GrayRouter>,
    header: HeaderName,
}

impl GrayFilter {
    pub fn new(router: Arc<GrayRouter>) -> anyhow::Result<Self> {
        let header = HeaderName::from_bytes(router.version_header().as_bytes()).map_err(|e| {
            anyhow::anyhow!("invalid version header '{}': {}", router.version_header(), e)
        })?;
        Ok(Self { router, header })
    }

    pub fn router(&self) -> &Arc<GrayRouter> {
        &self.router
    }

    pub(super) async fn on_request(&self, ctx: &mut RequestContext) -> FilterResult {
        let resolution = self
            .router
            .resolve_version(
                &ctx.service_id,
                ctx.user_id(),
                &ctx.headers,
                ctx.query.as_deref(),
            )
            .await;

        tracing::debug!(
            "filter: gray: resolved, service={}, version={}, source={}",
            ctx.service_id,
            resolution.version,
            resolution.source.as_str()
        );

        match HeaderValue::from_str(&resolution.version) {
            Ok(v) => {
                ctx.headers.insert(self.header.clone(), v);
            }
            Err(_) => {
                // An override that cannot be a header value is not forwarded.
                ctx.headers.remove(&self.header);
            }
        }
        ctx.gray_version = Some(resolution.version);
        FilterResult::Continue
    }

    pub(super) fn on_response(&self, ctx: &RequestContext, resp: &mut hyper::Response<BoxBody>) {
        if let Some(v) = ctx
            .gray_version
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            resp.headers_mut().insert(self.header.clone(), v);
        }
    }
}
