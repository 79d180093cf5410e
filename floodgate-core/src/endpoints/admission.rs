//! Admission middleware: runs every request on the protected routes
//! through the rate limiter and maps the decision (and the governing
//! rule's block action) to an HTTP response.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use uuid::Uuid;

use crate::gateway_util::AppState;
use crate::rate_limiting::{BlockAction, RateLimitCheck, RequestContext};

pub const TENANT_ID_HEADER: &str = "x-floodgate-tenant-id";
pub const USER_ID_HEADER: &str = "x-floodgate-user-id";
pub const BILLING_TIER_HEADER: &str = "x-floodgate-billing-tier";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

const DEFAULT_BILLING_TIER: &str = "free";

/// Inserted into the request when a `queue` block action admits the
/// request for deferred processing instead of rejecting it.
#[derive(Clone, Copy, Debug)]
pub struct DeferredAdmission {
    pub delay_seconds: i64,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn client_ip(headers: &HeaderMap) -> Option<std::net::IpAddr> {
    // First hop of X-Forwarded-For; the trusted proxy prepends it.
    header_str(headers, FORWARDED_FOR_HEADER)?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

pub async fn rate_limit_middleware(
    State(state): AppState,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let tenant_id = header_str(headers, TENANT_ID_HEADER).and_then(|v| v.parse::<Uuid>().ok());
    let user_id = header_str(headers, USER_ID_HEADER).map(str::to_string);
    let billing_tier = header_str(headers, BILLING_TIER_HEADER)
        .unwrap_or(DEFAULT_BILLING_TIER)
        .to_string();
    let ip = client_ip(headers);
    let path = request.uri().path().to_string();
    let method = request.method().as_str().to_string();

    let check = state
        .rate_limiter
        .check_rate_limit(&RequestContext {
            path: &path,
            method: &method,
            tenant_id,
            user_id: user_id.as_deref(),
            client_ip: ip,
            billing_tier: &billing_tier,
        })
        .await;

    if check.allowed {
        let mut response = next.run(request).await;
        attach_quota_headers(&check, response.headers_mut());
        return response;
    }

    match check.block_action.unwrap_or(BlockAction::Reject) {
        BlockAction::Queue => {
            // Accept the request but tell the handler to defer the work.
            request.extensions_mut().insert(DeferredAdmission {
                delay_seconds: check.retry_after_seconds.unwrap_or(60),
            });
            next.run(request).await
        }
        BlockAction::Throttle => denial_response(&check, true),
        BlockAction::Reject => denial_response(&check, false),
    }
}

fn denial_response(check: &RateLimitCheck, with_retry_after: bool) -> Response {
    let retry_after = check.retry_after_seconds.unwrap_or(60);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "rate limit exceeded",
            "retry_after_seconds": retry_after,
        })),
    )
        .into_response();
    if with_retry_after {
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    attach_quota_headers(check, response.headers_mut());
    response
}

fn attach_quota_headers(check: &RateLimitCheck, headers: &mut HeaderMap) {
    let Some(remaining) = check.remaining() else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(&check.max_requests.to_string()) {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
}
