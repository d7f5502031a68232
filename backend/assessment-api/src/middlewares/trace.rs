use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

#[derive(Clone, Debug)]
pub struct RequestTraceContext {
    pub trace_id: String,
}

/// Ensures every request/response pair carries a trace identifier so that
/// logs and external collectors can correlate a student's actions.
pub async fn trace_context_middleware(mut request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestTraceContext {
        trace_id: trace_id.clone(),
    });
    ensure_trace_header(request.headers_mut(), &trace_id);

    let mut response = next.run(request).await;
    ensure_trace_header(response.headers_mut(), &trace_id);

    response
}

fn ensure_trace_header(headers: &mut HeaderMap, trace_id: &str) {
    if headers.get(TRACE_ID_HEADER).is_none() {
        if let Ok(value) = HeaderValue::from_str(trace_id) {
            headers.insert(HeaderName::from_static(TRACE_ID_HEADER), value);
        }
    }
}
