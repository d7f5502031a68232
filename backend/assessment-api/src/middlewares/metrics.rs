use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::metrics::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};

/// Records request count and latency for every HTTP request.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let response = next.run(req).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[&method, &path])
        .observe(duration);

    response
}

/// Normalize URL path to avoid cardinality explosion.
/// Attempt ids (UUIDs) and numeric segments collapse to a placeholder.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if is_dynamic_segment(segment) {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_dynamic_segment(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    // UUID format: 8-4-4-4-12 hex characters
    let uuid_like =
        segment.len() == 36 && segment.chars().all(|c| c.is_ascii_hexdigit() || c == '-');
    let numeric = segment.chars().all(|c| c.is_ascii_digit());
    uuid_like || numeric
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path("/api/v1/attempts/550e8400-e29b-41d4-a716-446655440000"),
            "/api/v1/attempts/{id}"
        );
        assert_eq!(
            normalize_path("/api/v1/attempts/550e8400-e29b-41d4-a716-446655440000/answers"),
            "/api/v1/attempts/{id}/answers"
        );
        assert_eq!(
            normalize_path("/api/v1/attempts/123/submit"),
            "/api/v1/attempts/{id}/submit"
        );
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/metrics"), "/metrics");
    }

    #[test]
    fn test_is_dynamic_segment() {
        assert!(is_dynamic_segment("550e8400-e29b-41d4-a716-446655440000"));
        assert!(is_dynamic_segment("123"));
        assert!(!is_dynamic_segment("not-a-uuid"));
        assert!(!is_dynamic_segment("answers"));
        assert!(!is_dynamic_segment(""));
    }
}
