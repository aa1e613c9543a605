use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Bearer token guarding destructive routes
#[derive(Clone)]
pub struct AdminAuth {
    token: Option<String>,
}

impl AdminAuth {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }
}

/// Admin token middleware
///
/// - 503 when no `ADMIN_TOKEN` is configured (destructive routes are disabled)
/// - 401 when the `Authorization: Bearer` header is missing or wrong
pub async fn require_admin_token(
    State(auth): State<Arc<AdminAuth>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = auth.token.as_deref() else {
        warn!("Admin route {} called but ADMIN_TOKEN is not configured", req.uri().path());
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let presented = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let rejection = match presented {
        Some(token) if constant_time_compare(token, expected) => None,
        Some(_) => Some("Invalid admin token"),
        None => Some("Admin request without bearer token"),
    };

    if let Some(reason) = rejection {
        warn!("{} for {} {}", reason, req.method(), req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }

    info!("Admin request authorized: {} {}", req.method(), req.uri().path());
    Ok(next.run(req).await)
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware, routing::delete, Router};
    use tower::ServiceExt;

    fn app(token: Option<&str>) -> Router {
        let auth = Arc::new(AdminAuth::new(token.map(str::to_string)));
        Router::new()
            .route("/tenants/acme", delete(|| async { "gone" }))
            .layer(middleware::from_fn_with_state(auth, require_admin_token))
    }

    fn request(bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("DELETE").uri("/tenants/acme");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("secret123", "secret123"));
        assert!(!constant_time_compare("secret123", "secret124"));
        assert!(!constant_time_compare("short", "longer"));
    }

    #[tokio::test]
    async fn test_valid_token_passes() {
        let response = app(Some("s3cret")).oneshot(request(Some("s3cret"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_wrong_or_missing_token() {
        let response = app(Some("s3cret")).oneshot(request(Some("nope"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(Some("s3cret")).oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_disabled_without_token() {
        assert!(!AdminAuth::new(None).is_enabled());
        let response = app(None).oneshot(request(Some("anything"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
