//! Caller identity
//!
//! Every mutating request must name its caller in the `X-Gadget-Client`
//! header. Lock ownership is tracked against that name.

use axum::{
    extract::Request,
    http::{HeaderMap, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::AppError;

pub const CLIENT_HEADER: &str = "x-gadget-client";

/// Identity of the client issuing a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

impl ClientIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Read the identity header, ignoring blank values
pub fn client_identity(headers: &HeaderMap) -> Option<ClientIdentity> {
    headers
        .get(CLIENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| ClientIdentity(value.to_string()))
}

/// Identity middleware
///
/// Adds the caller identity to request extensions. Read-only requests
/// pass without one.
pub async fn identity_middleware(mut request: Request, next: Next) -> Response {
    match client_identity(request.headers()) {
        Some(identity) => {
            request.extensions_mut().insert(identity);
        }
        None if is_read_only(request.method()) => {}
        None => {
            return AppError::BadRequest(format!("Missing {} header", CLIENT_HEADER))
                .into_response()
        }
    }
    next.run(request).await
}

fn is_read_only(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderValue, StatusCode};
    use axum::routing::get;
    use axum::{middleware, Extension, Router};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route(
                "/gadget/lock",
                get(|| async { "open" })
                    .post(|Extension(client): Extension<ClientIdentity>| async move { client.0 }),
            )
            .layer(middleware::from_fn(identity_middleware))
    }

    fn request(method: Method, client: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder()
            .method(method)
            .uri("/gadget/lock");
        if let Some(client) = client {
            builder = builder.header(CLIENT_HEADER, client);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_mutating_request_without_identity_is_rejected() {
        let response = app().oneshot(request(Method::POST, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains(CLIENT_HEADER));
    }

    #[tokio::test]
    async fn test_identity_reaches_the_handler() {
        let response = app()
            .oneshot(request(Method::POST, Some("clientA")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "clientA");
    }

    #[tokio::test]
    async fn test_read_only_request_needs_no_identity() {
        let response = app().oneshot(request(Method::GET, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "open");
    }

    #[test]
    fn test_client_identity() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_identity(&headers), None);

        headers.insert(CLIENT_HEADER, HeaderValue::from_static("   "));
        assert_eq!(client_identity(&headers), None);

        headers.insert("X-Gadget-Client", HeaderValue::from_static(" clientA "));
        assert_eq!(
            client_identity(&headers),
            Some(ClientIdentity("clientA".to_string()))
        );
    }

    #[test]
    fn test_read_only_methods() {
        assert!(is_read_only(&Method::GET));
        assert!(!is_read_only(&Method::POST));
        assert!(!is_read_only(&Method::DELETE));
    }
}
