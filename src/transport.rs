use std::future::Future;

use http::header::{AUTHORIZATION, HeaderValue};

use crate::error::Error;

pub type ApiRequest = http::Request<Vec<u8>>;
pub type ApiResponse = http::Response<Vec<u8>>;

/// Sends API requests. Any HTTP status counts as a successful send; only
/// transport-level failures are errors.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: ApiRequest) -> impl Future<Output = Result<ApiResponse, Error>> + Send;
}

#[cfg(feature = "reqwest")]
impl Transport for reqwest::Client {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, Error> {
        let request = reqwest::Request::try_from(request)?;
        let response = self.execute(request).await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        let mut out = http::Response::new(body);
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        Ok(out)
    }
}

/// Copy of `request` suitable for a retry. Extensions are not carried over.
pub(crate) fn clone_request(request: &ApiRequest) -> ApiRequest {
    let mut copy = http::Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

/// Set `Authorization: Bearer <token>`, replacing any existing value.
///
/// A token that cannot be a header value leaves the request unchanged.
pub(crate) fn with_bearer(mut request: ApiRequest, token: &str) -> ApiRequest {
    match HeaderValue::from_str(&format!("Bearer {token}")) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Err(_) => tracing::warn!("Stored access token is not a valid header value"),
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn sample() -> ApiRequest {
        http::Request::builder()
            .method(Method::POST)
            .uri("http://localhost:5000/api/challenges")
            .header("x-trace", "abc")
            .body(br#"{"title":"Read"}"#.to_vec())
            .unwrap()
    }

    #[test]
    fn clone_keeps_method_uri_headers_and_body() {
        let original = sample();
        let copy = clone_request(&original);

        assert_eq!(copy.method(), Method::POST);
        assert_eq!(copy.uri(), original.uri());
        assert_eq!(copy.headers().get("x-trace").unwrap(), "abc");
        assert_eq!(copy.body(), original.body());
    }

    #[test]
    fn bearer_replaces_existing_authorization() {
        let request = with_bearer(sample(), "old");
        let request = with_bearer(request, "new");

        let values: Vec<_> = request.headers().get_all(AUTHORIZATION).iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "Bearer new");
    }

    #[test]
    fn invalid_token_leaves_request_alone() {
        let request = with_bearer(sample(), "bad\ntoken");
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }
}
