//! Cross-origin headers for gateway responses

use crate::config::CorsConfig;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_METHOD, VARY,
};
use hyper::{Method, Request, Response, StatusCode};

/// An `OPTIONS` request carrying `Access-Control-Request-Method`
pub fn is_preflight<B>(req: &Request<B>) -> bool {
    req.method() == Method::OPTIONS && req.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD)
}

/// Value for `Access-Control-Allow-Origin`, or `None` if the origin is not allowed
pub fn allowed_origin(cors: &CorsConfig, origin: Option<&HeaderValue>) -> Option<HeaderValue> {
    if cors.origins.iter().any(|o| o == "*") {
        return Some(HeaderValue::from_static("*"));
    }
    let origin = origin?;
    let origin_str = origin.to_str().ok()?;
    cors.origins
        .iter()
        .any(|o| o.eq_ignore_ascii_case(origin_str))
        .then(|| origin.clone())
}

/// Add CORS headers without replacing any the upstream already set
pub fn apply_headers(headers: &mut HeaderMap, cors: &CorsConfig, origin: Option<&HeaderValue>) {
    let Some(allow_origin) = allowed_origin(cors, origin) else {
        return;
    };
    if allow_origin != "*" {
        headers.append(VARY, HeaderValue::from_static("Origin"));
    }
    headers.entry(ACCESS_CONTROL_ALLOW_ORIGIN).or_insert(allow_origin);
    if let Ok(methods) = HeaderValue::from_str(&cors.methods.join(", ")) {
        headers.entry(ACCESS_CONTROL_ALLOW_METHODS).or_insert(methods);
    }
    if let Ok(allow_headers) = HeaderValue::from_str(&cors.headers.join(", ")) {
        headers.entry(ACCESS_CONTROL_ALLOW_HEADERS).or_insert(allow_headers);
    }
}

/// `204 No Content` answer to a preflight request
pub fn preflight_response(
    cors: &CorsConfig,
    origin: Option<&HeaderValue>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum");

    let headers = response.headers_mut();
    apply_headers(headers, cors, origin);
    if headers.contains_key(ACCESS_CONTROL_ALLOW_ORIGIN) {
        headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(cors.max_age_secs));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restricted() -> CorsConfig {
        CorsConfig {
            origins: vec!["https://app.example.com".to_string()],
            ..CorsConfig::default()
        }
    }

    #[test]
    fn test_wildcard_allows_any_origin() {
        let cors = CorsConfig::default();
        assert_eq!(allowed_origin(&cors, None).unwrap(), "*");
        let origin = HeaderValue::from_static("https://other.example.com");
        assert_eq!(allowed_origin(&cors, Some(&origin)).unwrap(), "*");
    }

    #[test]
    fn test_restricted_origin_list() {
        let cors = restricted();
        let allowed = HeaderValue::from_static("https://app.example.com");
        let denied = HeaderValue::from_static("https://evil.example.com");
        assert_eq!(allowed_origin(&cors, Some(&allowed)).unwrap(), allowed);
        assert!(allowed_origin(&cors, Some(&denied)).is_none());
        assert!(allowed_origin(&cors, None).is_none());
    }

    #[test]
    fn test_apply_keeps_upstream_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("https://mine.example.com"),
        );
        apply_headers(&mut headers, &CorsConfig::default(), None);
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "https://mine.example.com");
        assert!(headers.contains_key(ACCESS_CONTROL_ALLOW_METHODS));
    }

    #[test]
    fn test_apply_restricted_sets_vary() {
        let mut headers = HeaderMap::new();
        let origin = HeaderValue::from_static("https://app.example.com");
        apply_headers(&mut headers, &restricted(), Some(&origin));
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), &origin);
        assert_eq!(headers.get(VARY).unwrap(), "Origin");
    }

    #[test]
    fn test_preflight_response() {
        let response = preflight_response(&CorsConfig::default(), None);
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers().get(ACCESS_CONTROL_MAX_AGE).unwrap(), "86400");
        assert_eq!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }

    #[test]
    fn test_is_preflight() {
        let req = Request::builder()
            .method(Method::OPTIONS)
            .header(ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(())
            .unwrap();
        assert!(is_preflight(&req));

        let plain = Request::builder().method(Method::OPTIONS).body(()).unwrap();
        assert!(!is_preflight(&plain));
    }
}
