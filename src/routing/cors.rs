//! Response headers added to every answer from a matched route.

use http::header::{self, HeaderValue};
use http::Method;

use crate::http::{HeaderSet, Response};
use crate::routing::route::{allow_header, RegisteredRoute};

/// Headers for a response from `route`.
pub fn apply(route: &RegisteredRoute, request_method: &Method, request_headers: &HeaderSet, response: &mut Response) {
    apply_for(&route.route.methods, route.route.cors, request_method, request_headers, response);
}

/// Add `Allow` for `OPTIONS`/405 answers and, when `cors` is set, the
/// `Access-Control-*` echo headers.
pub fn apply_for(
    methods: &[Method],
    cors: bool,
    request_method: &Method,
    request_headers: &HeaderSet,
    response: &mut Response,
) {
    let allow = HeaderValue::from_str(&allow_header(methods)).ok();

    if (*request_method == Method::OPTIONS || response.status == http::StatusCode::METHOD_NOT_ALLOWED)
        && !response.headers.contains_key(header::ALLOW)
    {
        if let Some(allow) = &allow {
            response.headers.insert(header::ALLOW, allow.clone());
        }
    }

    if !cors {
        return;
    }

    if request_headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD) {
        if let Some(allow) = allow {
            response.headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, allow);
        }
    }
    if let Some(requested) = request_headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
        response
            .headers
            .insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
    if let Some(origin) = request_headers.get(header::ORIGIN) {
        response.headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        response.headers.append(header::VARY, HeaderValue::from_static("Origin"));
    }
}
