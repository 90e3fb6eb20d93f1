//! Owned request and response messages.

use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use serde::Serialize;

use crate::http::body::Body;
use crate::http::error::ParseError;
use crate::http::headers::{HeaderSet, InvalidHeader};
use crate::http::preamble::{MessagePreamble, StartLine};

/// An HTTP request: start line, headers, and a body handle.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Request target as sent: origin-form (`/path?q`) or absolute-form.
    pub target: String,
    pub version: Version,
    pub headers: HeaderSet,
    pub body: Body,
}

impl Request {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            version: Version::HTTP_11,
            headers: HeaderSet::new(),
            body: Body::Empty,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>, body: impl Into<Body>) -> Self {
        Self::new(Method::POST, target).with_body(body)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(mut self, name: &str, value: &str) -> Result<Self, InvalidHeader> {
        self.headers.set(name, value)?;
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Build from a parsed request preamble.
    pub fn from_preamble(preamble: MessagePreamble, body: Body) -> Result<Self, ParseError> {
        match preamble.start {
            StartLine::Request { method, target } => Ok(Self {
                method,
                target,
                version: preamble.version,
                headers: preamble.headers,
                body,
            }),
            StartLine::Response { .. } => Err(ParseError::InvalidStartLine),
        }
    }

    /// Path component of the target, without query.
    pub fn path(&self) -> &str {
        let target = self.target.as_str();
        let origin = if target.starts_with('/') {
            target
        } else if let Some(scheme_end) = target.find("://") {
            let after = &target[scheme_end + 3..];
            after.find('/').map(|i| &after[i..]).unwrap_or("/")
        } else {
            target
        };
        let end = origin.find(|c| c == '?' || c == '#').unwrap_or(origin.len());
        &origin[..end]
    }

    pub fn query(&self) -> Option<&str> {
        let start = self.target.find('?')? + 1;
        let rest = &self.target[start..];
        Some(rest.split('#').next().unwrap_or(rest))
    }

    /// Host the request is addressed to: the Host header, falling back to
    /// the authority of an absolute-form target.
    pub fn host(&self) -> Option<String> {
        if let Some(host) = self.headers.get_str(header::HOST) {
            return Some(host.to_string());
        }
        let url = url::Url::parse(&self.target).ok()?;
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }
}

/// An HTTP response: status, headers, and a body handle.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    /// Reason phrase; the canonical one is used when absent.
    pub reason: Option<String>,
    pub version: Version,
    pub headers: HeaderSet,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: HeaderSet::new(),
            body: Body::Empty,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        Self::new(status)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))
            .with_body(text.into())
    }

    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(StatusCode::OK)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(body))
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(mut self, name: &str, value: &str) -> Result<Self, InvalidHeader> {
        self.headers.set(name, value)?;
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn from_preamble(preamble: MessagePreamble, body: Body) -> Result<Self, ParseError> {
        match preamble.start {
            StartLine::Response { status, reason } => Ok(Self {
                status,
                reason: Some(reason),
                version: preamble.version,
                headers: preamble.headers,
                body,
            }),
            StartLine::Request { .. } => Err(ParseError::InvalidStartLine),
        }
    }

    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Buffer the body.
    pub async fn bytes(self) -> std::io::Result<Bytes> {
        self.body.collect().await
    }

    pub async fn text_body(self) -> std::io::Result<String> {
        self.body.text().await
    }
}
