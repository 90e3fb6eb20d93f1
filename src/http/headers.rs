//! Case-insensitive header multimap.

use http::header::{self, AsHeaderName, HeaderMap, HeaderName, HeaderValue};
use std::ops::{Deref, DerefMut};
use thiserror::Error;

use crate::http::error::ParseError;

#[derive(Debug, Error)]
#[error("invalid header {name}")]
pub struct InvalidHeader {
    pub name: String,
}

/// Ordered multimap of header name → values. Names compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderSet(HeaderMap);

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> HeaderMap {
        self.0
    }

    /// First value of `name`, if it is valid visible ASCII.
    pub fn get_str<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        self.0.get(name).and_then(|v| v.to_str().ok())
    }

    /// Replace every value of `name` with `value`.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), InvalidHeader> {
        let invalid = || InvalidHeader { name: name.to_string() };
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
        self.0.insert(name, value);
        Ok(())
    }

    pub(crate) fn append_raw(&mut self, name: &[u8], value: &[u8]) -> Result<(), ParseError> {
        let name = HeaderName::from_bytes(name).map_err(|_| ParseError::InvalidHeader)?;
        let value = HeaderValue::from_bytes(value).map_err(|_| ParseError::InvalidHeader)?;
        self.0.append(name, value);
        Ok(())
    }

    /// Whether any comma-separated value of `name` equals `token`, ignoring case.
    pub fn has_token<K: AsHeaderName>(&self, name: K, token: &str) -> bool {
        self.0
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// The declared Content-Length. Repeated values must agree.
    pub fn content_length(&self) -> Result<Option<u64>, ParseError> {
        let mut found: Option<u64> = None;
        for value in self.0.get_all(header::CONTENT_LENGTH) {
            for part in value
                .to_str()
                .map_err(|_| ParseError::InvalidContentLength)?
                .split(',')
            {
                let part = part.trim();
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ParseError::InvalidContentLength);
                }
                let n: u64 = part.parse().map_err(|_| ParseError::InvalidContentLength)?;
                match found {
                    Some(existing) if existing != n => return Err(ParseError::InvalidContentLength),
                    _ => found = Some(n),
                }
            }
        }
        Ok(found)
    }

    /// `Some(true)` when the final transfer coding is chunked, `Some(false)`
    /// when some other coding is last, `None` without the header.
    pub fn chunked(&self) -> Option<bool> {
        let mut last = None;
        for value in self.0.get_all(header::TRANSFER_ENCODING) {
            let text = value.to_str().unwrap_or_default();
            if let Some(coding) = text.split(',').map(str::trim).filter(|c| !c.is_empty()).last() {
                last = Some(coding.eq_ignore_ascii_case("chunked"));
            }
        }
        last
    }
}

impl Deref for HeaderSet {
    type Target = HeaderMap;

    fn deref(&self) -> &HeaderMap {
        &self.0
    }
}

impl DerefMut for HeaderSet {
    fn deref_mut(&mut self) -> &mut HeaderMap {
        &mut self.0
    }
}

impl From<HeaderMap> for HeaderSet {
    fn from(map: HeaderMap) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_case_insensitive() {
        let mut headers = HeaderSet::new();
        headers.append_raw(b"X-Custom", b"one").unwrap();
        headers.append_raw(b"x-custom", b"two").unwrap();

        assert_eq!(headers.get_str("X-CUSTOM"), Some("one"));
        assert_eq!(headers.get_all("x-custom").iter().count(), 2);
    }

    #[test]
    fn token_lists() {
        let mut headers = HeaderSet::new();
        headers.set("connection", "keep-alive, Upgrade").unwrap();
        assert!(headers.has_token(header::CONNECTION, "upgrade"));
        assert!(!headers.has_token(header::CONNECTION, "close"));
    }

    #[test]
    fn conflicting_content_lengths_rejected() {
        let mut headers = HeaderSet::new();
        headers.append_raw(b"content-length", b"5").unwrap();
        assert_eq!(headers.content_length().unwrap(), Some(5));

        headers.append_raw(b"content-length", b"6").unwrap();
        assert!(headers.content_length().is_err());

        let mut signed = HeaderSet::new();
        signed.append_raw(b"content-length", b"+5").unwrap();
        assert!(signed.content_length().is_err());
    }

    #[test]
    fn chunked_must_be_last_coding() {
        let mut headers = HeaderSet::new();
        assert_eq!(headers.chunked(), None);
        headers.set("transfer-encoding", "gzip, chunked").unwrap();
        assert_eq!(headers.chunked(), Some(true));
        headers.set("transfer-encoding", "chunked, gzip").unwrap();
        assert_eq!(headers.chunked(), Some(false));
    }

    #[test]
    fn invalid_names_rejected() {
        let mut headers = HeaderSet::new();
        assert!(headers.set("bad name", "v").is_err());
        assert!(headers.append_raw(b"", b"v").is_err());
    }
}
