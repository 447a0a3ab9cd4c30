//! Pure header-list helpers shared by both tunnel ends.
//!
//! HTTP/1 and HTTP/2 header sets are treated as two canonical forms of the
//! same ordered multimap; the conversions here are total: an HTTP/2 set
//! with no `:status` converts to status 200, an HTTP/1 set with no `Host`
//! simply yields no authority.

use crate::HeaderList;

/// True for HTTP/2 pseudo-header names (`:method`, `:status`, …).
pub fn is_pseudo(name: &str) -> bool {
    name.starts_with(':')
}

/// Remove all pseudo-headers, preserving the order of the rest.
pub fn strip_pseudo_headers(headers: &[(String, String)]) -> HeaderList {
    headers
        .iter()
        .filter(|(name, _)| !is_pseudo(name))
        .cloned()
        .collect()
}

/// The status carried in an HTTP/2 header set.  Absent or unparsable
/// `:status` yields 200.
pub fn status_from_h2_headers(headers: &[(String, String)]) -> u16 {
    header_value(headers, ":status")
        .and_then(|v| v.parse().ok())
        .unwrap_or(200)
}

/// First value for `name`, matched case-insensitively.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Append `value` to `name`, comma-concatenating with any existing value
/// (the `X-Forwarded-*` accumulation rule).
pub fn append_with_comma(headers: &mut HeaderList, name: &str, value: &str) {
    if let Some((_, existing)) = headers
        .iter_mut()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
    {
        existing.push(',');
        existing.push_str(value);
    } else {
        headers.push((name.to_owned(), value.to_owned()));
    }
}

/// Insert `(name, value)` only when `name` is absent.
pub fn set_if_absent(headers: &mut HeaderList, name: &str, value: &str) {
    if header_value(headers, name).is_none() {
        headers.push((name.to_owned(), value.to_owned()));
    }
}

/// True when the `Content-Type` marks gRPC traffic.
pub fn is_grpc(headers: &[(String, String)]) -> bool {
    header_value(headers, "content-type")
        .is_some_and(|v| v.starts_with("application/grpc"))
}
