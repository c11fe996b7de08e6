//! Kernel URI normalization.
//!
//! Kernels are addressed as `scheme://authority/path[?query]`. Two URIs name the
//! same kernel when their normalized forms are equal; the `tag` query parameter is
//! only meaningful to [`CommandRoutingSlip`](crate::CommandRoutingSlip).

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static HOST_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<host>[^:/?#]+://[^/?#]+)").expect("host pattern is valid"));

/// Normalizes `uri` to `scheme://authority/path`, dropping any query.
///
/// Strings that do not parse as URIs are returned trimmed but otherwise untouched,
/// so comparisons between two malformed values still behave as plain string equality.
pub fn create_kernel_uri(uri: &str) -> String {
    match Url::parse(uri.trim()) {
        Ok(parsed) => base_of(&parsed),
        Err(_) => strip_query(uri.trim()).to_string(),
    }
}

/// Normalizes `uri` to `scheme://authority/path[?query]`.
pub fn create_kernel_uri_with_query(uri: &str) -> String {
    match Url::parse(uri.trim()) {
        Ok(parsed) => match parsed.query() {
            Some(query) if !query.is_empty() => format!("{}?{}", base_of(&parsed), query),
            _ => base_of(&parsed),
        },
        Err(_) => uri.trim().to_string(),
    }
}

/// Appends the `tag` query parameter used by arrival stamps.
pub fn with_tag(uri: &str, tag: &str) -> String {
    format!("{}?tag={}", create_kernel_uri(uri), tag)
}

/// Extracts `scheme://authority` from a kernel URI, used to decide which
/// connector can reach a remote kernel.
pub fn extract_host_and_normalize(uri: &str) -> Option<String> {
    HOST_PATTERN
        .captures(uri.trim())
        .and_then(|caps| caps.name("host"))
        .map(|host| host.as_str().to_string())
}

fn base_of(parsed: &Url) -> String {
    let mut authority = String::new();
    if !parsed.username().is_empty() {
        authority.push_str(parsed.username());
        if let Some(password) = parsed.password() {
            authority.push(':');
            authority.push_str(password);
        }
        authority.push('@');
    }
    if let Some(host) = parsed.host_str() {
        authority.push_str(host);
    }
    if let Some(port) = parsed.port() {
        authority.push(':');
        authority.push_str(&port.to_string());
    }
    let path = if parsed.path().is_empty() {
        "/"
    } else {
        parsed.path()
    };
    format!("{}://{}{}", parsed.scheme(), authority, path)
}

fn strip_query(uri: &str) -> &str {
    uri.split_once('?').map_or(uri, |(base, _)| base)
}
