//! URL canonicalization for visit aggregation.
//!
//! Every visit, bookmark open and history row is folded under a key of the form
//! `host[:port]/path`: lowercase, `www.` stripped, query and fragment dropped,
//! trailing slashes trimmed and an empty path forced to `/`. Scheme and default
//! port do not participate, so `https://www.example.com/a?x=1` and
//! `http://example.com/a` aggregate together.

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

fn scheme_prefix() -> &'static Regex {
    static SCHEME: OnceLock<Regex> = OnceLock::new();
    SCHEME.get_or_init(|| Regex::new(r"(?i)^[a-z][a-z0-9+.\-]*://").expect("valid scheme regex"))
}

/// Canonicalize a URL into its aggregation key.
///
/// Never fails: input the URL parser rejects (including keys that were already
/// normalized) goes through a textual fallback, so `normalize_url_key` is
/// idempotent and may return degenerate keys such as `""` or `"foo/"`.
pub fn normalize_url_key(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Ok(parsed) = Url::parse(trimmed) {
        if let Some(host) = parsed.host_str() {
            let authority = match parsed.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            return canonicalize(&authority, parsed.path());
        }
    }

    fallback_key(trimmed)
}

/// Only http(s) pages are tracked.
pub fn is_trackable_url(raw: &str) -> bool {
    match Url::parse(raw.trim()) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some(),
        Err(_) => false,
    }
}

fn fallback_key(raw: &str) -> String {
    let without_scheme = scheme_prefix().replace(raw, "");
    let without_suffix = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    match without_suffix.find('/') {
        Some(idx) => canonicalize(&without_suffix[..idx], &without_suffix[idx..]),
        None => canonicalize(without_suffix, ""),
    }
}

fn canonicalize(authority: &str, path: &str) -> String {
    let authority = authority.trim().to_lowercase();
    let mut host = authority.as_str();
    while let Some(rest) = host.strip_prefix("www.") {
        if rest.is_empty() {
            break;
        }
        host = rest;
    }

    let path = path.trim_end_matches('/').to_lowercase();

    if host.is_empty() {
        return path;
    }

    if path.is_empty() {
        format!("{}/", host)
    } else {
        format!("{}{}", host, path)
    }
}
