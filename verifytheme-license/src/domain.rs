//! Host normalization and local/development host detection.
//!
//! Registries report bound domains with whatever noise the original request
//! carried (scheme, `www.`, subdomains, paths). Comparisons therefore go
//! through [`registrable_domain`], which keeps the rightmost
//! `label.suffix` pair.

use regex_lite::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;

/// Suffixes treated as local or development installs by default.
pub const DEFAULT_LOCAL_SUFFIXES: &[&str] =
    &[".local", ".dev", ".test", ".localhost", ".invalid", ".example"];

static REGISTRABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[a-z0-9][a-z0-9-]{1,63}\.[a-z.]{2,6}$").expect("registrable domain pattern")
});

/// Extracts the bare, lowercased host from a URL or host string.
///
/// ```
/// use verifytheme_license::domain::host_of;
///
/// assert_eq!(host_of("https://Shop.Example.com:8443/wp-admin?x=1"), "shop.example.com");
/// ```
#[must_use]
pub fn host_of(input: &str) -> String {
    let mut rest = input.trim();
    if let Some((_, after)) = rest.split_once("://") {
        rest = after;
    } else if let Some(after) = rest.strip_prefix("//") {
        rest = after;
    }
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let mut authority = &rest[..end];
    if let Some((_, host)) = authority.rsplit_once('@') {
        authority = host;
    }

    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or_default()
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
                host
            }
            _ => authority,
        }
    };

    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Returns the registrable domain of `input`, e.g. `www.shop.example.com`
/// becomes `example.com`. `None` when the host has no `label.suffix` shape.
#[must_use]
pub fn registrable_domain(input: &str) -> Option<String> {
    let host = host_of(input);
    REGISTRABLE
        .find(&host)
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// True when both inputs name the same site.
#[must_use]
pub fn domains_match(a: &str, b: &str) -> bool {
    match (registrable_domain(a), registrable_domain(b)) {
        (Some(a), Some(b)) => a == b,
        _ => {
            let (a, b) = (host_of(a), host_of(b));
            !a.is_empty() && a == b
        }
    }
}

/// True for loopback hosts and hosts ending in one of `suffixes`.
#[must_use]
pub fn is_local_host<S: AsRef<str>>(domain: &str, suffixes: &[S]) -> bool {
    let host = host_of(domain);
    if host.is_empty() {
        return false;
    }
    if host == "localhost" {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }
    suffixes.iter().any(|suffix| {
        let suffix = suffix.as_ref().to_ascii_lowercase();
        !suffix.is_empty() && host.ends_with(&suffix)
    })
}
