// farcrawl is a polite, high-throughput web crawler.
// Copyright (C) 2024 The farcrawl Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Canonical URL normalization (spec §6) and registered-domain extraction.
//!
//! Every URL is normalized exactly once, here, before it is hashed, checked
//! against the dedup bloom, or written to a frontier file.

use once_cell::sync::Lazy;
use publicsuffix::Psl;

use crate::error::Error;

pub const DEFAULT_MAX_URL_LEN: usize = 2048;

static PUBLIC_SUFFIX_LIST: Lazy<publicsuffix::List> = Lazy::new(|| {
    include_str!("../public_suffix_list.dat")
        .parse()
        .expect("embedded public suffix list failed to parse")
});

/// Parse `maybe_relative` against `base` (if it isn't already absolute), then
/// normalize per spec §6:
/// 1. lowercase scheme/host (handled by `url::Url` parsing/IDNA),
/// 2. drop default ports,
/// 3. remove the fragment,
/// 4. collapse duplicate slashes in the path,
/// 5. reject non-http(s) schemes,
/// 6. reject URLs longer than `max_len`.
pub fn normalize(
    base: Option<&url::Url>,
    maybe_relative: &str,
    max_len: usize,
) -> Result<url::Url, Error> {
    let mut parsed = match url::Url::parse(maybe_relative) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = base.ok_or(url::ParseError::RelativeUrlWithoutBase)?;
            base.join(maybe_relative)?
        }
        Err(e) => return Err(e.into()),
    };

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(Error::InvalidUrl(format!(
            "unsupported scheme: {}",
            parsed.scheme()
        )));
    }

    parsed.set_fragment(None);

    let default_port = match parsed.scheme() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    };
    if parsed.port() == default_port {
        let _ = parsed.set_port(None);
    }

    let collapsed = collapse_slashes(parsed.path());
    if collapsed != parsed.path() {
        parsed.set_path(&collapsed);
    }

    if parsed.as_str().len() > max_len {
        return Err(Error::InvalidUrl(format!(
            "url exceeds max length {max_len}"
        )));
    }

    Ok(parsed)
}

/// Idempotence check (L1): re-normalizing an already-normalized URL is a
/// no-op. `normalize` is written to guarantee this by construction; this
/// helper exists for callers that want to assert it (tests, invariant
/// checks) without duplicating the logic above.
pub fn is_normalized(u: &url::Url, max_len: usize) -> bool {
    normalize(None, u.as_str(), max_len)
        .map(|n| &n == u)
        .unwrap_or(false)
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

/// The registered (public-suffix + one label) domain for a URL's host, e.g.
/// `sub.example.co.uk` -> `example.co.uk`. Returns `None` for IPs or hosts
/// with no recognized suffix.
pub fn registered_domain(u: &url::Url) -> Option<String> {
    let host = u.host_str()?;
    let domain = PUBLIC_SUFFIX_LIST.domain(host.as_bytes())?;
    std::str::from_utf8(domain.as_bytes()).ok().map(String::from)
}

/// The visited-record key (spec §6): the first 16 hex characters of the
/// URL's SHA-256 digest. Truncated (rather than the full 64-char digest) to
/// keep `visited:<hash16(url)>` keys compact; collisions are acceptable
/// since the visited record is a debugging/metrics log, not the dedup
/// authority (the bloom filter and frontier files own that).
pub fn hash16(url: &url::Url) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(url.as_str().as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_default_ports() {
        let u = normalize(None, "http://Example.com:80/a", DEFAULT_MAX_URL_LEN).unwrap();
        assert_eq!(u.as_str(), "http://example.com/a");

        let u = normalize(None, "https://example.com:443/a", DEFAULT_MAX_URL_LEN).unwrap();
        assert_eq!(u.as_str(), "https://example.com/a");
    }

    #[test]
    fn keeps_non_default_ports() {
        let u = normalize(None, "http://example.com:8080/a", DEFAULT_MAX_URL_LEN).unwrap();
        assert_eq!(u.port(), Some(8080));
    }

    #[test]
    fn removes_fragment() {
        let u = normalize(None, "http://example.com/a#section", DEFAULT_MAX_URL_LEN).unwrap();
        assert_eq!(u.fragment(), None);
    }

    #[test]
    fn collapses_duplicate_slashes_in_path() {
        let u = normalize(None, "http://example.com/a//b///c", DEFAULT_MAX_URL_LEN).unwrap();
        assert_eq!(u.path(), "/a/b/c");
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(normalize(None, "ftp://example.com/a", DEFAULT_MAX_URL_LEN).is_err());
        assert!(normalize(None, "javascript:alert(1)", DEFAULT_MAX_URL_LEN).is_err());
    }

    #[test]
    fn rejects_overlong_urls() {
        let long = format!("http://example.com/{}", "a".repeat(3000));
        assert!(normalize(None, &long, DEFAULT_MAX_URL_LEN).is_err());
    }

    #[test]
    fn resolves_relative_against_base() {
        let base = url::Url::parse("http://example.com/dir/page.html").unwrap();
        let u = normalize(Some(&base), "../other", DEFAULT_MAX_URL_LEN).unwrap();
        assert_eq!(u.as_str(), "http://example.com/other");
    }

    #[test]
    fn normalize_is_idempotent() {
        let u = normalize(None, "http://Example.com:80/a//b#x", DEFAULT_MAX_URL_LEN).unwrap();
        assert!(is_normalized(&u, DEFAULT_MAX_URL_LEN));
    }

    #[test]
    fn registered_domain_strips_subdomains() {
        let u = url::Url::parse("http://test.example.com/a").unwrap();
        assert_eq!(registered_domain(&u).as_deref(), Some("example.com"));
    }

    #[test]
    fn hash16_is_sixteen_hex_chars_and_stable() {
        let u = url::Url::parse("http://example.com/a").unwrap();
        let h = hash16(&u);
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, hash16(&u));
    }

    #[test]
    fn hash16_differs_across_urls() {
        let a = url::Url::parse("http://example.com/a").unwrap();
        let b = url::Url::parse("http://example.com/b").unwrap();
        assert_ne!(hash16(&a), hash16(&b));
    }

    proptest::proptest! {
        #[test]
        fn normalize_idempotence_law(path in "[a-zA-Z0-9/]{0,40}") {
            let raw = format!("http://example.com/{path}");
            if let Ok(once) = normalize(None, &raw, DEFAULT_MAX_URL_LEN) {
                let twice = normalize(None, once.as_str(), DEFAULT_MAX_URL_LEN).unwrap();
                proptest::prop_assert_eq!(once, twice);
            }
        }
    }
}
