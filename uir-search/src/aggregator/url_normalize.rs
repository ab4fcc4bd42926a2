//! URL canonicalisation for result identity.
//!
//! Two providers often return the same document under slightly different
//! URLs. Canonicalising before comparison lets fusion treat them as one
//! result.

use url::Url;

/// Query parameters that never change which document a URL points at.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "msclkid", "mc_cid", "mc_eid", "ref", "ref_src", "si", "feature",
];

/// Prefix shared by all Urchin tracking parameters (`utm_source`, ...).
const UTM_PREFIX: &str = "utm_";

/// Canonicalise a URL for identity comparison.
///
/// 1. Surrounding whitespace is trimmed.
/// 2. Scheme and host are lowercased and default ports dropped (the `url`
///    crate does both while parsing).
/// 3. A leading `www.` is removed from the host.
/// 4. Tracking parameters are removed and the rest sorted by key, then value.
/// 5. The fragment and any trailing path slash (other than the root) are removed.
///
/// Input that does not parse as an absolute URL is returned trimmed but
/// otherwise unchanged, so opaque identifiers still compare exactly.
///
/// ```
/// use uir_search::aggregator::url_normalize::normalize_url;
///
/// let a = normalize_url("https://WWW.Example.com/docs/?b=2&a=1&utm_source=x#intro");
/// let b = normalize_url("https://example.com/docs?a=1&b=2");
/// assert_eq!(a, b);
/// ```
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut parsed) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    if parsed.cannot_be_a_base() {
        return trimmed.to_string();
    }

    parsed.set_fragment(None);

    if let Some(host) = parsed.host_str().and_then(|h| h.strip_prefix("www.")) {
        let host = host.to_string();
        if parsed.set_host(Some(&host)).is_err() {
            return trimmed.to_string();
        }
    }

    let mut params: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();
    if params.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(&params);
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }

    parsed.to_string()
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with(UTM_PREFIX) || TRACKING_PARAMS.contains(&key.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_case_and_www_ignored() {
        assert_eq!(
            normalize_url("HTTPS://WWW.Example.COM/Path"),
            "https://example.com/Path"
        );
    }

    #[test]
    fn path_case_preserved() {
        assert_ne!(
            normalize_url("https://example.com/A"),
            normalize_url("https://example.com/a")
        );
    }

    #[test]
    fn trailing_slashes_removed_but_root_kept() {
        assert_eq!(normalize_url("https://example.com/path//"), "https://example.com/path");
        assert_eq!(normalize_url("https://example.com/"), "https://example.com/");
    }

    #[test]
    fn default_ports_dropped() {
        assert_eq!(normalize_url("http://example.com:80/a"), "http://example.com/a");
        assert_eq!(normalize_url("https://example.com:443/a"), "https://example.com/a");
        assert_eq!(
            normalize_url("https://example.com:8443/a"),
            "https://example.com:8443/a"
        );
    }

    #[test]
    fn query_sorted_and_tracking_removed() {
        assert_eq!(
            normalize_url("https://example.com/s?z=1&utm_campaign=spring&a=2&MSCLKID=q"),
            "https://example.com/s?a=2&z=1"
        );
    }

    #[test]
    fn only_tracking_params_clears_query() {
        assert_eq!(
            normalize_url("https://example.com/p?utm_source=a&utm_anything=b&gclid=c"),
            "https://example.com/p"
        );
    }

    #[test]
    fn fragment_removed() {
        assert_eq!(normalize_url("https://example.com/p#top"), "https://example.com/p");
    }

    #[test]
    fn whitespace_trimmed() {
        assert_eq!(normalize_url("  https://example.com/p \n"), "https://example.com/p");
    }

    #[test]
    fn opaque_identifiers_unchanged() {
        assert_eq!(normalize_url("doc-42"), "doc-42");
        assert_eq!(normalize_url("mailto:someone@example.com"), "mailto:someone@example.com");
        assert_eq!(normalize_url(""), "");
    }
}
