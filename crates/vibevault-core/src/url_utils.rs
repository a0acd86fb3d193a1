//! URL canonicalization used for link deduplication.

use url::Url;

use crate::error::{Error, Result};

/// Query parameters dropped during normalization. A trailing `*` matches by prefix.
pub const TRACKING_PARAMS: &[&str] = &[
    "utm_*", "fbclid", "gclid", "cid", "ref", "source", "campaign", "medium",
];

fn is_tracking_param(name: &str) -> bool {
    TRACKING_PARAMS.iter().any(|p| match p.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == *p,
    })
}

/// Validate a user-supplied link URL: parseable, http or https, with a host.
pub fn parse_link_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::InvalidInput(format!("invalid URL {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::InvalidInput(format!(
                "unsupported URL scheme: {other}"
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(Error::InvalidInput(format!("URL has no host: {raw:?}")));
    }
    Ok(url)
}

/// Canonical form of a URL: fragment and tracking query parameters removed.
///
/// Unparseable input is returned unchanged so it still participates in
/// exact-match deduplication.
pub fn normalize_url(raw: &str) -> String {
    let mut url = match Url::parse(raw.trim()) {
        Ok(url) => url,
        Err(_) => return raw.to_string(),
    };

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    url.to_string()
}

/// Host of a URL with a leading `www.` removed; empty when unparseable.
pub fn extract_domain(raw: &str) -> String {
    Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .map(|host| host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
        .unwrap_or_default()
}
