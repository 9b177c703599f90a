use url::Url;

/// Turn a raw href/src value into an absolute URL.
///
/// Absolute URLs pass through untouched, protocol-relative ones inherit the
/// scheme of `base_url`, anything else is resolved against `base_url`.
pub fn normalize_url(base_url: &str, raw: &str) -> Option<String> {
    let href = raw.trim();
    if href.is_empty() {
        return None;
    }

    if let Some(rest) = href.strip_prefix("//") {
        let scheme = Url::parse(base_url)
            .map(|u| u.scheme().to_string())
            .unwrap_or_else(|_| "https".to_string());
        return Some(format!("{scheme}://{rest}"));
    }

    if Url::parse(href).is_ok() {
        return Some(href.to_string());
    }

    let base = Url::parse(base_url).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

/// `scheme://host[:port]` of a page URL, for Referer/Origin headers.
pub fn page_origin(page_url: &str) -> Option<String> {
    let url = Url::parse(page_url).ok()?;
    let origin = url.origin();
    if origin.is_tuple() {
        Some(origin.ascii_serialization())
    } else {
        None
    }
}

/// Trailing path segment of a URL, used as a filename fallback.
pub fn url_tail(url: &str) -> String {
    url.rsplit('/').next().unwrap_or(url).to_string()
}
