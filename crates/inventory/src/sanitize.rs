//! Repository URL normalization for equality matching.
//!
//! Webhook payloads and Build sources spell the same repository in different
//! ways (https vs ssh, trailing ".git"); equality is decided on host+path.

use url::Url;

/// Reduce a repository URL to hostname plus path, dropping the scheme,
/// credentials, port, query, fragment and a trailing ".git" suffix.
pub fn sanitize_url(raw: &str) -> Result<String, url::ParseError> {
    let parsed = Url::parse(raw)?;
    let host = parsed.host_str().ok_or(url::ParseError::EmptyHost)?;
    let path = parsed.path().trim_end_matches(".git");
    Ok(format!("{host}{path}"))
}

/// Compare two repository URLs: literal equality, or equality after
/// sanitizing both sides. A parse failure on either side is a mismatch.
pub fn urls_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (sanitize_url(a), sanitize_url(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
