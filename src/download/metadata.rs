//! URL validation and best-effort response metadata.
//!
//! File names come from `Content-Disposition` first and the URL path second;
//! MIME type and text encoding come from `Content-Type`.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, HeaderMap};
use tracing::debug;
use url::Url;

use super::constants::DEFAULT_TEXT_ENCODING;
use super::error::UrlParseError;

/// Permissive `filename=` / `filename*=` matcher for `Content-Disposition`.
///
/// Accepts quoted and unquoted values, and skips an RFC 5987
/// `charset'language'` prefix when present.
#[allow(clippy::expect_used)]
static FILENAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)filename\*?=["']?(?:.*')?([^"';]+)["']?"#)
        .expect("filename regex is valid") // Static pattern, safe to panic
});

/// Parses and validates a download URL.
///
/// # Errors
///
/// Returns [`UrlParseError`] when the input is not an absolute `http`/`https`
/// URL with a host.
pub fn resolve_url(raw: &str) -> Result<Url, UrlParseError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|e| UrlParseError::Malformed {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(UrlParseError::UnsupportedScheme {
            url: trimmed.to_string(),
            scheme: url.scheme().to_string(),
        });
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(UrlParseError::MissingHost {
            url: trimmed.to_string(),
        });
    }

    Ok(url)
}

/// Guesses the file name of a response.
///
/// Precedence: `Content-Disposition` filename parameter, then the last URL
/// path segment, both percent-decoded. Returns `None` when neither yields a
/// non-empty name.
#[must_use]
pub fn guess_file_name(url: &Url, headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_content_disposition)
        .or_else(|| file_name_from_url(url))
}

/// Extracts the filename parameter from a `Content-Disposition` value.
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    let captured = FILENAME_PATTERN.captures(header)?.get(1)?.as_str().trim();
    let decoded = percent_decode(captured);
    (!decoded.is_empty()).then_some(decoded)
}

fn file_name_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let decoded = percent_decode(last);
    (!decoded.is_empty()).then_some(decoded)
}

fn percent_decode(raw: &str) -> String {
    urlencoding::decode(raw).map_or_else(
        |e| {
            debug!(segment = %raw, error = %e, "percent-decoding failed, using raw value");
            raw.to_string()
        },
        std::borrow::Cow::into_owned,
    )
}

/// Returns the MIME type from `Content-Type`, without parameters.
#[must_use]
pub fn mime_type(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    let mime = content_type.split(';').next().unwrap_or("").trim();
    (!mime.is_empty()).then(|| mime.to_string())
}

/// Returns the declared `charset` of the response, or the UTF-8 default.
#[must_use]
pub fn text_encoding(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|content_type| {
            content_type.split(';').skip(1).find_map(|param| {
                let (key, value) = param.split_once('=')?;
                key.trim()
                    .eq_ignore_ascii_case("charset")
                    .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
            })
        })
        .filter(|charset| !charset.is_empty())
        .unwrap_or_else(|| DEFAULT_TEXT_ENCODING.to_string())
}
