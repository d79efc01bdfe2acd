//! Character encoding detection and decoding of uploads.
//!
//! Detection cascade, first match wins:
//!
//! 1. `charset=` parameter of the declared media type
//! 2. byte-order mark
//! 3. `<meta charset>` or `<meta http-equiv="Content-Type">` in the first
//!    1024 bytes
//! 4. UTF-8
//!
//! The rewritten document always declares UTF-8, so anything else is
//! transcoded here, before the rewriter sees it.

use encoding_rs::{Encoding, UTF_8};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::borrow::Cow;

/// Maximum bytes scanned for meta charset tags.
const META_SCAN_LIMIT: usize = 1024;

static RE_META_CHARSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta\s[^>]*?charset\s*=\s*["']?\s*([A-Za-z0-9_:.+-]+)"#).unwrap()
});

/// Resolve the encoding of `html`, see the module docs for the order.
///
/// Unknown labels are ignored and the cascade continues.
pub fn detect_encoding(media_type: Option<&str>, html: &[u8]) -> &'static Encoding {
    if let Some(enc) = media_type
        .and_then(charset_param)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
    {
        return enc;
    }

    if let Some((enc, _)) = Encoding::for_bom(html) {
        return enc;
    }

    if let Some(enc) = meta_charset(html).and_then(|label| Encoding::for_label(label.as_bytes())) {
        return enc;
    }

    UTF_8
}

/// Decode `html` to UTF-8 text using [`detect_encoding`].
///
/// Returns the text and the canonical name of the encoding that was used.
/// Malformed sequences are an error, not silently replaced.
pub fn decode_html<'a>(
    media_type: Option<&str>,
    html: &'a [u8],
) -> Result<(Cow<'a, str>, &'static str), DecodeError> {
    let encoding = detect_encoding(media_type, html);

    // Strip a BOM that matches the chosen encoding; a mismatched BOM is data.
    let body = match Encoding::for_bom(html) {
        Some((bom_enc, len)) if bom_enc == encoding => &html[len..],
        _ => html,
    };

    if encoding == UTF_8 {
        return std::str::from_utf8(body)
            .map(|s| (Cow::Borrowed(s), UTF_8.name()))
            .map_err(|e| DecodeError {
                charset: UTF_8.name(),
                detail: format!("invalid byte sequence at offset {}", e.valid_up_to()),
            });
    }

    encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .map(|text| (text, encoding.name()))
        .ok_or(DecodeError {
            charset: encoding.name(),
            detail: "invalid byte sequence".to_string(),
        })
}

/// A decoding failure; mapped to `InvalidInput::Undecodable` by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub charset: &'static str,
    pub detail: String,
}

fn charset_param(media_type: &str) -> Option<String> {
    let parsed: mime::Mime = media_type.trim().parse().ok()?;
    parsed
        .get_param(mime::CHARSET)
        .map(|v| v.as_str().to_string())
}

fn meta_charset(html: &[u8]) -> Option<String> {
    let scan = &html[..html.len().min(META_SCAN_LIMIT)];
    RE_META_CHARSET
        .captures(scan)
        .and_then(|caps| caps.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
}
