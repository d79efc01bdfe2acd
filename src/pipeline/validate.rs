//! Input validation: the cheap checks that run before anything touches disk.

use crate::config::ConversionConfig;
use crate::error::InvalidInput;
use crate::pipeline::charset::decode_html;
use crate::request::{output_filename, ConversionRequest};

/// Extensions accepted on the upload name, compared case-insensitively.
const ACCEPTED_EXTENSIONS: &[&str] = &[".html", ".htm"];

/// A request that passed every check, with its content decoded to UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    /// Decoded document text.
    pub html: String,
    /// Canonical name of the encoding the bytes were decoded from.
    pub charset: &'static str,
    /// Download name for the converted document.
    pub output_filename: String,
    /// Size of the raw upload in bytes.
    pub input_bytes: usize,
}

/// Check `request` against the limits in `config`.
///
/// Checks run cheapest first: size, emptiness, extension, media type, decode.
pub fn validate(
    request: &ConversionRequest,
    config: &ConversionConfig,
) -> Result<ValidatedRequest, InvalidInput> {
    let size = request.content.len();
    if size > config.max_input_bytes {
        return Err(InvalidInput::TooLarge {
            size,
            limit: config.max_input_bytes,
        });
    }

    if request.content.iter().all(u8::is_ascii_whitespace) {
        return Err(InvalidInput::EmptyContent);
    }

    let lower = request.filename.to_ascii_lowercase();
    if !ACCEPTED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return Err(InvalidInput::UnsupportedExtension {
            filename: request.filename.clone(),
        });
    }

    if !media_type_accepted(&request.media_type, &config.accepted_media_types) {
        return Err(InvalidInput::UnsupportedMediaType {
            media_type: request.media_type.clone(),
        });
    }

    let (text, charset) = decode_html(Some(&request.media_type), &request.content).map_err(
        |e| InvalidInput::Undecodable {
            charset: e.charset.to_string(),
            detail: e.detail,
        },
    )?;

    // A BOM-only or whitespace-after-decoding body is still empty.
    if text.trim().is_empty() {
        return Err(InvalidInput::EmptyContent);
    }

    Ok(ValidatedRequest {
        html: text.into_owned(),
        charset,
        output_filename: output_filename(&request.filename),
        input_bytes: size,
    })
}

/// Compare by essence (`type/subtype`), ignoring parameters and case.
fn media_type_accepted(declared: &str, accepted: &[String]) -> bool {
    let Ok(parsed) = declared.trim().parse::<mime::Mime>() else {
        return false;
    };
    let essence = parsed.essence_str();
    accepted.iter().any(|a| a.eq_ignore_ascii_case(essence))
}
