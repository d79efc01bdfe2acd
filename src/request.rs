//! The inbound conversion request and output naming.

use crate::error::Html2DocxError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::Path;

/// One upload: raw bytes plus what the client declared about them.
///
/// Owned by the orchestrator for the lifetime of a single conversion.
#[derive(Clone)]
pub struct ConversionRequest {
    pub content: Vec<u8>,
    pub filename: String,
    pub media_type: String,
}

impl fmt::Debug for ConversionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionRequest")
            .field("content", &format_args!("<{} bytes>", self.content.len()))
            .field("filename", &self.filename)
            .field("media_type", &self.media_type)
            .finish()
    }
}

impl ConversionRequest {
    pub fn new(
        content: impl Into<Vec<u8>>,
        filename: impl Into<String>,
        media_type: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            filename: filename.into(),
            media_type: media_type.into(),
        }
    }

    /// Read a local file and infer its media type from the extension.
    ///
    /// Unknown extensions get `application/octet-stream`, which the validator
    /// then rejects with a proper message.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, Html2DocxError> {
        let path = path.as_ref();
        let content = tokio::fs::read(path).await.map_err(|e| {
            Html2DocxError::internal(format!("cannot read {}: {e}", path.display()))
        })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let media_type = media_type_for(&filename).to_string();
        Ok(Self {
            content,
            filename,
            media_type,
        })
    }
}

/// Media type implied by a file name's extension.
pub fn media_type_for(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".html") || lower.ends_with(".htm") {
        "text/html"
    } else if lower.ends_with(".xhtml") {
        "application/xhtml+xml"
    } else {
        "application/octet-stream"
    }
}

static RE_UNSAFE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.-]+").unwrap());

/// Derive the download name for the converted document.
///
/// The extension is dropped, runs of characters outside `[A-Za-z0-9_.-]` are
/// collapsed to `_`, leading/trailing `.`/`_` are trimmed, and `.docx` is
/// appended. An empty result becomes `document.docx`.
pub fn output_filename(upload_name: &str) -> String {
    let base = upload_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(upload_name);
    let stem = match base.rfind('.') {
        Some(idx) => &base[..idx],
        None => base,
    };
    let sanitized = RE_UNSAFE_RUN.replace_all(stem, "_");
    let trimmed = sanitized.trim_matches(|c: char| c == '.' || c == '_');
    if trimmed.is_empty() {
        "document.docx".to_string()
    } else {
        format!("{trimmed}.docx")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_name_replaces_extension() {
        assert_eq!(output_filename("report.html"), "report.docx");
        assert_eq!(output_filename("Report.HTM"), "Report.docx");
    }

    #[test]
    fn output_name_is_sanitized() {
        assert_eq!(output_filename("my report (v2).html"), "my_report_v2.docx");
        assert_eq!(output_filename("../../etc/passwd.html"), "passwd.docx");
        assert_eq!(output_filename("C:\\docs\\ujian akhir.html"), "ujian_akhir.docx");
    }

    #[test]
    fn output_name_falls_back_to_document() {
        assert_eq!(output_filename(""), "document.docx");
        assert_eq!(output_filename("???.html"), "document.docx");
        assert_eq!(output_filename(".html"), "document.docx");
    }

    #[test]
    fn media_type_from_extension() {
        assert_eq!(media_type_for("a.HTML"), "text/html");
        assert_eq!(media_type_for("a.htm"), "text/html");
        assert_eq!(media_type_for("a.xhtml"), "application/xhtml+xml");
        assert_eq!(media_type_for("a.docx"), "application/octet-stream");
    }

    #[test]
    fn debug_does_not_dump_content() {
        let req = ConversionRequest::new(vec![b'x'; 4096], "a.html", "text/html");
        let shown = format!("{req:?}");
        assert!(shown.contains("<4096 bytes>"));
        assert!(!shown.contains("xxxx"));
    }
}
