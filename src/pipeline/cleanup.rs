//! Optional clean-up of uploads before math rewriting.
//!
//! Rich-text editors and Word's "save as web page" export produce HTML that
//! pandoc reads poorly. Every pass here changes bytes outside math markers,
//! so each one is opt-in through [`RewriteOptions`]:
//!
//! | Switch                  | Pass                                                  |
//! |-------------------------|-------------------------------------------------------|
//! | `extract_embedded_html` | a document pasted as text (`&lt;html&gt;…&lt;/html&gt;`) replaces the upload, decoded; Word clean-up and tag promotion follow |
//! | `simplify_word_export`  | drop `Mso*` classes, unmarked `<span>` wrappers, `<p>` around blocks and empty paragraphs |
//! | `promote_escaped_tags`  | `&lt;p&gt;`-style escaped tags of common elements become markup |
//! | `strip_boilerplate`     | remove `<style>` blocks, doctypes that do not open the document, and their escaped forms |
//!
//! Passes run in the order above. Word clean-up only runs on documents that
//! look like Word output (they mention `Mso` or `mso-`).

use crate::pipeline::rewrite::{marker_kind, RewriteOptions};
use crate::pipeline::scan::{decode_text, scan, StartTag, TokenKind};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use std::borrow::Cow;
use tracing::debug;

/// Block elements a Word export wraps in stray paragraphs.
const BLOCKS: &str = "html|head|body|div|section|article|aside|nav|main|figure|figcaption|h[1-6]|ul|ol|li|table|thead|tbody|tfoot|tr|td|th|blockquote|pre";

/// Elements whose escaped tags are turned back into markup.
const PROMOTABLE_TAGS: &[&str] = &[
    "a", "abbr", "article", "aside", "b", "blockquote", "body", "br", "button", "caption",
    "code", "col", "colgroup", "dd", "details", "div", "dl", "dt", "em", "figcaption", "figure",
    "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "head", "header", "hr", "html", "img",
    "input", "label", "legend", "li", "link", "main", "math", "meta", "mfrac", "mi", "mn", "mo",
    "mrow", "ms", "mspace", "msqrt", "msub", "msubsup", "msup", "mtext", "nav", "ol", "option",
    "p", "pre", "section", "select", "small", "span", "strong", "sub", "summary", "sup", "table",
    "tbody", "td", "textarea", "tfoot", "th", "thead", "title", "tr", "u", "ul",
];

static RE_EMBEDDED_HTML: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)&lt;html.*?&lt;/html&gt;").unwrap());

static RE_ESCAPED_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)&lt;/?\s*([A-Za-z][A-Za-z0-9:-]*)[^<>]*?&gt;").unwrap()
});

static RE_ESCAPED_DOCTYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)&lt;!DOCTYPE[^&]*&gt;").unwrap());

static RE_ESCAPED_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)&lt;style[^&]*&gt;.*?&lt;/style&gt;").unwrap());

static RE_MSO_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\sclass=(?:"Mso[^"]*"|'Mso[^']*'|Mso[^\s>]*)"#).unwrap());

static RE_P_AROUND_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?is)<p>\s*(<(?:{BLOCKS})\b[^>]*>.*?</(?:{BLOCKS})>)\s*</p>"
    ))
    .unwrap()
});

static RE_P_CLOSE_AFTER_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)(</?(?:{BLOCKS}|meta|title|link)\b[^>]*>)\s*</p>")).unwrap()
});

static RE_P_OPEN_BEFORE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)<p>\s*(<(?:{BLOCKS}|meta|title)\b[^>]*>)")).unwrap()
});

static RE_EMPTY_P: Lazy<Regex> = Lazy::new(|| Regex::new(r"<p>\s*</p>").unwrap());

/// What the clean-up passes changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub embedded_extracted: bool,
    pub word_simplified: bool,
    pub promoted_tags: usize,
    pub boilerplate_removed: usize,
}

impl CleanupReport {
    pub fn changed(&self) -> bool {
        self.embedded_extracted
            || self.word_simplified
            || self.promoted_tags > 0
            || self.boilerplate_removed > 0
    }
}

/// Run the passes enabled in `options`. Borrows `html` when none apply.
pub fn clean<'a>(html: &'a str, options: &RewriteOptions) -> (Cow<'a, str>, CleanupReport) {
    let mut report = CleanupReport::default();
    let mut text = Cow::Borrowed(html);

    if options.extract_embedded_html {
        if let Some(doc) = extract_embedded_html(&text) {
            text = Cow::Owned(doc);
            report.embedded_extracted = true;
        }
    }

    if options.simplify_word_export || report.embedded_extracted {
        if let Some(simplified) = simplify_word_export(&text, options) {
            text = Cow::Owned(simplified);
            report.word_simplified = true;
        }
    }

    if options.promote_escaped_tags || report.embedded_extracted {
        let (promoted, count) = promote_escaped_tags(&text, options);
        if count > 0 {
            text = Cow::Owned(promoted);
            report.promoted_tags = count;
        }
    }

    if options.strip_boilerplate {
        let (stripped, count) = strip_boilerplate(&text);
        if count > 0 {
            text = Cow::Owned(stripped);
            report.boilerplate_removed = count;
        }
    }

    if report.changed() {
        debug!(?report, "Upload cleaned before rewriting");
    }
    (text, report)
}

/// The first escaped `&lt;html … &lt;/html&gt;` document, decoded. Real tags
/// inside the region are kept, so Word's paragraph wrappers survive until
/// [`simplify_word_export`] removes them.
pub fn extract_embedded_html(html: &str) -> Option<String> {
    let region = RE_EMBEDDED_HTML.find(html)?.as_str();
    let mut out = String::with_capacity(region.len());
    for tok in scan(region) {
        let part = &region[tok.span.clone()];
        match tok.kind {
            TokenKind::Text => out.push_str(&decode_text(part)),
            _ => out.push_str(part),
        }
    }
    Some(out)
}

/// Collapse Word export wrappers. `None` when `html` is not Word output.
///
/// Spans carrying a math marker class are kept with their end tags.
pub fn simplify_word_export(html: &str, options: &RewriteOptions) -> Option<String> {
    if !html.contains("Mso") && !html.contains("mso-") {
        return None;
    }

    let mut out = String::with_capacity(html.len());
    // One entry per open span: was its start tag kept?
    let mut spans: Vec<bool> = Vec::new();
    for tok in scan(html) {
        let part = &html[tok.span.clone()];
        match &tok.kind {
            TokenKind::StartTag(tag) if tag.name == "span" => {
                let marked = marker_kind(tag, options).is_some();
                if !tag.self_closing {
                    spans.push(marked);
                }
                if marked {
                    out.push_str(part);
                }
            }
            TokenKind::EndTag(name) if name == "span" => {
                if spans.pop().unwrap_or(false) {
                    out.push_str(part);
                }
            }
            TokenKind::StartTag(_) => out.push_str(&RE_MSO_CLASS.replace_all(part, "")),
            _ => out.push_str(part),
        }
    }

    let mut text = out;
    loop {
        let next = RE_P_AROUND_BLOCK.replace_all(&text, "${1}").into_owned();
        if next == text {
            break;
        }
        text = next;
    }
    let text = RE_P_CLOSE_AFTER_BLOCK.replace_all(&text, "${1}");
    let text = RE_EMPTY_P.replace_all(&text, "");
    let text = RE_P_OPEN_BEFORE_BLOCK.replace_all(&text, "${1}");
    Some(text.replace("<p><p", "<p").replace("</p></p>", "</p>"))
}

/// Turn escaped tags of [`PROMOTABLE_TAGS`] in text back into markup.
/// Text inside math markers is left alone, since `&lt;` there is TeX.
/// Returns the new text and how many tags were promoted.
pub fn promote_escaped_tags(html: &str, options: &RewriteOptions) -> (String, usize) {
    if !html.contains("&lt;") || !html.contains("&gt;") {
        return (html.to_string(), 0);
    }

    let mut count = 0;
    let mut out = String::with_capacity(html.len());
    // Name and nesting depth of the marker element being copied.
    let mut marker: Option<(String, usize)> = None;
    let opens = |tag: &StartTag| !tag.self_closing && !tag.is_void();
    for tok in scan(html) {
        let part = &html[tok.span.clone()];
        match (&tok.kind, marker.as_mut()) {
            (TokenKind::StartTag(tag), Some((name, depth))) if *name == tag.name && opens(tag) => {
                *depth += 1;
            }
            (TokenKind::EndTag(end), Some((name, depth))) if end == name => *depth -= 1,
            (TokenKind::StartTag(tag), None) if opens(tag) && marker_kind(tag, options).is_some() => {
                marker = Some((tag.name.clone(), 1));
            }
            _ => {}
        }
        if matches!(marker, Some((_, 0))) {
            marker = None;
        }
        if tok.kind != TokenKind::Text || marker.is_some() {
            out.push_str(part);
            continue;
        }
        let promoted = RE_ESCAPED_TAG.replace_all(part, |caps: &Captures| {
            let whole = &caps[0];
            if !PROMOTABLE_TAGS.contains(&caps[1].to_ascii_lowercase().as_str()) {
                return whole.to_string();
            }
            count += 1;
            decode_text(whole).trim().to_string()
        });
        out.push_str(&promoted);
    }
    (out, count)
}

/// Remove `<style>` blocks and stray doctypes, escaped or not. A doctype
/// that opens the document is kept. Returns the new text and how many
/// constructs were removed.
pub fn strip_boilerplate(html: &str) -> (String, usize) {
    let mut count = 0;
    let mut out = String::with_capacity(html.len());
    let mut in_style = false;
    let mut seen_content = false;

    for tok in scan(html) {
        let part = &html[tok.span.clone()];
        match &tok.kind {
            TokenKind::StartTag(tag) if tag.name == "style" => {
                in_style = true;
                count += 1;
            }
            TokenKind::EndTag(name) if name == "style" && in_style => in_style = false,
            _ if in_style => {}
            TokenKind::Doctype if seen_content => count += 1,
            TokenKind::Text if part.trim().is_empty() => out.push_str(part),
            _ => {
                seen_content = true;
                out.push_str(part);
            }
        }
    }

    let escaped =
        RE_ESCAPED_DOCTYPE.find_iter(&out).count() + RE_ESCAPED_STYLE.find_iter(&out).count();
    if escaped > 0 {
        count += escaped;
        let without_doctype = RE_ESCAPED_DOCTYPE.replace_all(&out, "");
        out = RE_ESCAPED_STYLE.replace_all(&without_doctype, "").into_owned();
    }
    (out, count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_on() -> RewriteOptions {
        RewriteOptions {
            extract_embedded_html: true,
            simplify_word_export: true,
            promote_escaped_tags: true,
            strip_boilerplate: true,
            ..RewriteOptions::default()
        }
    }

    #[test]
    fn defaults_borrow_the_input() {
        let src = "<p class=MsoNormal>&lt;b&gt;x&lt;/b&gt;</p><style>p{}</style>";
        let (text, report) = clean(src, &RewriteOptions::default());
        assert!(matches!(text, Cow::Borrowed(_)));
        assert!(!report.changed());
    }

    #[test]
    fn embedded_document_is_extracted_and_promoted() {
        let src = concat!(
            "<html><body><p class=MsoNormal>",
            "&lt;html&gt;&lt;body&gt;&lt;p&gt;<span style='mso-bidi-font'>Area: </span>",
            "<span class=\"math-tex\">\\pi r^2</span>",
            "&lt;/p&gt;&lt;/body&gt;&lt;/html&gt;</p></body></html>"
        );
        let (text, report) = clean(src, &RewriteOptions {
            extract_embedded_html: true,
            ..RewriteOptions::default()
        });
        assert!(report.embedded_extracted);
        assert!(report.word_simplified);
        assert!(text.starts_with("<html><body><p>Area: "));
        assert!(text.contains(r#"<span class="math-tex">\pi r^2</span>"#));
        assert!(text.ends_with("</p></body></html>"));
        assert!(!text.contains("&lt;"));
    }

    #[test]
    fn word_spans_and_classes_are_dropped() {
        let src = r#"<p class=MsoNormal><span style="mso-bidi">Luas <span class="math-tex">x</span></span></p>"#;
        let out = simplify_word_export(src, &RewriteOptions::default()).unwrap();
        assert_eq!(out, r#"<p>Luas <span class="math-tex">x</span></p>"#);
    }

    #[test]
    fn word_paragraph_wrappers_are_collapsed() {
        let src = "<p><div class=MsoBody><h1>T</h1></div></p><p> </p><p><table><tr><td>1</td></tr></table></p>";
        let out = simplify_word_export(src, &RewriteOptions::default()).unwrap();
        assert_eq!(out, "<div><h1>T</h1></div><table><tr><td>1</td></tr></table>");
    }

    #[test]
    fn non_word_html_is_not_simplified() {
        assert!(simplify_word_export("<p><span>x</span></p>", &RewriteOptions::default()).is_none());
    }

    #[test]
    fn only_known_escaped_tags_are_promoted() {
        let (out, count) = promote_escaped_tags(
            "<p>&lt;b&gt;bold&lt;/b&gt; and &lt;foo&gt; &amp;lt;i&amp;gt;</p>",
            &RewriteOptions::default(),
        );
        assert_eq!(out, "<p><b>bold</b> and &lt;foo&gt; &amp;lt;i&amp;gt;</p>");
        assert_eq!(count, 2);
    }

    #[test]
    fn escaped_tags_in_attributes_stay_escaped() {
        let src = r#"<a title="&lt;b&gt;">x</a>"#;
        assert_eq!(
            promote_escaped_tags(src, &RewriteOptions::default()),
            (src.to_string(), 0)
        );
    }

    #[test]
    fn escaped_comparisons_in_math_are_not_promoted() {
        let src = r#"<p>&lt;b&gt;x&lt;/b&gt;<span class="math-tex">a &lt; b &gt; c<span> &lt;i&gt;</span></span></p>"#;
        let (out, count) = promote_escaped_tags(src, &RewriteOptions::default());
        assert_eq!(
            out,
            r#"<p><b>x</b><span class="math-tex">a &lt; b &gt; c<span> &lt;i&gt;</span></span></p>"#
        );
        assert_eq!(count, 2);
    }

    #[test]
    fn word_class_attribute_is_removed_whole() {
        let src = r#"<p class="MsoNormal first" id=a><span class='MsoX'>y</span></p>"#;
        let out = simplify_word_export(src, &RewriteOptions::default()).unwrap();
        assert_eq!(out, "<p id=a>y</p>");
    }

    #[test]
    fn boilerplate_is_stripped_but_leading_doctype_kept() {
        let src = "<!DOCTYPE html>\n<html><head><style>.a{color:red}</style></head><body><!DOCTYPE x>&lt;!DOCTYPE html&gt;&lt;style&gt;p{}&lt;/style&gt;<p>x</p></body></html>";
        let (out, count) = strip_boilerplate(src);
        assert_eq!(out, "<!DOCTYPE html>\n<html><head></head><body><p>x</p></body></html>");
        assert_eq!(count, 4);
    }

    #[test]
    fn passes_leave_math_markers_intact() {
        let src = r#"<p class="MsoNormal"><span class="math-tex">a &lt; b</span></p>"#;
        let (text, _) = clean(src, &all_on());
        assert_eq!(text, r#"<p><span class="math-tex">a &lt; b</span></p>"#);
    }
}
