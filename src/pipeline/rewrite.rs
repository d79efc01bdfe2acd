//! Math span rewriting.
//!
//! Rich-text editors store equations as marker elements, e.g.
//! `<span class="math-tex">x^2</span>`. pandoc only recognises TeX math by
//! its delimiters, so each marker element is replaced with its TeX source in
//! `\( … \)` (inline) or `\[ … \]` (display) and pandoc's
//! `tex_math_single_backslash` extension turns it into a native equation.
//!
//! The rewrite splices into the original source using the byte ranges from
//! [`crate::pipeline::scan`]: markup outside marker elements is copied
//! byte-for-byte, never re-serialised. Only the inner markup of a marker is
//! parsed (with html5ever) to obtain its text content.
//!
//! Opt-in [`cleanup`](crate::pipeline::cleanup) passes run first; the
//! splice then works on their output.
//!
//! Malformed markers degrade per span. A nested, unclosed, self-closing or
//! empty marker is copied through untouched and listed in
//! [`RewriteReport::skipped`]; the rest of the document is still rewritten.

use crate::pipeline::bare_tex::wrap_bare_tex;
use crate::pipeline::cleanup::{clean, CleanupReport};
use crate::pipeline::scan::{scan, StartTag, Token, TokenKind};
use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use serde::Serialize;
use tracing::{debug, warn};

/// Prefix of the shell added around fragments.
const SHELL_OPEN: &str =
    "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n</head>\n<body>\n";
const SHELL_CLOSE: &str = "\n</body>\n</html>\n";

/// Elements whose text is never scanned for bare TeX.
const VERBATIM_ELEMENTS: &[&str] = &["pre", "code", "kbd", "samp"];

/// Elements whose presence marks the source as a full document.
const DOCUMENT_ELEMENTS: &[&str] = &["html", "head", "body"];

/// Which marker conventions to rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOptions {
    /// Class token of inline math containers.
    pub inline_class: String,
    /// Class token of display math containers; `None` disables them.
    pub display_class: Option<String>,
    /// Also wrap undelimited TeX found in ordinary text.
    pub detect_bare_tex: bool,
    /// Replace the upload with an HTML document pasted into it as text.
    pub extract_embedded_html: bool,
    /// Strip Word export wrappers and `Mso*` classes.
    pub simplify_word_export: bool,
    /// Turn escaped tags such as `&lt;p&gt;` into markup.
    pub promote_escaped_tags: bool,
    /// Remove `<style>` blocks and stray doctypes.
    pub strip_boilerplate: bool,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            inline_class: crate::config::DEFAULT_INLINE_MATH_CLASS.to_string(),
            display_class: Some(crate::config::DEFAULT_DISPLAY_MATH_CLASS.to_string()),
            detect_bare_tex: false,
            extract_embedded_html: false,
            simplify_word_export: false,
            promote_escaped_tags: false,
            strip_boilerplate: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MathKind {
    Inline,
    Display,
}

/// Why a marker element was left as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another marker sits inside this one.
    Nested,
    /// No matching end tag before the end of input.
    Unclosed,
    /// `<span class="math-tex"/>` or a void element; there is no content.
    SelfClosing,
    /// The content is empty or whitespace only.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SkippedSpan {
    /// Byte offset of the marker's start tag, after clean-up passes.
    pub offset: usize,
    pub kind: MathKind,
    pub reason: SkipReason,
}

/// What the rewriter did to one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewriteReport {
    pub inline_rewrites: usize,
    pub display_rewrites: usize,
    pub bare_tex_wraps: usize,
    pub skipped: Vec<SkippedSpan>,
    pub shell_added: bool,
    pub cleanup: CleanupReport,
}

impl RewriteReport {
    pub fn rewrites(&self) -> usize {
        self.inline_rewrites + self.display_rewrites + self.bare_tex_wraps
    }
}

/// The engine-ready document. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedDocument {
    pub html: String,
    pub report: RewriteReport,
}

/// Rewrite every math marker in `html`. Never fails.
///
/// Fragments are wrapped in a minimal HTML5 shell that declares UTF-8; a
/// source with a doctype or an `html`/`head`/`body` start tag is kept as
/// is. Running this on its own output returns that output unchanged.
pub fn rewrite(html: &str, options: &RewriteOptions) -> NormalizedDocument {
    let (cleaned, cleanup) = clean(html, options);
    let html = cleaned.as_ref();
    let tokens = scan(html);
    let mut out = String::with_capacity(html.len() + SHELL_OPEN.len() + SHELL_CLOSE.len());
    let mut report = RewriteReport {
        cleanup,
        ..RewriteReport::default()
    };
    let mut verbatim_depth = 0usize;
    let mut i = 0;

    while i < tokens.len() {
        let tok = &tokens[i];
        match &tok.kind {
            TokenKind::StartTag(tag) => {
                if let Some(kind) = marker_kind(tag, options) {
                    match replace_marker(html, &tokens, i, tag, options) {
                        Ok((replacement, next)) => {
                            out.push_str(&replacement);
                            match kind {
                                MathKind::Inline => report.inline_rewrites += 1,
                                MathKind::Display => report.display_rewrites += 1,
                            }
                            i = next;
                        }
                        Err((reason, next)) => {
                            warn!(
                                offset = tok.span.start,
                                ?kind,
                                ?reason,
                                "Leaving math marker unchanged"
                            );
                            report.skipped.push(SkippedSpan {
                                offset: tok.span.start,
                                kind,
                                reason,
                            });
                            out.push_str(&html[tok.span.start..tokens[next - 1].span.end]);
                            i = next;
                        }
                    }
                    continue;
                }
                if !tag.self_closing && VERBATIM_ELEMENTS.contains(&tag.name.as_str()) {
                    verbatim_depth += 1;
                }
            }
            TokenKind::EndTag(name) if VERBATIM_ELEMENTS.contains(&name.as_str()) => {
                verbatim_depth = verbatim_depth.saturating_sub(1);
            }
            TokenKind::Text if options.detect_bare_tex && verbatim_depth == 0 => {
                if let Some(wrapped) = wrap_bare_tex(&html[tok.span.clone()]) {
                    out.push_str(&wrapped);
                    report.bare_tex_wraps += 1;
                    i += 1;
                    continue;
                }
            }
            _ => {}
        }
        out.push_str(&html[tok.span.clone()]);
        i += 1;
    }

    if !is_full_document(&tokens) {
        out = wrap_in_shell(&out);
        report.shell_added = true;
    }

    debug!(
        inline = report.inline_rewrites,
        display = report.display_rewrites,
        bare_tex = report.bare_tex_wraps,
        skipped = report.skipped.len(),
        shell = report.shell_added,
        "Math spans rewritten"
    );

    NormalizedDocument { html: out, report }
}

/// Surround a fragment with the minimal UTF-8 HTML5 shell.
pub fn wrap_in_shell(body: &str) -> String {
    let mut s = String::with_capacity(body.len() + SHELL_OPEN.len() + SHELL_CLOSE.len());
    s.push_str(SHELL_OPEN);
    s.push_str(body);
    s.push_str(SHELL_CLOSE);
    s
}

fn is_full_document(tokens: &[Token]) -> bool {
    tokens.iter().any(|t| match &t.kind {
        TokenKind::Doctype => true,
        TokenKind::StartTag(tag) => DOCUMENT_ELEMENTS.contains(&tag.name.as_str()),
        _ => false,
    })
}

/// Display wins when an element carries both class tokens.
pub(crate) fn marker_kind(tag: &StartTag, options: &RewriteOptions) -> Option<MathKind> {
    if let Some(ref display) = options.display_class {
        if tag.has_class(display) {
            return Some(MathKind::Display);
        }
    }
    tag.has_class(&options.inline_class).then_some(MathKind::Inline)
}

/// Build the replacement for the marker whose start tag is `tokens[start]`.
///
/// Both arms return the index of the first token after the region they
/// consumed. On `Err` that region is copied through unchanged.
fn replace_marker(
    src: &str,
    tokens: &[Token],
    start: usize,
    tag: &StartTag,
    options: &RewriteOptions,
) -> Result<(String, usize), (SkipReason, usize)> {
    if tag.self_closing || tag.is_void() {
        return Err((SkipReason::SelfClosing, start + 1));
    }
    let kind = marker_kind(tag, options).unwrap_or(MathKind::Inline);

    let mut depth = 0usize;
    let mut nested = false;
    for (j, tok) in tokens.iter().enumerate().skip(start + 1) {
        match &tok.kind {
            TokenKind::StartTag(inner) => {
                if marker_kind(inner, options).is_some() {
                    nested = true;
                }
                if inner.name == tag.name && !inner.self_closing {
                    depth += 1;
                }
            }
            TokenKind::EndTag(name) if *name == tag.name => {
                if depth > 0 {
                    depth -= 1;
                    continue;
                }
                if nested {
                    return Err((SkipReason::Nested, j + 1));
                }
                let inner = &src[tokens[start].span.end..tok.span.start];
                let text = text_content(inner);
                let tex = text.trim();
                if tex.is_empty() {
                    return Err((SkipReason::Empty, j + 1));
                }
                return Ok((delimit(tex, kind), j + 1));
            }
            _ => {}
        }
    }
    Err((SkipReason::Unclosed, start + 1))
}

fn delimit(tex: &str, kind: MathKind) -> String {
    let escaped = escape_text(tex);
    if has_leading_delimiter(tex) {
        return escaped;
    }
    match kind {
        MathKind::Inline => format!("\\( {escaped} \\)"),
        MathKind::Display => format!("\\[ {escaped} \\]"),
    }
}

fn has_leading_delimiter(tex: &str) -> bool {
    tex.starts_with("\\(") || tex.starts_with("\\[") || tex.starts_with('$')
}

/// Text content of an HTML fragment, entities decoded and tags dropped.
/// A `<br>` counts as a space.
fn text_content(fragment: &str) -> String {
    let dom = parse_document(RcDom::default(), Default::default()).one(fragment);
    let mut out = String::with_capacity(fragment.len());
    collect_text(&dom.document, &mut out);
    out
}

fn collect_text(node: &Handle, out: &mut String) {
    match node.data {
        NodeData::Text { ref contents } => out.push_str(&contents.borrow()),
        NodeData::Element { ref name, .. } if &*name.local == "br" => out.push(' '),
        NodeData::Element { ref name, .. }
            if matches!(&*name.local, "script" | "style" | "template") =>
        {
            return;
        }
        _ => {}
    }
    for child in node.children.borrow().iter() {
        collect_text(child, out);
    }
}

fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> RewriteOptions {
        RewriteOptions::default()
    }

    fn body(doc: &NormalizedDocument) -> &str {
        doc.html
            .strip_prefix(SHELL_OPEN)
            .and_then(|s| s.strip_suffix(SHELL_CLOSE))
            .unwrap_or(&doc.html)
    }

    #[test]
    fn no_markers_only_adds_shell() {
        let src = "<p>Plain <b>text</b> &amp; a <a href='x'>link</a></p>";
        let doc = rewrite(src, &opts());
        assert_eq!(doc.html, wrap_in_shell(src));
        assert!(doc.report.shell_added);
        assert_eq!(doc.report.rewrites(), 0);
    }

    #[test]
    fn inline_marker_becomes_delimited_tex() {
        let doc = rewrite(
            r#"<p>Circle: <span class="math-tex">x^2+y^2=r^2</span>.</p>"#,
            &opts(),
        );
        assert_eq!(body(&doc), r"<p>Circle: \( x^2+y^2=r^2 \).</p>");
        assert_eq!(doc.report.inline_rewrites, 1);
        assert!(!doc.html.contains("math-tex"));
    }

    #[test]
    fn display_marker_uses_brackets() {
        let doc = rewrite(
            r#"<div class="math-display">\int_0^1 x\,dx</div>"#,
            &opts(),
        );
        assert_eq!(body(&doc), r"\[ \int_0^1 x\,dx \]");
        assert_eq!(doc.report.display_rewrites, 1);
    }

    #[test]
    fn entities_are_decoded_then_reescaped() {
        let doc = rewrite(
            r#"<span class="math-tex">a &lt; b &amp;&amp; c&nbsp;&gt; d</span>"#,
            &opts(),
        );
        assert_eq!(body(&doc), "\\( a &lt; b &amp;&amp; c\u{a0}&gt; d \\)");
    }

    #[test]
    fn nested_formatting_is_flattened() {
        let doc = rewrite(
            r#"<span class="math-tex">x<sup>2</sup> <em>+</em> 1</span>"#,
            &opts(),
        );
        assert_eq!(body(&doc), r"\( x2 + 1 \)");
    }

    #[test]
    fn existing_delimiters_are_not_doubled() {
        let doc = rewrite(
            r#"<span class="math-tex">\(\frac{1}{2}\)</span> <span class="math-tex">$a+b$</span>"#,
            &opts(),
        );
        assert_eq!(body(&doc), r"\(\frac{1}{2}\) $a+b$");
    }

    #[test]
    fn class_token_must_match_exactly() {
        let src = r#"<span class="math-texture">x</span><span class="big math-tex">y</span>"#;
        let doc = rewrite(src, &opts());
        assert_eq!(body(&doc), r#"<span class="math-texture">x</span>\( y \)"#);
    }

    #[test]
    fn marker_on_other_elements_and_same_name_nesting() {
        let doc = rewrite(
            r#"<p class="math-tex">a<p>b</p>c</p><span class=math-tex><span>x</span></span>"#,
            &opts(),
        );
        assert_eq!(body(&doc), r"\( abc \)\( x \)");
    }

    #[test]
    fn nested_marker_is_left_untouched() {
        let src = r#"<span class="math-tex">a <span class="math-tex">b</span></span><span class="math-tex">c</span>"#;
        let doc = rewrite(src, &opts());
        assert_eq!(
            body(&doc),
            r#"<span class="math-tex">a <span class="math-tex">b</span></span>\( c \)"#
        );
        assert_eq!(doc.report.skipped.len(), 1);
        assert_eq!(doc.report.skipped[0].reason, SkipReason::Nested);
        assert_eq!(doc.report.skipped[0].offset, 0);
    }

    #[test]
    fn unclosed_marker_is_left_untouched() {
        let src = r#"<p><span class="math-tex">x^2</p>"#;
        let doc = rewrite(src, &opts());
        assert_eq!(body(&doc), src);
        assert_eq!(doc.report.skipped[0].reason, SkipReason::Unclosed);
    }

    #[test]
    fn self_closing_and_empty_markers_are_skipped() {
        let src = r#"<span class="math-tex"/><img class="math-tex" src="a.png"><span class="math-tex">  </span>"#;
        let doc = rewrite(src, &opts());
        assert_eq!(body(&doc), src);
        let reasons: Vec<_> = doc.report.skipped.iter().map(|s| s.reason).collect();
        assert_eq!(
            reasons,
            vec![SkipReason::SelfClosing, SkipReason::SelfClosing, SkipReason::Empty]
        );
    }

    #[test]
    fn markers_in_comments_and_scripts_are_ignored() {
        let src = r#"<!-- <span class="math-tex">a</span> --><script>s='<span class="math-tex">b</span>'</script>"#;
        let doc = rewrite(src, &opts());
        assert_eq!(body(&doc), src);
        assert!(doc.report.skipped.is_empty());
    }

    #[test]
    fn markers_in_raw_text_elements_are_ignored() {
        for name in ["xmp", "iframe", "textarea", "noscript"] {
            let src = format!(r#"<{name}><span class="math-tex">w</span></{name}>"#);
            let doc = rewrite(&src, &opts());
            assert_eq!(body(&doc), src, "{name}");
            assert_eq!(doc.report.rewrites(), 0, "{name}");
        }
    }

    #[test]
    fn encoded_class_value_is_recognised() {
        let doc = rewrite(
            r#"<span class="math&#45;tex">x</span><span class="math&#x2D;display">y</span>"#,
            &opts(),
        );
        assert_eq!(body(&doc), r"\( x \)\[ y \]");
        assert_eq!(doc.report.inline_rewrites, 1);
        assert_eq!(doc.report.display_rewrites, 1);
    }

    #[test]
    fn full_document_is_not_rewrapped() {
        let src = "<!DOCTYPE html><html><body><span class=\"math-tex\">y</span></body></html>";
        let doc = rewrite(src, &opts());
        assert_eq!(doc.html, "<!DOCTYPE html><html><body>\\( y \\)</body></html>");
        assert!(!doc.report.shell_added);

        let bare_body = "<body><p>x</p></body>";
        assert_eq!(rewrite(bare_body, &opts()).html, bare_body);
    }

    #[test]
    fn rewriting_is_idempotent() {
        let options = RewriteOptions {
            detect_bare_tex: true,
            ..RewriteOptions::default()
        };
        let sources = [
            r#"<p>Solve <span class="math-tex">x+1=2</span> where \alpha &gt; 0</p>"#,
            r#"<p>Bare: \frac{1}{2}</p><div class="math-display">\sum i</div>"#,
            r#"<span class="math-tex"></span><span class="math-tex">a<span class="math-tex">b</span></span>"#,
            "<p>nothing to do</p>",
        ];
        for src in sources {
            let once = rewrite(src, &options);
            let twice = rewrite(&once.html, &options);
            assert_eq!(once.html, twice.html, "not idempotent for {src:?}");
        }
    }

    #[test]
    fn bare_tex_is_opt_in_and_skips_code() {
        let src = r"<p>Hitung: \sqrt{16}</p><pre>\frac{a}{b}</pre>";
        assert_eq!(body(&rewrite(src, &opts())), src);

        let options = RewriteOptions {
            detect_bare_tex: true,
            ..RewriteOptions::default()
        };
        let doc = rewrite(src, &options);
        assert_eq!(
            body(&doc),
            r"<p>Hitung: \( \sqrt{16} \)</p><pre>\frac{a}{b}</pre>"
        );
        assert_eq!(doc.report.bare_tex_wraps, 1);
    }

    #[test]
    fn word_export_is_cleaned_before_rewriting() {
        let options = RewriteOptions {
            simplify_word_export: true,
            strip_boilerplate: true,
            ..RewriteOptions::default()
        };
        let src = r#"<p class=MsoNormal><span style="mso-ansi">Luas: </span><span class="math-tex">\pi r^2</span></p><style>p{}</style>"#;
        let doc = rewrite(src, &options);
        assert_eq!(body(&doc), r"<p>Luas: \( \pi r^2 \)</p>");
        assert!(doc.report.cleanup.word_simplified);
        assert_eq!(doc.report.cleanup.boilerplate_removed, 1);
        assert_eq!(doc.report.inline_rewrites, 1);

        // Off by default: the same upload keeps its wrappers.
        let plain = rewrite(src, &opts());
        assert!(plain.html.contains("MsoNormal"));
        assert!(!plain.report.cleanup.changed());
    }

    #[test]
    fn escaped_tags_are_promoted_on_request() {
        let options = RewriteOptions {
            promote_escaped_tags: true,
            ..RewriteOptions::default()
        };
        let src = r#"<p>&lt;b&gt;Note&lt;/b&gt; <span class="math-tex">a &lt; b</span></p>"#;
        let doc = rewrite(src, &options);
        assert_eq!(body(&doc), r"<p><b>Note</b> \( a &lt; b \)</p>");
        assert_eq!(doc.report.cleanup.promoted_tags, 2);
    }

    #[test]
    fn display_class_can_be_disabled() {
        let options = RewriteOptions {
            display_class: None,
            ..RewriteOptions::default()
        };
        let src = r#"<div class="math-display">x</div>"#;
        assert_eq!(body(&rewrite(src, &options)), src);
    }

    #[test]
    fn non_ascii_content_survives() {
        let doc = rewrite(
            r#"<p>Luas ≈ <span class="math-tex">πr²</span> 日本</p>"#,
            &opts(),
        );
        assert_eq!(body(&doc), r"<p>Luas ≈ \( πr² \) 日本</p>");
    }
}
