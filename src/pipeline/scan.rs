//! Byte-range tokenization of HTML source.
//!
//! Lexing is done by the html5ever tokenizer, so raw-text and RCDATA
//! elements, character references in attribute values, bogus comments and
//! stray `<` characters all follow the HTML tokenization rules. The sink
//! switches the tokenizer into the same content models the tree builder
//! would (`script`, `style`, `xmp`, `iframe`, `textarea`, ...).
//!
//! html5ever reports tokens but not where they sit in the source. Every tag,
//! comment and doctype is emitted when its closing `>` is consumed, so the
//! input is fed in chunks that each end just past a `>`: a token emitted
//! while a chunk is fed ends where that chunk ends, and it opens at the
//! first `<` after the previous token that can start it. Whatever lies
//! between two tokens is text.
//!
//! The spans tile the input, so the rewriter can splice replacements into
//! the original bytes and copy everything else through unchanged.

use html5ever::tendril::StrTendril;
use html5ever::tokenizer::states::RawKind;
use html5ever::tokenizer::{
    BufferQueue, TagKind, Token as HtmlToken, TokenSink, TokenSinkResult, Tokenizer,
    TokenizerOpts,
};
use std::ops::Range;

/// Elements that never have content, so a start tag is a whole element.
pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// A start tag with its lower-cased name and decoded attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTag {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub self_closing: bool,
}

impl StartTag {
    /// Value of attribute `name` (attribute names are lower-cased).
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// `true` if the `class` attribute contains `token` as a whole word.
    pub fn has_class(&self, token: &str) -> bool {
        self.attr("class")
            .map(|c| c.split_ascii_whitespace().any(|t| t == token))
            .unwrap_or(false)
    }

    pub fn is_void(&self) -> bool {
        VOID_ELEMENTS.contains(&self.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Text,
    /// Content of a raw-text, RCDATA or plaintext element.
    RawText,
    StartTag(StartTag),
    EndTag(String),
    /// Comments, including bogus ones such as `<?xml ...?>`.
    Comment,
    Doctype,
}

/// One lexical unit and where it sits in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Range<usize>,
}

/// Tokenizer state entered after the start tag `name`, if not data.
fn content_model(name: &str) -> Option<TokenSinkResult<()>> {
    match name {
        "title" | "textarea" => Some(TokenSinkResult::RawData(RawKind::Rcdata)),
        "style" | "xmp" | "iframe" | "noembed" | "noframes" | "noscript" => {
            Some(TokenSinkResult::RawData(RawKind::Rawtext))
        }
        "script" => Some(TokenSinkResult::RawData(RawKind::ScriptData)),
        "plaintext" => Some(TokenSinkResult::Plaintext),
        _ => None,
    }
}

/// Collects the non-text tokens emitted during one `feed`.
#[derive(Default)]
struct SpanSink {
    emitted: Vec<TokenKind>,
}

impl TokenSink for SpanSink {
    type Handle = ();

    fn process_token(&mut self, token: HtmlToken, _line_number: u64) -> TokenSinkResult<()> {
        match token {
            HtmlToken::TagToken(tag) => match tag.kind {
                TagKind::StartTag => {
                    let start = StartTag {
                        name: tag.name.to_string(),
                        attrs: tag
                            .attrs
                            .into_iter()
                            .map(|a| (a.name.local.to_string(), a.value.to_string()))
                            .collect(),
                        self_closing: tag.self_closing,
                    };
                    let next = content_model(&start.name);
                    self.emitted.push(TokenKind::StartTag(start));
                    if let Some(next) = next {
                        return next;
                    }
                }
                TagKind::EndTag => self.emitted.push(TokenKind::EndTag(tag.name.to_string())),
            },
            HtmlToken::CommentToken(_) => self.emitted.push(TokenKind::Comment),
            HtmlToken::DoctypeToken(_) => self.emitted.push(TokenKind::Doctype),
            _ => {}
        }
        TokenSinkResult::Continue
    }
}

/// Assembles tokens into spans that tile the source.
struct Spans<'a> {
    src: &'a [u8],
    cursor: usize,
    raw: bool,
    tokens: Vec<Token>,
}

impl<'a> Spans<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            cursor: 0,
            raw: false,
            tokens: Vec::new(),
        }
    }

    /// Record `kind`, which the tokenizer finished at offset `end`.
    fn place(&mut self, kind: TokenKind, end: usize) {
        let start = opening(self.src, self.cursor, end, &kind)
            .or_else(|| (self.cursor..end).rev().find(|&i| self.src[i] == b'<'))
            .unwrap_or(self.cursor);
        self.text_until(start);
        self.raw = matches!(&kind, TokenKind::StartTag(tag) if content_model(&tag.name).is_some());
        self.tokens.push(Token {
            kind,
            span: start..end,
        });
        self.cursor = end;
    }

    fn text_until(&mut self, until: usize) {
        if until > self.cursor {
            let kind = if self.raw {
                TokenKind::RawText
            } else {
                TokenKind::Text
            };
            self.tokens.push(Token {
                kind,
                span: self.cursor..until,
            });
            self.cursor = until;
        }
    }

    fn finish(mut self) -> Vec<Token> {
        self.text_until(self.src.len());
        self.tokens
    }
}

/// Offset of the `<` that opens `kind` within `b[from..to]`.
fn opening(b: &[u8], from: usize, to: usize, kind: &TokenKind) -> Option<usize> {
    let mut lts = (from..to).filter(|&i| b[i] == b'<');
    match kind {
        TokenKind::StartTag(tag) => lts.find(|&i| names_tag(b, i + 1, &tag.name, to)),
        // Script data can hold an inert `</script>` inside `<!--<script>`; the
        // real end tag is the last candidate.
        TokenKind::EndTag(name) => (from..to)
            .rev()
            .find(|&i| b[i] == b'<' && b.get(i + 1) == Some(&b'/') && names_tag(b, i + 2, name, to)),
        TokenKind::Comment => lts.find(|&i| matches!(b.get(i + 1), Some(b'!' | b'?' | b'/'))),
        TokenKind::Doctype => lts.find(|&i| b.get(i + 1) == Some(&b'!')),
        TokenKind::Text | TokenKind::RawText => None,
    }
}

/// `name` at `at`, followed by whitespace, `/` or `>` before `to`.
fn names_tag(b: &[u8], at: usize, name: &str, to: usize) -> bool {
    let after = at + name.len();
    after < to
        && b[at..after].eq_ignore_ascii_case(name.as_bytes())
        && (b[after].is_ascii_whitespace() || matches!(b[after], b'/' | b'>'))
}

/// Tokenize the whole of `src`.
pub fn scan(src: &str) -> Vec<Token> {
    let mut tokenizer = Tokenizer::new(SpanSink::default(), TokenizerOpts::default());
    let mut queue = BufferQueue::default();
    let mut spans = Spans::new(src);
    let bytes = src.as_bytes();
    let mut pos = 0;

    while pos < src.len() {
        let end = bytes[pos..]
            .iter()
            .position(|&c| c == b'>')
            .map_or(src.len(), |gt| pos + gt + 1);
        queue.push_back(StrTendril::from_slice(&src[pos..end]));
        let _ = tokenizer.feed(&mut queue);
        for kind in tokenizer.sink.emitted.drain(..) {
            spans.place(kind, end);
        }
        pos = end;
    }

    tokenizer.end();
    for kind in tokenizer.sink.emitted.drain(..) {
        spans.place(kind, src.len());
    }
    spans.finish()
}

/// Collects the text the tokenizer produces, references decoded.
#[derive(Default)]
struct TextSink {
    text: String,
}

impl TokenSink for TextSink {
    type Handle = ();

    fn process_token(&mut self, token: HtmlToken, _line_number: u64) -> TokenSinkResult<()> {
        match token {
            HtmlToken::CharacterTokens(t) => self.text.push_str(&t),
            HtmlToken::NullCharacterToken => self.text.push('\0'),
            _ => {}
        }
        TokenSinkResult::Continue
    }
}

/// Decode the character references in a run of text, as HTML would.
///
/// Meant for [`TokenKind::Text`] spans; markup inside `text` is dropped.
pub fn decode_text(text: &str) -> String {
    let opts = TokenizerOpts {
        discard_bom: false,
        ..TokenizerOpts::default()
    };
    let mut tokenizer = Tokenizer::new(TextSink::default(), opts);
    let mut queue = BufferQueue::default();
    queue.push_back(StrTendril::from_slice(text));
    let _ = tokenizer.feed(&mut queue);
    tokenizer.end();
    std::mem::take(&mut tokenizer.sink.text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        scan(src).into_iter().map(|t| t.kind).collect()
    }

    fn reassemble(src: &str) -> String {
        scan(src).iter().map(|t| &src[t.span.clone()]).collect()
    }

    fn start_tag(src: &str) -> StartTag {
        match scan(src).into_iter().next().map(|t| t.kind) {
            Some(TokenKind::StartTag(tag)) => tag,
            other => panic!("expected start tag, got {other:?}"),
        }
    }

    #[test]
    fn spans_cover_input_exactly() {
        let inputs = [
            "",
            "plain text",
            "<p class=\"a\">x &amp; y</p>",
            "<!DOCTYPE html><html><body>a<br/>b</body></html>",
            "a < b and c > d",
            "<p>unterminated <span class='x'",
            "<!-- open comment",
            "<script>if (a < b) { x = '</p>'; }</script><p>after</p>",
            "<?xml version=\"1.0\"?><p>√ ∑ 日本</p>",
            "\u{feff}<p>bom</p>",
            "a &amp b</><p title='<p>'>c</p>",
        ];
        for src in inputs {
            assert_eq!(reassemble(src), src, "round trip failed for {src:?}");
        }
    }

    #[test]
    fn start_tag_attributes() {
        let tag = start_tag(r#"<SPAN Class="math-tex big" data-x='1' hidden id=a>"#);
        assert_eq!(tag.name, "span");
        assert_eq!(tag.attr("class"), Some("math-tex big"));
        assert_eq!(tag.attr("data-x"), Some("1"));
        assert_eq!(tag.attr("hidden"), Some(""));
        assert_eq!(tag.attr("id"), Some("a"));
        assert!(tag.has_class("math-tex"));
        assert!(!tag.has_class("math"));
        assert!(!tag.self_closing);
    }

    #[test]
    fn attribute_references_are_decoded() {
        let tag = start_tag(r#"<span class="math&#45;tex" title='a &amp; b'>"#);
        assert!(tag.has_class("math-tex"));
        assert_eq!(tag.attr("title"), Some("a & b"));
    }

    #[test]
    fn gt_inside_quoted_attribute() {
        let toks = scan(r#"<a title="x > y">t</a>"#);
        assert_eq!(toks.len(), 3);
        assert_eq!(toks[0].span, 0..17);
        assert_eq!(toks[2].span, 18..22);
    }

    #[test]
    fn lt_inside_quoted_attribute() {
        let src = r#"x<p title="<p>">y"#;
        let toks = scan(src);
        assert_eq!(toks[0].kind, TokenKind::Text);
        assert_eq!(toks[1].span, 1..16);
        assert_eq!(start_tag(&src[1..]).attr("title"), Some("<p>"));
    }

    #[test]
    fn self_closing_syntax() {
        let toks = scan(r#"<span class="math-tex"/><br />"#);
        assert_eq!(toks.len(), 2);
        for t in &toks {
            let TokenKind::StartTag(tag) = &t.kind else {
                panic!("unexpected {:?}", t.kind);
            };
            assert!(tag.self_closing);
        }
    }

    #[test]
    fn slash_in_unquoted_value_is_not_self_closing() {
        let tag = start_tag("<a href=/x/>");
        assert_eq!(tag.attr("href"), Some("/x/"));
        assert!(!tag.self_closing);
    }

    #[test]
    fn comments_and_doctype() {
        let k = kinds("<!doctype html><!-- <span class=\"math-tex\">x</span> --><p>");
        assert_eq!(k.len(), 3);
        assert_eq!(k[0], TokenKind::Doctype);
        assert_eq!(k[1], TokenKind::Comment);
        assert!(matches!(k[2], TokenKind::StartTag(ref t) if t.name == "p"));
    }

    #[test]
    fn processing_instruction_is_a_comment() {
        let toks = scan("<?xml version=\"1.0\"?><p>");
        assert_eq!(toks[0].kind, TokenKind::Comment);
        assert_eq!(toks[0].span, 0..21);
    }

    #[test]
    fn raw_text_is_not_tokenized() {
        let src = "<style>.math-tex { color: red }</style><title>a <b> c</TITLE >";
        let k = kinds(src);
        assert!(matches!(k[0], TokenKind::StartTag(ref t) if t.name == "style"));
        assert_eq!(k[1], TokenKind::RawText);
        assert_eq!(k[2], TokenKind::EndTag("style".into()));
        assert!(matches!(k[3], TokenKind::StartTag(ref t) if t.name == "title"));
        assert_eq!(k[4], TokenKind::RawText);
        assert_eq!(k[5], TokenKind::EndTag("title".into()));
        assert_eq!(k.len(), 6);
    }

    #[test]
    fn xmp_and_iframe_content_is_raw() {
        for name in ["xmp", "iframe", "noembed", "textarea"] {
            let src = format!(r#"<{name}><span class="math-tex">x</span></{name}>"#);
            let k = kinds(&src);
            assert_eq!(k.len(), 3, "{name}: {k:?}");
            assert_eq!(k[1], TokenKind::RawText, "{name}");
            assert_eq!(k[2], TokenKind::EndTag(name.into()));
        }
    }

    #[test]
    fn plaintext_runs_to_end_of_input() {
        let k = kinds("<plaintext><p>a</p>");
        assert_eq!(k.len(), 2);
        assert_eq!(k[1], TokenKind::RawText);
    }

    #[test]
    fn empty_raw_text_element() {
        assert_eq!(
            kinds("<script></script>")[1],
            TokenKind::EndTag("script".into())
        );
    }

    #[test]
    fn lone_angle_brackets_are_text() {
        assert_eq!(kinds("a < b"), vec![TokenKind::Text]);
        assert!(kinds("<3 <> < /p>").iter().all(|k| *k == TokenKind::Text));
    }

    #[test]
    fn text_references_are_decoded() {
        assert_eq!(decode_text("&lt;p class=&quot;a&quot;&gt; &amp; &#x3c0; a < b"), "<p class=\"a\"> & π a < b");
        assert_eq!(decode_text("plain"), "plain");
    }

    #[test]
    fn unterminated_tag_becomes_text() {
        let toks = scan("<p>ok</p><span class=\"math-tex\"");
        let last = toks.last().map(|t| (t.kind.clone(), t.span.clone()));
        assert_eq!(last, Some((TokenKind::Text, 9..31)));
    }
}
