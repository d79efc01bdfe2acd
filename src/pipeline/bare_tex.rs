//! Detection of TeX written straight into text, without any delimiters.
//!
//! Rich-text editors sometimes lose the math container and leave a run such
//! as `Simplify: \frac{a}{b} \times c` in a plain paragraph. pandoc would
//! render that backslash soup literally; wrapping it in `\( … \)` turns it
//! into an equation.
//!
//! The heuristic is intentionally narrow:
//!
//! - the run must contain a backslash command from [`KEYWORDS`];
//! - runs that already carry `\(`, `\[` or `$` are left alone;
//! - a `label: tex` run wraps only what follows the first colon, provided
//!   that part still contains a backslash.

use once_cell::sync::Lazy;
use regex::Regex;

/// TeX commands that mark a text run as math.
pub const KEYWORDS: &[&str] = &[
    "frac", "times", "sqrt", "sum", "prod", "int", "left", "right", "binom", "over", "cdot",
    "dots", "ldots", "sin", "cos", "tan", "log", "ln", "pi", "alpha", "beta", "gamma", "theta",
];

static RE_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    let alternation = KEYWORDS.join("|");
    Regex::new(&format!(r"(?i)\\(?:{alternation})")).unwrap()
});

/// `true` if `text` already contains an inline or display math delimiter.
pub fn has_delimiters(text: &str) -> bool {
    text.contains("\\(") || text.contains("\\[") || text.contains('$')
}

/// Wrap the TeX in one text run, preserving surrounding whitespace.
///
/// Returns `None` when the run is left unchanged.
pub fn wrap_bare_tex(text: &str) -> Option<String> {
    let core = text.trim();
    if core.is_empty() || has_delimiters(core) || !RE_KEYWORD.is_match(core) {
        return None;
    }

    let lead = &text[..text.len() - text.trim_start().len()];
    let trail = &text[text.trim_end().len()..];

    if let Some((label, tex)) = core.split_once(':') {
        if tex.contains('\\') {
            let gap = &tex[..tex.len() - tex.trim_start().len()];
            return Some(format!("{lead}{label}:{gap}\\({}\\){trail}", pad(tex.trim())));
        }
    }

    Some(format!("{lead}\\({}\\){trail}", pad(core)))
}

fn pad(tex: &str) -> String {
    format!(" {tex} ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_whole_run() {
        assert_eq!(
            wrap_bare_tex(r"\frac{1}{2} + \sqrt{x}").as_deref(),
            Some(r"\( \frac{1}{2} + \sqrt{x} \)")
        );
    }

    #[test]
    fn keeps_surrounding_whitespace() {
        assert_eq!(
            wrap_bare_tex("\n  \\alpha + \\beta  ").as_deref(),
            Some("\n  \\( \\alpha + \\beta \\)  ")
        );
    }

    #[test]
    fn label_prefix_stays_outside() {
        assert_eq!(
            wrap_bare_tex(r"Hitunglah: \sum_{i=1}^{n} i").as_deref(),
            Some(r"Hitunglah: \( \sum_{i=1}^{n} i \)")
        );
    }

    #[test]
    fn colon_without_tex_after_wraps_everything() {
        assert_eq!(
            wrap_bare_tex(r"\log x: base ten").as_deref(),
            Some(r"\( \log x: base ten \)")
        );
    }

    #[test]
    fn ignores_delimited_and_plain_text() {
        assert_eq!(wrap_bare_tex(r"already \( \frac{1}{2} \)"), None);
        assert_eq!(wrap_bare_tex(r"costs $5, \times two"), None);
        assert_eq!(wrap_bare_tex("no commands here"), None);
        assert_eq!(wrap_bare_tex(r"path C:\Users\me"), None);
        assert_eq!(wrap_bare_tex("   "), None);
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        assert!(wrap_bare_tex(r"\Pi r^2").is_some());
    }
}
