//! Post-processing: deterministic cleanup of VLM transcriptions.
//!
//! ## Why is post-processing necessary?
//!
//! Even when told to output plain text, vision models drift back into their
//! habits: they wrap the answer in code fences, turn a bold line into a `#`
//! heading, render a table row as `| a | b |`, or apologise instead of
//! answering on a blank crop. Any of these would end up verbatim in a
//! block's text and in keyword search. The rules below strip that markup
//! without touching the words themselves, and each rule is testable alone.
//!
//! ## Rule Order
//!
//! Fences are stripped before line endings are normalised so the fence regex
//! sees the raw answer; markup is removed line by line after trimming; blank
//! lines are dropped last because line structure feeds word geometry.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every cleanup rule to a raw model answer.
///
/// 1. Strip outer code fences
/// 2. Normalise line endings (CRLF → LF)
/// 3. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 4. Replace refusals and "no text" answers with nothing
/// 5. Remove Markdown markup per line (headings, emphasis, images, tables)
/// 6. Trim every line and drop blank ones
pub fn clean_transcription(input: &str) -> String {
    let s = strip_code_fences(input);
    let s = normalise_line_endings(&s);
    let s = remove_invisible_chars(&s);
    if is_refusal(&s) {
        return String::new();
    }
    s.lines()
        .filter(|l| !is_separator_row(l))
        .map(strip_markup)
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 1: Strip outer code fences ──────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\r?\n(.*?)\r?\n?```\s*$").unwrap());

fn strip_code_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 4: Refusals ─────────────────────────────────────────────────────────

static RE_REFUSAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:i'?m sorry|i am sorry|i cannot|i can'?t|sorry,|there is no (?:legible |visible )?text|no (?:legible |visible )?text)",
    )
    .unwrap()
});

/// A short answer that talks about the image instead of transcribing it.
fn is_refusal(input: &str) -> bool {
    input.len() < 200 && RE_REFUSAL.is_match(input)
}

// ── Rule 5: Markdown markup ──────────────────────────────────────────────────

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s{0,3}#{1,6}\s+").unwrap());
static RE_EMPHASIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\*\*|__|`)").unwrap());
static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").unwrap());

fn strip_markup(line: &str) -> String {
    let line = RE_HEADING.replace(line, "");
    let line = RE_IMAGE.replace_all(&line, "$1");
    let line = RE_EMPHASIS.replace_all(&line, "");
    if is_table_row(&line) {
        return line
            .trim()
            .trim_matches('|')
            .split('|')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
    }
    line.into_owned()
}

fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.ends_with('|') && trimmed.len() > 2
}

fn is_separator_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|')
        && trimmed.contains('-')
        && trimmed
            .chars()
            .all(|c| c == '|' || c == '-' || c == ':' || c == ' ')
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_code_fences("```text\nInvoice 42\n```"), "Invoice 42");
        assert_eq!(strip_code_fences("```\nA\nB\n```"), "A\nB");
        assert_eq!(strip_code_fences("plain"), "plain");
    }

    #[test]
    fn test_normalise_line_endings() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn test_remove_invisible() {
        let input = "hello\u{200B}world\u{FEFF}foo\u{00AD}bar";
        assert_eq!(remove_invisible_chars(input), "helloworldfoobar");
    }

    #[test]
    fn test_refusals_become_empty() {
        assert_eq!(clean_transcription("I'm sorry, I can't read this image."), "");
        assert_eq!(clean_transcription("No legible text."), "");
        assert_eq!(clean_transcription("Sorry Street 4"), "Sorry Street 4");
    }

    #[test]
    fn test_markup_is_removed() {
        assert_eq!(strip_markup("## Annual **Report**"), "Annual Report");
        assert_eq!(strip_markup("use `cargo` now"), "use cargo now");
        assert_eq!(strip_markup("![Logo](logo.png) ACME"), "Logo ACME");
        assert_eq!(strip_markup("| Qty | Price |"), "Qty Price");
        assert_eq!(strip_markup("#5 is not a heading"), "#5 is not a heading");
    }

    #[test]
    fn test_full_cleanup() {
        let input = "```markdown\n# Invoice\r\n\r\n| Item | Total |\n| --- | --- |\n| Widget | 42.00 |  \n```";
        assert_eq!(clean_transcription(input), "Invoice\nItem Total\nWidget 42.00");
    }

    #[test]
    fn test_list_markers_survive() {
        assert_eq!(clean_transcription("- apples\n- pears"), "- apples\n- pears");
    }
}
