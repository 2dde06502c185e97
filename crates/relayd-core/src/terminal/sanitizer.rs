//! Terminal output sanitizer
//!
//! Turns raw output from a full-screen terminal program into plain lines fit
//! for a chat message. Order of operations matters:
//!
//! 1. Line endings: CRLF and LF end a logical line. A bare CR inside a line
//!    means "redraw", so only the last non-empty draw survives.
//! 2. Cursor positioning (CUP, VPA, row moves) becomes a line break and
//!    cursor-forward becomes a space, before anything else is stripped, so
//!    separate screen regions never fuse into one word.
//! 3. Remaining escape sequences and C0 controls are stripped.
//! 4. Lines in the chrome table are dropped.
//! 5. Blank runs collapse to one blank line and blank edges are trimmed.
//!
//! The function is pure and idempotent: sanitizing its own output is a no-op.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;

use super::chrome;

/// CSI sequences that move the cursor to another row
static CURSOR_ROW_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[HfdEFAB]").unwrap());

/// CSI sequences that move the cursor along the row
static CURSOR_COLUMN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[CG`]").unwrap());

/// OSC, DCS, SOS, PM, APC strings with their terminator
static STRING_SEQUENCE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b[\]PX^_][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap());

/// Any other CSI sequence (colors, modes, erase)
static CSI_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]").unwrap());

/// Charset designation and two-byte escapes
static SHORT_ESCAPE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b(?:[()*+#%][0-9A-Za-z@]|[=>78DEHMNOZc\\])").unwrap());

/// C0 controls (tab excluded) and DEL
static CONTROL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0b-\x1f\x7f]").unwrap());

/// Sanitize chunks delivered in arrival order into displayable lines.
///
/// Returns an empty list when nothing displayable remains.
pub fn sanitize<S: AsRef<str>>(chunks: &[S]) -> Vec<String> {
    let raw: String = chunks.iter().map(AsRef::as_ref).collect();
    let mut lines = Vec::new();

    for logical in split_logical_lines(&raw) {
        let drawn = last_draw(logical);
        let positioned = CURSOR_ROW_PATTERN.replace_all(drawn, "\n");
        let positioned = CURSOR_COLUMN_PATTERN.replace_all(&positioned, " ");
        let plain = strip_sequences(&positioned);

        for line in plain.split('\n') {
            let line = line.trim_end();
            if let Some(reason) = chrome::classify(line) {
                trace!(reason = reason.as_str(), line = %line, "Dropped chrome line");
                continue;
            }
            lines.push(line.to_string());
        }
    }

    collapse_blank_lines(lines)
}

/// Sanitize and join with newlines; `None` when nothing displayable remains
pub fn sanitize_text<S: AsRef<str>>(chunks: &[S]) -> Option<String> {
    let lines = sanitize(chunks);
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Split on CRLF, then on any bare LF left inside each piece
fn split_logical_lines(raw: &str) -> impl Iterator<Item = &str> {
    raw.split("\r\n").flat_map(|piece| piece.split('\n'))
}

/// Keep the final draw of a line that was overwritten with bare CRs.
///
/// A trailing CR with nothing after it does not erase the line.
fn last_draw(line: &str) -> &str {
    line.trim_end_matches('\r').rsplit('\r').next().unwrap_or("")
}

fn strip_sequences(text: &str) -> String {
    let text = STRING_SEQUENCE_PATTERN.replace_all(text, "");
    let text = CSI_PATTERN.replace_all(&text, "");
    let text = SHORT_ESCAPE_PATTERN.replace_all(&text, "");
    CONTROL_PATTERN.replace_all(&text, "").into_owned()
}

fn collapse_blank_lines(lines: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.is_empty() && out.last().map_or(true, |prev| prev.is_empty()) {
            continue;
        }
        out.push(line);
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_cr_keeps_final_draw() {
        let out = sanitize(&["fix❯\rdone❯"]);
        assert_eq!(out, vec!["done❯"]);

        let out = sanitize(&["Progress 10%\rProgress 55%\rProgress 100%\r\nnext line\r\n"]);
        assert_eq!(out, vec!["Progress 100%", "next line"]);
    }

    #[test]
    fn test_trailing_cr_does_not_erase() {
        assert_eq!(sanitize(&["compiled\r"]), vec!["compiled"]);
    }

    #[test]
    fn test_erased_redraw_is_dropped() {
        // Cursor back to column 0, then clear to end of line
        assert!(sanitize(&["old text\rnew text\r\x1b[K"]).is_empty());
        assert_eq!(sanitize(&["old text\rnew text\r\x1b[K\rfinal\r\r\n"]), vec!["final"]);
    }

    #[test]
    fn test_cursor_positioning_separates_words() {
        let out = sanitize(&["Hello\x1b[5;1HWorld\x1b[6;1Hagain"]);
        assert_eq!(out, vec!["Hello", "World", "again"]);

        let out = sanitize(&["left\x1b[12Cright"]);
        assert_eq!(out, vec!["left right"]);
    }

    #[test]
    fn test_strips_colors_and_titles() {
        let out = sanitize(&["\x1b]0;claude\x07\x1b[1;32mok\x1b[0m \x1b[?25lready\x1b(B\n"]);
        assert_eq!(out, vec!["ok ready"]);
    }

    #[test]
    fn test_drops_chrome_between_content() {
        let chunk = concat!(
            "\x1b[2J\x1b[H",
            "Updated src/main.rs\r\n",
            "✻ Cogitating… (12s · esc to interrupt)\r\n",
            "────────────────\r\n",
            "│ > │\r\n",
            "+12 -3\r\n",
            "ing)\r\n",
            "~/proj ❯ \r\n",
            "All tests pass.\r\n",
        );
        assert_eq!(sanitize(&[chunk]), vec!["Updated src/main.rs", "All tests pass."]);
    }

    #[test]
    fn test_blank_lines_collapse_and_trim() {
        let out = sanitize(&["\n\n  \nfirst\n\n\n\nsecond\n\n"]);
        assert_eq!(out, vec!["first", "", "second"]);
    }

    #[test]
    fn test_nothing_displayable() {
        assert!(sanitize(&["\x1b[?2004h\x1b[2K\r✻\r\n> \r\n"]).is_empty());
        assert_eq!(sanitize_text(&["\x1b[0m"]), None);
    }

    #[test]
    fn test_chunks_join_in_order() {
        let out = sanitize(&["first li", "ne\r\nsecond", " line\r\n"]);
        assert_eq!(out, vec!["first line", "second line"]);
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            "a\rb\r\n\x1b[31mred\x1b[0m\n\n\nThinking…\n  indented code\n\ttabbed",
            "Hello\x1b[3;1HWorld\n+1 -1\ndone❯",
            "\n\n",
        ];
        for input in inputs {
            let once = sanitize(&[input]);
            let twice = sanitize(&once.iter().map(|l| format!("{}\n", l)).collect::<Vec<_>>());
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_keeps_leading_indentation() {
        let out = sanitize(&["fn main() {\n    println!(\"hi\");\n}\n"]);
        assert_eq!(out, vec!["fn main() {", "    println!(\"hi\");", "}"]);
    }
}
