//! Chrome table
//!
//! Lines a coding CLI draws as UI decoration rather than content. Each rule
//! carries the reason it exists; new chrome found in the field is added here
//! together with a test case, and `CHROME_TABLE_VERSION` is bumped.

use once_cell::sync::Lazy;
use regex::Regex;

/// Bumped whenever a rule is added, removed or reshaped
pub const CHROME_TABLE_VERSION: u32 = 5;

/// Spinner glyphs drawn by the coding CLI and common braille spinners
const SPINNER_GLYPHS: &str = "·✻✽✶✳✢⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏⠐⠂⠈⠁⠉⠃⠓⠒⠖⠤";

/// Why a line was classified as chrome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromeReason {
    /// `~/proj ❯`, `dev@box:~/proj$`, `PS C:\src>`
    PathPrompt,
    /// `✻`, `⠋ 12s`, `· · ·`
    Spinner,
    /// `Thinking…`, `✻ Cogitating… (12s · esc to interrupt)`, `Reading (`
    StatusHeader,
    /// `+12 -3`
    DiffStat,
    /// `ing)`, `king)` left behind by a truncated `(thinking)`
    ThinkingFragment,
    /// `────────`
    Separator,
    /// `│ > │`
    InputBox,
    /// `⏵⏵ accept edits on (shift+tab to cycle)`
    KeyHintBar,
    /// `❯`, `>`
    PromptOnly,
}

impl ChromeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChromeReason::PathPrompt => "path_prompt",
            ChromeReason::Spinner => "spinner",
            ChromeReason::StatusHeader => "status_header",
            ChromeReason::DiffStat => "diff_stat",
            ChromeReason::ThinkingFragment => "thinking_fragment",
            ChromeReason::Separator => "separator",
            ChromeReason::InputBox => "input_box",
            ChromeReason::KeyHintBar => "key_hint_bar",
            ChromeReason::PromptOnly => "prompt_only",
        }
    }
}

/// One entry of the chrome table. `matches` receives a trimmed, non-empty line.
pub struct ChromeRule {
    pub reason: ChromeReason,
    pub matches: fn(&str) -> bool,
}

// ========== Patterns ==========

/// Optional `user@host:` or `PS ` prefix, a path, then a prompt glyph
static PATH_PROMPT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:PS\s+)?(?:[\w.-]+@[\w.-]+:?\s*)?(?:~|/|[A-Za-z]:[\\/])[^\s❯>$#%]*\s*[❯>$#%]\s*$",
    )
    .unwrap()
});

/// `[dev@box proj]$`
static BRACKET_PROMPT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[[\w.-]+@[\w.-]+[^\]]*\]\s*[$#%]\s*$").unwrap());

/// Glyph run, then at most a few short numeric fragments (`12s`, `(3.4k)`, `45%`)
static SPINNER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^[{g}](?:\s*[{g}])*(?:\s+[(\[]?[\d.,:]+(?:ms|s|m|%|k)?(?:\s*tokens?)?[)\]]?){{0,3}}$",
        g = SPINNER_GLYPHS
    ))
    .unwrap()
});

/// Spinner-prefixed word, with or without ellipsis and bracketed detail
static SPINNER_HEADER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^[{g}]\s*[A-Z][a-z]+(?:…|\.\.\.)?\s*(?:\(.*)?$",
        g = SPINNER_GLYPHS
    ))
    .unwrap()
});

/// `Thinking…`, `Thinking… (12s`, `Thinking… (12s)`
static ELLIPSIS_HEADER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][a-z]+(?:…|\.\.\.)\s*(?:\([^)]*\)?)?$").unwrap());

/// A single capitalised word followed by a dangling `(`
static BRACKET_HEADER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][a-z]+\s*\($").unwrap());

static DIFF_STAT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[+\-~]\d+[,\s]*)+$").unwrap());

static SEPARATOR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\s─━═╌╍┄┅╭╮╰╯┌┐└┘├┤│┃]*[─━═╌╍┄┅]{3,}[\s─━═╌╍┄┅╭╮╰╯┌┐└┘├┤│┃]*$").unwrap()
});

static INPUT_BOX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[│┃]\s*(?:[❯>]\s*)?[│┃]$").unwrap());

static KEY_HINT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:\(?esc to interrupt\)?|\? for shortcuts(?:\s{2,}.*)?|⏵⏵ .*|.*\(shift\+tab to cycle\)|\(?ctrl\+c to exit\)?|press ctrl-c again to exit)$",
    )
    .unwrap()
});

static PROMPT_ONLY_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[❯>]\s*$").unwrap());

const THINKING_INDICATOR: &str = "(thinking)";
const DIFF_STAT_MAX_LEN: usize = 40;

// ========== Matchers ==========

fn is_path_prompt(line: &str) -> bool {
    PATH_PROMPT_PATTERN.is_match(line) || BRACKET_PROMPT_PATTERN.is_match(line)
}

fn is_spinner(line: &str) -> bool {
    SPINNER_PATTERN.is_match(line)
}

fn is_status_header(line: &str) -> bool {
    SPINNER_HEADER_PATTERN.is_match(line)
        || ELLIPSIS_HEADER_PATTERN.is_match(line)
        || BRACKET_HEADER_PATTERN.is_match(line)
}

fn is_diff_stat(line: &str) -> bool {
    line.chars().count() <= DIFF_STAT_MAX_LEN && DIFF_STAT_PATTERN.is_match(line)
}

fn is_thinking_fragment(line: &str) -> bool {
    line.len() >= 2 && THINKING_INDICATOR.ends_with(line)
}

fn is_separator(line: &str) -> bool {
    SEPARATOR_PATTERN.is_match(line)
}

fn is_input_box(line: &str) -> bool {
    INPUT_BOX_PATTERN.is_match(line)
}

fn is_key_hint(line: &str) -> bool {
    KEY_HINT_PATTERN.is_match(line)
}

fn is_prompt_only(line: &str) -> bool {
    PROMPT_ONLY_PATTERN.is_match(line)
}

/// Checked in order; the first matching rule names the reason
pub static CHROME_TABLE: &[ChromeRule] = &[
    ChromeRule { reason: ChromeReason::PromptOnly, matches: is_prompt_only },
    ChromeRule { reason: ChromeReason::PathPrompt, matches: is_path_prompt },
    ChromeRule { reason: ChromeReason::Spinner, matches: is_spinner },
    ChromeRule { reason: ChromeReason::StatusHeader, matches: is_status_header },
    ChromeRule { reason: ChromeReason::DiffStat, matches: is_diff_stat },
    ChromeRule { reason: ChromeReason::ThinkingFragment, matches: is_thinking_fragment },
    ChromeRule { reason: ChromeReason::Separator, matches: is_separator },
    ChromeRule { reason: ChromeReason::InputBox, matches: is_input_box },
    ChromeRule { reason: ChromeReason::KeyHintBar, matches: is_key_hint },
];

/// Classify a plain-text line. Blank lines are never chrome.
pub fn classify(line: &str) -> Option<ChromeReason> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    CHROME_TABLE
        .iter()
        .find(|rule| (rule.matches)(line))
        .map(|rule| rule.reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(line: &str) -> Option<ChromeReason> {
        classify(line)
    }

    #[test]
    fn test_path_prompts() {
        assert_eq!(reason("~/proj ❯"), Some(ChromeReason::PathPrompt));
        assert_eq!(reason("~/proj❯"), Some(ChromeReason::PathPrompt));
        assert_eq!(reason("dev@buildbox:~/proj$"), Some(ChromeReason::PathPrompt));
        assert_eq!(reason("/srv/app #"), Some(ChromeReason::PathPrompt));
        assert_eq!(reason(r"PS C:\Users\dev\src>"), Some(ChromeReason::PathPrompt));
        assert_eq!(reason("[dev@buildbox proj]$"), Some(ChromeReason::PathPrompt));
        // No path: content, not a prompt
        assert_eq!(reason("done❯"), None);
        assert_eq!(reason("~/proj has 3 files"), None);
    }

    #[test]
    fn test_spinners() {
        assert_eq!(reason("✻"), Some(ChromeReason::Spinner));
        assert_eq!(reason("· · ·"), Some(ChromeReason::Spinner));
        assert_eq!(reason("⠋ 12s"), Some(ChromeReason::Spinner));
        assert_eq!(reason("✶ (3.4k tokens)"), Some(ChromeReason::Spinner));
        assert_eq!(reason("✻ 1 2 3 4"), None);
        assert_eq!(reason("* Fixed"), None);
    }

    #[test]
    fn test_status_headers() {
        assert_eq!(reason("Thinking…"), Some(ChromeReason::StatusHeader));
        assert_eq!(reason("Thinking… (12s"), Some(ChromeReason::StatusHeader));
        assert_eq!(reason("Reading ("), Some(ChromeReason::StatusHeader));
        assert_eq!(reason("Processing... (4s)"), Some(ChromeReason::StatusHeader));
        assert_eq!(
            reason("✻ Cogitating… (12s · ↑ 1.2k tokens)"),
            Some(ChromeReason::StatusHeader)
        );
        assert_eq!(reason("Reading the config file now."), None);
        assert_eq!(reason("Yes"), None);
    }

    #[test]
    fn test_diff_stats() {
        assert_eq!(reason("+12 -3"), Some(ChromeReason::DiffStat));
        assert_eq!(reason("+5, -0, ~2"), Some(ChromeReason::DiffStat));
        assert_eq!(reason("-1"), Some(ChromeReason::DiffStat));
        assert_eq!(reason("+1 means approve"), None);
    }

    #[test]
    fn test_thinking_fragments() {
        assert_eq!(reason("ing)"), Some(ChromeReason::ThinkingFragment));
        assert_eq!(reason("(thinking)"), Some(ChromeReason::ThinkingFragment));
        assert_eq!(reason(")"), None);
        assert_eq!(reason("thinking"), None);
    }

    #[test]
    fn test_frame_and_hints() {
        assert_eq!(reason("────────────"), Some(ChromeReason::Separator));
        assert_eq!(reason("╭──────╮"), Some(ChromeReason::Separator));
        assert_eq!(reason("│ > │"), Some(ChromeReason::InputBox));
        assert_eq!(
            reason("⏵⏵ accept edits on (shift+tab to cycle)"),
            Some(ChromeReason::KeyHintBar)
        );
        assert_eq!(reason("? for shortcuts"), Some(ChromeReason::KeyHintBar));
        assert_eq!(reason("Press Ctrl-C again to exit"), Some(ChromeReason::KeyHintBar));
        assert_eq!(reason("(esc to interrupt)"), Some(ChromeReason::KeyHintBar));
        assert_eq!(reason("❯ "), Some(ChromeReason::PromptOnly));
        assert_eq!(reason(">"), Some(ChromeReason::PromptOnly));
    }

    #[test]
    fn test_content_survives() {
        for line in [
            "fn main() {",
            "All 42 tests passed.",
            "- removed the old parser",
            "> quoted reply",
            "Hit esc to interrupt a long build.",
            "If it hangs, press ctrl-c again and retry.",
            "The ⏵⏵ glyph marks auto-accept mode",
            "",
        ] {
            assert_eq!(reason(line), None, "{line:?} misclassified");
        }
    }
}
