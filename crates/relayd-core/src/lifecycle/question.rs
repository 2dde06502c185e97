//! Confirmation prompts shown by the remote TUI
//!
//! When delivered output ends in a question the next reply in the thread
//! answers it, so replies are translated into the keys the TUI expects.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static OPTION_CONFIRM_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^[\s❯>]*1\.\s*(Yes|Allow)").unwrap());

static YES_NO_CONFIRM_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[Y/n\]|\[y/N\]|\(yes/no\)|\(y/n\)|Allow\?|Do you want to proceed").unwrap());

static OPTION_LINE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\s❯>]*(\d+)\.\s+\S").unwrap());

/// Only the tail of a delivery can still be waiting for an answer
const QUESTION_TAIL_LINES: usize = 12;

const ARROW_DOWN: &str = "\x1b[B";
const ENTER: &str = "\r";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "count")]
pub enum QuestionKind {
    /// `[Y/n]` style prompt answered by typing
    YesNo,
    /// Numbered menu navigated with arrow keys; holds the option count
    Options(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuestion {
    pub kind: QuestionKind,
    pub prompt: String,
    pub asked_at: i64,
}

/// Look for a question at the end of delivered lines
pub fn detect_question(lines: &[String]) -> Option<PendingQuestion> {
    let start = lines.len().saturating_sub(QUESTION_TAIL_LINES);
    let tail = &lines[start..];
    let text = tail.join("\n");

    let kind = if OPTION_CONFIRM_PATTERN.is_match(&text) {
        let count = tail
            .iter()
            .filter_map(|line| OPTION_LINE_PATTERN.captures(line))
            .filter_map(|caps| caps[1].parse::<usize>().ok())
            .max()
            .unwrap_or(1);
        QuestionKind::Options(count.max(1))
    } else if YES_NO_CONFIRM_PATTERN.is_match(&text) {
        QuestionKind::YesNo
    } else {
        return None;
    };

    let prompt = tail
        .iter()
        .rev()
        .find(|line| YES_NO_CONFIRM_PATTERN.is_match(line) || line.trim_end().ends_with('?'))
        .or_else(|| tail.iter().rev().find(|l| !l.trim().is_empty()))
        .map(|l| l.trim().to_string())
        .unwrap_or_default();

    Some(PendingQuestion {
        kind,
        prompt,
        asked_at: chrono::Utc::now().timestamp_millis(),
    })
}

/// Keys answering `question` with `reply`, or `None` when the reply isn't an
/// answer and should be sent as ordinary input
pub fn answer_keys(question: &PendingQuestion, reply: &str) -> Option<String> {
    let reply = reply.trim().to_ascii_lowercase();
    match question.kind {
        QuestionKind::Options(count) => {
            let choice = match reply.as_str() {
                "y" | "yes" => 1,
                "n" | "no" => count,
                other => match other.parse::<usize>() {
                    Ok(n) if n >= 1 && n <= count => n,
                    _ => return None,
                },
            };
            Some(format!("{}{}", ARROW_DOWN.repeat(choice - 1), ENTER))
        }
        QuestionKind::YesNo => match reply.as_str() {
            "y" | "yes" | "1" => Some(format!("y{}", ENTER)),
            "n" | "no" | "2" => Some(format!("n{}", ENTER)),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_detect_option_menu() {
        let out = lines(
            "Edit src/main.rs\nDo you want to make this edit to main.rs?\n❯ 1. Yes\n  2. Yes, allow all edits during this session\n  3. No, and tell Claude what to do differently",
        );
        let q = detect_question(&out).unwrap();
        assert_eq!(q.kind, QuestionKind::Options(3));
        assert_eq!(q.prompt, "Do you want to make this edit to main.rs?");
    }

    #[test]
    fn test_detect_yes_no() {
        let q = detect_question(&lines("Overwrite existing file? [Y/n]")).unwrap();
        assert_eq!(q.kind, QuestionKind::YesNo);
        assert!(detect_question(&lines("Done. 3 files changed.")).is_none());
    }

    #[test]
    fn test_option_answers() {
        let q = PendingQuestion {
            kind: QuestionKind::Options(3),
            prompt: String::new(),
            asked_at: 0,
        };
        assert_eq!(answer_keys(&q, "1").as_deref(), Some("\r"));
        assert_eq!(answer_keys(&q, "3").as_deref(), Some("\x1b[B\x1b[B\r"));
        assert_eq!(answer_keys(&q, "Yes").as_deref(), Some("\r"));
        assert_eq!(answer_keys(&q, "n").as_deref(), Some("\x1b[B\x1b[B\r"));
        assert_eq!(answer_keys(&q, "4"), None);
        assert_eq!(answer_keys(&q, "use a different name"), None);
    }

    #[test]
    fn test_yes_no_answers() {
        let q = PendingQuestion {
            kind: QuestionKind::YesNo,
            prompt: String::new(),
            asked_at: 0,
        };
        assert_eq!(answer_keys(&q, " y ").as_deref(), Some("y\r"));
        assert_eq!(answer_keys(&q, "2").as_deref(), Some("n\r"));
        assert_eq!(answer_keys(&q, "maybe"), None);
    }
}
