//! Directory browsing navigator
//!
//! Before a session starts, the thread walks the remote filesystem to pick a
//! working directory. [`parse_input`] turns a reply into a [`NavAction`];
//! listing commands are built per target OS at the last moment.

use serde::{Deserialize, Serialize};

use crate::ssh::quote;
use crate::types::{DispatchMode, OutputMode, TargetOs};

/// Per-thread browsing state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowsingSession {
    pub thread_id: String,
    pub chat_id: String,
    pub machine: String,
    pub current_path: String,
    /// Task prompt handed to the engine on start
    pub prompt: String,
    pub engine: String,
    pub output_mode: OutputMode,
    pub dispatch: DispatchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    /// Unix millis
    pub created_at: i64,
    /// Paths visited before the current one, most recent last
    pub history: Vec<String>,
    pub last_listing: Vec<String>,
}

impl BrowsingSession {
    /// Record a successful navigation
    pub fn navigate_to(&mut self, path: String, listing: Vec<String>) {
        let previous = std::mem::replace(&mut self.current_path, path);
        self.history.push(previous);
        self.last_listing = listing;
    }

    /// Project label for transcripts: explicit name, else the last path segment
    pub fn project_name(&self) -> String {
        if let Some(ref project) = self.project {
            return project.clone();
        }
        self.current_path
            .trim_end_matches(['/', '\\'])
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.current_path)
            .to_string()
    }
}

/// Outcome of one browsing reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavAction {
    /// Start the session in the current directory
    Start,
    Navigate(String),
    Error(String),
}

/// Resolve a reply against the current browsing state
pub fn parse_input(raw: &str, session: &BrowsingSession) -> NavAction {
    let input = raw.trim();

    if input == "0" || input.eq_ignore_ascii_case("go") || input.eq_ignore_ascii_case("start") {
        return NavAction::Start;
    }

    if input == ".." {
        return match parent_path(&session.current_path) {
            Some(parent) => NavAction::Navigate(parent),
            None => NavAction::Error(format!(
                "Already at {}; there is no parent to go up to.",
                session.current_path
            )),
        };
    }

    if is_absolute(input) {
        return NavAction::Navigate(input.to_string());
    }

    if is_integer(input) {
        let count = session.last_listing.len();
        return match input.trim_start_matches('+').parse::<usize>() {
            Ok(n) if n >= 1 && n <= count => {
                NavAction::Navigate(join_path(&session.current_path, &session.last_listing[n - 1]))
            }
            _ if count == 0 => NavAction::Error(format!(
                "{} is out of range: this directory has no subdirectories.",
                input
            )),
            _ => NavAction::Error(format!("{} is out of range (1-{}).", input, count)),
        };
    }

    NavAction::Error(format!(
        "Unrecognized input {:?}. Reply with a folder number, .. to go up, an absolute path, or 0 to start here.",
        input
    ))
}

fn is_integer(s: &str) -> bool {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn is_absolute(s: &str) -> bool {
    s.starts_with('/') || s.starts_with('~') || is_drive_path(s)
}

/// `C:\` or `C:/`
fn is_drive_path(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Parent of `path`, or `None` at a root-like path (`~`, `/`, a drive root,
/// or a single segment)
pub fn parent_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches(is_separator);
    if trimmed.is_empty() || trimmed == "~" {
        return None;
    }
    if trimmed.len() == 2 && is_drive_path(&format!("{}\\", trimmed)) {
        return None;
    }

    let idx = trimmed.rfind(is_separator)?;
    let parent = &trimmed[..idx];
    if parent.is_empty() {
        return Some("/".to_string());
    }
    if parent.len() == 2 && parent.ends_with(':') {
        return Some(format!("{}{}", parent, &trimmed[idx..idx + 1]));
    }
    Some(parent.to_string())
}

/// Append a listing entry to a directory path using the path's own separator
pub fn join_path(base: &str, name: &str) -> String {
    if base.ends_with(is_separator) {
        return format!("{}{}", base, name);
    }
    let sep = if base.contains('\\') && !base.contains('/') {
        '\\'
    } else {
        '/'
    };
    format!("{}{}{}", base, sep, name)
}

/// Exit code the listing command uses when the directory doesn't exist
pub const LISTING_NO_DIR_EXIT: i32 = 2;

/// Remote command printing the non-hidden subdirectories of `path`, one per
/// line, sorted by name
pub fn listing_command(path: &str, os: TargetOs) -> String {
    match os {
        TargetOs::Posix => format!(
            "cd {} 2>/dev/null || exit {}; find . -mindepth 1 -maxdepth 1 -type d ! -name '.*' | sed 's#^\\./##' | LC_ALL=C sort",
            quote::posix_path(path),
            LISTING_NO_DIR_EXIT
        ),
        TargetOs::Windows => quote::powershell_command(&format!(
            "$p = {}; if (-not (Test-Path -LiteralPath $p -PathType Container)) {{ exit {} }}; \
             Get-ChildItem -LiteralPath $p -Directory | Where-Object {{ -not $_.Name.StartsWith('.') }} | \
             Sort-Object Name | ForEach-Object {{ $_.Name }}",
            quote::powershell_path(path),
            LISTING_NO_DIR_EXIT
        )),
    }
}

/// Parse listing output into directory names, preserving order
pub fn parse_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(|line| line.trim().trim_end_matches(is_separator))
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
        .collect()
}

/// Chat rendering of the current directory and its choices
pub fn render_listing(session: &BrowsingSession) -> String {
    let mut out = format!("📂 {}:{}\n\n0. ▶ Start here\n", session.machine, session.current_path);
    if session.last_listing.is_empty() {
        out.push_str("(no subdirectories)\n");
    }
    for (i, name) in session.last_listing.iter().enumerate() {
        out.push_str(&format!("{}. {}/\n", i + 1, name));
    }
    out.push_str("\nReply with a number, .. to go up, or a path.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(path: &str, listing: &[&str]) -> BrowsingSession {
        BrowsingSession {
            thread_id: "t1".to_string(),
            chat_id: "c1".to_string(),
            machine: "buildbox".to_string(),
            current_path: path.to_string(),
            prompt: "fix the tests".to_string(),
            engine: "claude".to_string(),
            output_mode: OutputMode::RawTerminal,
            dispatch: DispatchMode::Inline,
            project: None,
            parent_task_id: None,
            created_at: 0,
            history: Vec::new(),
            last_listing: listing.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_start_tokens() {
        let s = session("~/proj", &["lib"]);
        for token in ["0", "go", "GO", "Start", " start "] {
            assert_eq!(parse_input(token, &s), NavAction::Start, "{token:?}");
        }
    }

    #[test]
    fn test_numeric_selection() {
        let s = session("~/proj", &["lib", "src", "test"]);
        assert_eq!(parse_input("1", &s), NavAction::Navigate("~/proj/lib".to_string()));
        assert_eq!(parse_input("2", &s), NavAction::Navigate("~/proj/src".to_string()));
        assert_eq!(parse_input("3", &s), NavAction::Navigate("~/proj/test".to_string()));
        assert!(matches!(parse_input("4", &s), NavAction::Error(ref m) if m.contains("out of range")));
        assert!(matches!(parse_input("-1", &s), NavAction::Error(ref m) if m.contains("out of range")));
        assert!(matches!(
            parse_input("99999999999999999999999", &s),
            NavAction::Error(ref m) if m.contains("out of range")
        ));
    }

    #[test]
    fn test_parent_navigation() {
        assert_eq!(
            parse_input("..", &session("~/a/b", &[])),
            NavAction::Navigate("~/a".to_string())
        );
        assert!(matches!(parse_input("..", &session("~", &[])), NavAction::Error(_)));
        assert!(matches!(parse_input("..", &session("/", &[])), NavAction::Error(_)));
        assert!(matches!(parse_input("..", &session("proj", &[])), NavAction::Error(_)));
        assert_eq!(parent_path("/home"), Some("/".to_string()));
        assert_eq!(parent_path("~/a/"), Some("~".to_string()));
        assert_eq!(parent_path(r"C:\src\app"), Some(r"C:\src".to_string()));
        assert_eq!(parent_path(r"C:\src"), Some(r"C:\".to_string()));
        assert_eq!(parent_path(r"C:\"), None);
    }

    #[test]
    fn test_literal_paths_and_garbage() {
        let s = session("~/proj", &["lib"]);
        assert_eq!(parse_input("/srv/app", &s), NavAction::Navigate("/srv/app".to_string()));
        assert_eq!(parse_input("~/other", &s), NavAction::Navigate("~/other".to_string()));
        assert_eq!(parse_input(r"D:\work", &s), NavAction::Navigate(r"D:\work".to_string()));
        assert!(matches!(parse_input("lib", &s), NavAction::Error(ref m) if m.contains("Unrecognized")));
        assert!(matches!(parse_input("", &s), NavAction::Error(_)));
    }

    #[test]
    fn test_join_uses_path_separator() {
        assert_eq!(join_path("~/proj", "src"), "~/proj/src");
        assert_eq!(join_path("/", "srv"), "/srv");
        assert_eq!(join_path(r"C:\work", "app"), r"C:\work\app");
    }

    #[test]
    fn test_navigate_to_pushes_history() {
        let mut s = session("~/proj", &["lib", "src"]);
        s.navigate_to("~/proj/src".to_string(), vec!["bin".to_string()]);
        assert_eq!(s.current_path, "~/proj/src");
        assert_eq!(s.history, vec!["~/proj"]);
        assert_eq!(s.last_listing, vec!["bin"]);
        assert_eq!(s.project_name(), "src");
    }

    #[test]
    fn test_listing_commands() {
        let posix = listing_command("~/my proj", TargetOs::Posix);
        assert!(posix.starts_with("cd \"$HOME\"/'my proj' 2>/dev/null || exit 2;"));
        assert!(posix.contains("-type d"));

        let win = listing_command(r"C:\work", TargetOs::Windows);
        assert!(win.starts_with("powershell -NoProfile -NonInteractive -Command"));
        assert!(win.contains(r"$p = 'C:\work'"));
        assert!(win.contains("Get-ChildItem -LiteralPath $p -Directory"));
    }

    #[test]
    fn test_parse_and_render_listing() {
        let listing = parse_listing("lib/\r\nsrc\n\n.\ntest\n");
        assert_eq!(listing, vec!["lib", "src", "test"]);

        let mut s = session("~/proj", &[]);
        s.last_listing = listing;
        let text = render_listing(&s);
        assert!(text.contains("buildbox:~/proj"));
        assert!(text.contains("0. ▶ Start here"));
        assert!(text.contains("2. src/"));
    }
}
