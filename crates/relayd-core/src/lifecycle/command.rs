//! Remote command lines for interactive sessions
//!
//! The engine runs inside a login shell so the remote PATH (nvm, homebrew,
//! cargo) is the one the user gets interactively. Just before the engine
//! starts, the shell prints a ready marker; seeing it proves the connection
//! is up and the working directory exists.

use crate::config::PROMPT_PLACEHOLDER;
use crate::ssh::quote;
use crate::types::{OutputMode, TargetOs};

pub const READY_MARKER: &str = "__RELAYD_READY__";

// Printed in two halves so the marker never appears in the command text itself
const READY_MARKER_HEAD: &str = "__RELAYD_";
const READY_MARKER_TAIL: &str = "READY__";

const STREAM_JSON_FLAGS: &str =
    "--print --output-format stream-json --input-format stream-json --verbose";

/// Engine invocation plus the prompt to send as the first input, if the
/// prompt isn't passed on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInvocation {
    pub command: String,
    pub initial_input: Option<String>,
}

/// Expand an engine template for the output mode and target shell
pub fn engine_invocation(template: &str, prompt: &str, mode: OutputMode, os: TargetOs) -> EngineInvocation {
    let prompt = prompt.trim();
    let initial = (!prompt.is_empty()).then(|| prompt.to_string());

    match mode {
        OutputMode::StreamJson => {
            // stream-json input takes the prompt on stdin
            let base = collapse_spaces(&template.replace(PROMPT_PLACEHOLDER, ""));
            EngineInvocation {
                command: format!("{} {}", base, STREAM_JSON_FLAGS),
                initial_input: initial,
            }
        }
        OutputMode::RawTerminal if template.contains(PROMPT_PLACEHOLDER) => {
            let arg = match (prompt.is_empty(), os) {
                (true, _) => String::new(),
                (false, TargetOs::Posix) => quote::posix(prompt),
                (false, TargetOs::Windows) => quote::cmd(prompt),
            };
            EngineInvocation {
                command: template.replace(PROMPT_PLACEHOLDER, &arg).trim().to_string(),
                initial_input: None,
            }
        }
        OutputMode::RawTerminal => EngineInvocation {
            command: template.trim().to_string(),
            initial_input: initial,
        },
    }
}

/// Full remote command: enter `path`, print the ready marker, run the engine
pub fn session_command(path: &str, engine: &str, os: TargetOs) -> String {
    match os {
        TargetOs::Posix => {
            let inner = format!(
                "cd {} && printf '%s%s\\n' {} {} && exec {}",
                quote::posix_path(path),
                READY_MARKER_HEAD,
                READY_MARKER_TAIL,
                engine
            );
            format!("exec \"$SHELL\" -lc {}", quote::posix(&inner))
        }
        TargetOs::Windows => format!(
            "cd /d {} && echo {}^{} && {}",
            windows_path(path),
            READY_MARKER_HEAD,
            READY_MARKER_TAIL,
            engine
        ),
    }
}

/// `cmd.exe` path with `~` mapped to the user profile
fn windows_path(path: &str) -> String {
    if path == "~" {
        return "\"%USERPROFILE%\"".to_string();
    }
    match path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        Some(rest) => format!(
            "\"%USERPROFILE%\\{}\"",
            quote::cmd_inner(&rest.replace('/', "\\").replace('"', ""))
        ),
        None => quote::cmd(path),
    }
}

fn collapse_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_halves() {
        assert_eq!(format!("{}{}", READY_MARKER_HEAD, READY_MARKER_TAIL), READY_MARKER);
    }

    #[test]
    fn test_posix_session_command() {
        let cmd = session_command("~/my proj", "claude", TargetOs::Posix);
        assert!(cmd.starts_with("exec \"$SHELL\" -lc '"));
        assert!(cmd.contains("exec claude"));
        assert!(cmd.contains("__RELAYD_ READY__"));
        assert!(!cmd.contains(READY_MARKER));
    }

    #[test]
    fn test_windows_session_command() {
        let cmd = session_command("~/src/app", "claude", TargetOs::Windows);
        assert_eq!(
            cmd,
            "cd /d \"%USERPROFILE%\\src\\app\" && echo __RELAYD_^READY__ && claude"
        );
        let cmd = session_command(r"D:\work", "codex", TargetOs::Windows);
        assert!(cmd.starts_with(r#"cd /d "D:\work" && "#));
    }

    #[test]
    fn test_raw_prompt_placeholder() {
        let inv = engine_invocation("claude {prompt}", "fix it's bug", OutputMode::RawTerminal, TargetOs::Posix);
        assert_eq!(inv.command, r"claude 'fix it'\''s bug'");
        assert_eq!(inv.initial_input, None);

        let inv = engine_invocation("claude {prompt}", "", OutputMode::RawTerminal, TargetOs::Posix);
        assert_eq!(inv.command, "claude");
    }

    #[test]
    fn test_windows_prompt_does_not_expand_variables() {
        let inv = engine_invocation("claude {prompt}", "print %PATH%", OutputMode::RawTerminal, TargetOs::Windows);
        assert_eq!(inv.command, r#"claude "print "^%"PATH"^%"""#);

        let cmd = session_command("~/50%off", "claude", TargetOs::Windows);
        assert!(cmd.starts_with(r#"cd /d "%USERPROFILE%("^%"off" && "#));
    }

    #[test]
    fn test_raw_without_placeholder_sends_prompt_as_input() {
        let inv = engine_invocation("claude", "fix the tests", OutputMode::RawTerminal, TargetOs::Posix);
        assert_eq!(inv.command, "claude");
        assert_eq!(inv.initial_input.as_deref(), Some("fix the tests"));
    }

    #[test]
    fn test_stream_json_flags() {
        let inv = engine_invocation("claude {prompt}", "hello", OutputMode::StreamJson, TargetOs::Posix);
        assert_eq!(
            inv.command,
            "claude --print --output-format stream-json --input-format stream-json --verbose"
        );
        assert_eq!(inv.initial_input.as_deref(), Some("hello"));
    }
}
