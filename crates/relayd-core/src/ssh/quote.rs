//! Quoting for remote command strings
//!
//! Paths may start with `~`, which must still expand to the remote home
//! directory after quoting.

/// Single-quote for a POSIX shell
pub fn posix(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote a path for a POSIX shell, keeping `~` expandable
pub fn posix_path(path: &str) -> String {
    if path == "~" {
        return "\"$HOME\"".to_string();
    }
    match path.strip_prefix("~/") {
        Some("") => "\"$HOME\"".to_string(),
        Some(rest) => format!("\"$HOME\"/{}", posix(rest)),
        None => posix(path),
    }
}

/// Single-quote for PowerShell
pub fn powershell(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// PowerShell expression for a path, keeping `~` relative to `$HOME`
pub fn powershell_path(path: &str) -> String {
    if path == "~" {
        return "$HOME".to_string();
    }
    match path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        Some("") => "$HOME".to_string(),
        Some(rest) => format!("(Join-Path $HOME {})", powershell(rest)),
        None => powershell(path),
    }
}

/// Wrap a PowerShell script for `cmd.exe`, the default OpenSSH shell on Windows
pub fn powershell_command(script: &str) -> String {
    format!(
        "powershell -NoProfile -NonInteractive -Command \"{}\"",
        script.replace('"', "\\\"")
    )
}

/// Double-quote for `cmd.exe`. Each `%` steps outside the quotes behind a
/// caret, so `%VAR%` reaches the program literally.
pub fn cmd(s: &str) -> String {
    format!("\"{}\"", cmd_inner(s))
}

/// Body of a `cmd.exe` double-quoted string, for callers that open the quote
pub fn cmd_inner(s: &str) -> String {
    s.replace('"', "\"\"").replace('%', "\"^%\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_quoting() {
        assert_eq!(posix("it's"), r"'it'\''s'");
        assert_eq!(posix_path("~"), "\"$HOME\"");
        assert_eq!(posix_path("~/my proj"), "\"$HOME\"/'my proj'");
        assert_eq!(posix_path("/srv/a b"), "'/srv/a b'");
    }

    #[test]
    fn test_powershell_quoting() {
        assert_eq!(powershell("O'Neil"), "'O''Neil'");
        assert_eq!(powershell_path("~"), "$HOME");
        assert_eq!(powershell_path("~/src"), "(Join-Path $HOME 'src')");
        assert_eq!(powershell_path(r"C:\src"), r"'C:\src'");
        assert_eq!(
            powershell_command("Write-Output \"x\""),
            r#"powershell -NoProfile -NonInteractive -Command "Write-Output \"x\"""#
        );
    }

    #[test]
    fn test_cmd_quoting_keeps_percent_literal() {
        assert_eq!(cmd(r"C:\my proj"), r#""C:\my proj""#);
        assert_eq!(cmd(r#"say "hi""#), r#""say ""hi""""#);
        assert_eq!(cmd("echo %PATH%"), r#""echo "^%"PATH"^%"""#);
        assert!(!cmd("100% of %USERNAME%").contains("%USERNAME%"));
    }
}
