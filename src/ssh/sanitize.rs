//! Command sanitization and quoting utilities
//!
//! Provides functions for validating commands and quoting shell words before
//! they are sent to a remote shell.

use crate::error::{RemoteError, Result};

/// Sanitize a command before execution
///
/// Trims surrounding whitespace and rejects commands that are empty
/// afterwards.
///
/// # Examples
/// ```
/// use ssh_remote::ssh::sanitize::sanitize_command;
///
/// let cmd = sanitize_command("  ls -la  ").unwrap();
/// assert_eq!(cmd, "ls -la");
///
/// assert!(sanitize_command("   ").is_err());
/// ```
pub fn sanitize_command(command: &str) -> Result<String> {
    let trimmed = command.trim();

    if trimmed.is_empty() {
        return Err(RemoteError::invalid_argument("Command cannot be empty"));
    }

    Ok(trimmed.to_string())
}

/// Escape single quotes for use inside a single-quoted shell string
///
/// `'word'` becomes `'"'"'word'"'"'`: close the quote, add a literal quote
/// via double quotes, reopen the quote.
///
/// # Example
/// ```
/// use ssh_remote::ssh::sanitize::escape_single_quotes;
///
/// assert_eq!(escape_single_quotes("it's"), "it'\"'\"'s");
/// ```
pub fn escape_single_quotes(s: &str) -> String {
    s.replace('\'', "'\"'\"'")
}

/// Quote one shell word, leaving plain words untouched
///
/// # Example
/// ```
/// use ssh_remote::ssh::sanitize::quote_for_shell;
///
/// assert_eq!(quote_for_shell("/home/alice"), "/home/alice");
/// assert_eq!(quote_for_shell("/srv/my dir"), "'/srv/my dir'");
/// ```
pub fn quote_for_shell(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_shell_safe) {
        return word.to_string();
    }
    format!("'{}'", escape_single_quotes(word))
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '+' | ',' | ':' | '@' | '%' | '=')
}

/// `cd <dir> && <command>` with the directory quoted when needed
pub fn in_directory(dir: &str, command: &str) -> String {
    format!("cd {} && {}", quote_for_shell(dir), command)
}
