//! The `!<plugin> <command> [args…]` invocation surface.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvokeError {
    #[error("not a plugin invocation (expected a leading '!')")]
    NotAnInvocation,

    #[error("missing plugin name after '!'")]
    MissingPlugin,

    #[error("plugin \"{0}\" invoked without a command")]
    MissingCommand(String),
}

/// A parsed `!name command args…` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub plugin: String,
    pub command: String,
    pub args: Vec<String>,
}

/// Tokenize on whitespace, honoring double-quoted substrings as single
/// tokens. No escape processing; an unterminated quote runs to end of line.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut saw_any = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                saw_any = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if saw_any {
                    tokens.push(std::mem::take(&mut current));
                    saw_any = false;
                }
            }
            c => {
                current.push(c);
                saw_any = true;
            }
        }
    }
    if saw_any {
        tokens.push(current);
    }

    tokens
}

/// Parse a command-bar line into an [`Invocation`].
pub fn parse_invocation(line: &str) -> Result<Invocation, InvokeError> {
    let line = line.trim_start();
    let rest = line.strip_prefix('!').ok_or(InvokeError::NotAnInvocation)?;

    let mut tokens = tokenize(rest).into_iter();
    let plugin = tokens.next().filter(|t| !t.is_empty()).ok_or(InvokeError::MissingPlugin)?;
    let command = tokens
        .next()
        .ok_or_else(|| InvokeError::MissingCommand(plugin.clone()))?;

    Ok(Invocation {
        plugin,
        command,
        args: tokens.collect(),
    })
}
