//! Line protocol of the interactive session.

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    /// `:use <id>`
    Use(String),
    /// `:list`
    List,
    /// `:quit`, `:q` or `:exit`
    Quit,
    /// `:help`
    Help,
    /// Any other `:`-prefixed line.
    Unknown(String),
    /// Whitespace only.
    Empty,
    /// Code for the active backend.
    Code(String),
}

pub const HELP: &str = "\
:use <id>   switch the active backend
:list       list available backends
:quit       leave the session
anything else is executed by the active backend";

impl ReplCommand {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return ReplCommand::Empty;
        }
        let Some(directive) = trimmed.strip_prefix(':') else {
            return ReplCommand::Code(line.to_string());
        };

        let mut parts = directive.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("use"), Some(id), None) => ReplCommand::Use(id.to_string()),
            (Some("list"), None, _) => ReplCommand::List,
            (Some("quit" | "q" | "exit"), None, _) => ReplCommand::Quit,
            (Some("help"), None, _) => ReplCommand::Help,
            _ => ReplCommand::Unknown(trimmed.to_string()),
        }
    }
}
