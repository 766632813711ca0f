//! Line commands read from stdin.

use thiserror::Error;

/// A session named on the command line: `#n` (1-based position) or a full id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRef {
    Index(usize),
    Id(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontChange {
    Next,
    Larger,
    Smaller,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open { path: String },
    Reload { path: String },
    Changed { path: String },
    Close { session: SessionRef },
    CloseAll,
    Switch { session: SessionRef },
    Rename { session: SessionRef, name: String },
    QueryMode { active: bool },
    Query { text: String },
    ClearQuery,
    More,
    List,
    Show,
    CheckUpdate,
    Theme { dark: bool },
    Font(FontChange),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

pub const HELP: &str = "\
open <path>            open or activate a file
reload <path>          force-reload an open file
changed <path>         report an on-disk change
close <#n|id|all>      close a session
switch <#n|id>         activate a session
rename <#n|id> <name>  rename a session
sql on|off             toggle query mode
query <text>           run the shared query
clear                  clear the shared query
more                   load the next page
list                   list sessions
show                   print the current view
check-update           compare against the newest release
theme light|dark       set the theme
font next|+|-          change the font
quit";

pub fn parse_session_ref(raw: &str) -> Result<SessionRef, ParseError> {
    match raw.strip_prefix('#') {
        Some(index) => index
            .parse::<usize>()
            .ok()
            .filter(|index| *index > 0)
            .map(SessionRef::Index)
            .ok_or(ParseError::Usage("session must be #<n> with n >= 1, or an id")),
        None => Ok(SessionRef::Id(raw.to_string())),
    }
}

pub fn parse_command(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("//") {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let required = |usage: &'static str| {
        if rest.is_empty() {
            Err(ParseError::Usage(usage))
        } else {
            Ok(rest.to_string())
        }
    };

    let command = match word {
        "open" => Command::Open {
            path: required("open <path>")?,
        },
        "reload" => Command::Reload {
            path: required("reload <path>")?,
        },
        "changed" => Command::Changed {
            path: required("changed <path>")?,
        },
        "close" if rest == "all" => Command::CloseAll,
        "close" => Command::Close {
            session: parse_session_ref(&required("close <#n|id|all>")?)?,
        },
        "switch" => Command::Switch {
            session: parse_session_ref(&required("switch <#n|id>")?)?,
        },
        "rename" => {
            let usage = "rename <#n|id> <name>";
            let (session, name) = rest.split_once(char::is_whitespace).ok_or(ParseError::Usage(usage))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(ParseError::Usage(usage));
            }
            Command::Rename {
                session: parse_session_ref(session)?,
                name: name.to_string(),
            }
        }
        "sql" => match rest {
            "on" => Command::QueryMode { active: true },
            "off" => Command::QueryMode { active: false },
            _ => return Err(ParseError::Usage("sql on|off")),
        },
        "query" => Command::Query {
            text: required("query <text>")?,
        },
        "clear" => Command::ClearQuery,
        "more" => Command::More,
        "list" | "ls" => Command::List,
        "show" => Command::Show,
        "check-update" => Command::CheckUpdate,
        "theme" => match rest {
            "dark" => Command::Theme { dark: true },
            "light" => Command::Theme { dark: false },
            _ => return Err(ParseError::Usage("theme light|dark")),
        },
        "font" => match rest {
            "next" => Command::Font(FontChange::Next),
            "+" => Command::Font(FontChange::Larger),
            "-" => Command::Font(FontChange::Smaller),
            _ => return Err(ParseError::Usage("font next|+|-")),
        },
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
