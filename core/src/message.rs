//! Protocol line splitting and command identification
//!
//! A protocol line is `<COMMAND> <space-separated args>[ :<trailing text>]`.
//! This module splits raw lines into a verb and its argument tail and maps
//! verbs onto a closed command set so dispatch is exhaustive.

use std::fmt;

/// Command verbs understood by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pass,
    Nick,
    User,
    Join,
    Part,
    PrivMsg,
    Ping,
    Quit,
    Kick,
    Invite,
    Topic,
    Mode,
    /// Anything else, kept verbatim for the error reply.
    Unknown(String),
}

impl Command {
    /// Whether the dispatcher refuses this command before full registration.
    pub fn requires_registration(&self) -> bool {
        matches!(
            self,
            Command::Join
                | Command::Part
                | Command::PrivMsg
                | Command::Kick
                | Command::Invite
                | Command::Topic
                | Command::Mode
        )
    }
}

impl From<&str> for Command {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "PASS" => Command::Pass,
            "NICK" => Command::Nick,
            "USER" => Command::User,
            "JOIN" => Command::Join,
            "PART" => Command::Part,
            "PRIVMSG" => Command::PrivMsg,
            "PING" => Command::Ping,
            "QUIT" => Command::Quit,
            "KICK" => Command::Kick,
            "INVITE" => Command::Invite,
            "TOPIC" => Command::Topic,
            "MODE" => Command::Mode,
            _ => Command::Unknown(s.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Pass => "PASS",
            Command::Nick => "NICK",
            Command::User => "USER",
            Command::Join => "JOIN",
            Command::Part => "PART",
            Command::PrivMsg => "PRIVMSG",
            Command::Ping => "PING",
            Command::Quit => "QUIT",
            Command::Kick => "KICK",
            Command::Invite => "INVITE",
            Command::Topic => "TOPIC",
            Command::Mode => "MODE",
            Command::Unknown(v) => v,
        };
        write!(f, "{}", s)
    }
}

/// Split a line into its verb and the argument tail.
pub fn split_command(line: &str) -> (&str, &str) {
    let line = line.trim_start();
    match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], line[i..].trim_start()),
        None => (line, ""),
    }
}

/// Pop the next whitespace-delimited token off an argument tail.
/// Returns the token and the remainder (leading whitespace preserved).
pub fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

/// Interpret the rest of an argument tail as trailing text, stripping an
/// optional leading colon.
pub fn trailing(s: &str) -> &str {
    let s = s.trim_start();
    s.strip_prefix(':').unwrap_or(s)
}

/// Prefix for lines relayed on behalf of a user: `nick!user@host`.
pub fn user_prefix(nick: &str, user: &str, host: &str) -> String {
    format!("{}!{}@{}", nick, user, host)
}
