//! Parses one line of terminal input.

use thiserror::Error;

pub const HELP: &str = "\
  90 3c 64      send raw MIDI bytes (hex)
  /ping         measure latency to the peer
  /note         send a test note (C4 on, off after 500 ms)
  /chat <text>  send a chat line
  /sync         share local settings with the peer
  /quit         disconnect and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    Midi(Vec<u8>),
    Ping,
    Note,
    Chat(String),
    Sync,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command {0}; try /help")]
    UnknownCommand(String),
    #[error("{0:?} is not a hex byte")]
    InvalidByte(String),
    #[error("/chat needs a message")]
    EmptyChat,
}

pub fn parse_line(line: &str) -> Result<Input, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(command) = line.strip_prefix('/') else {
        return parse_hex(line).map(Input::Midi);
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, rest)| (name, rest.trim()));
    match name.to_ascii_lowercase().as_str() {
        "ping" | "latency" => Ok(Input::Ping),
        "note" | "test" => Ok(Input::Note),
        "sync" => Ok(Input::Sync),
        "help" | "?" => Ok(Input::Help),
        "quit" | "exit" => Ok(Input::Quit),
        "chat" if rest.is_empty() => Err(ParseError::EmptyChat),
        "chat" => Ok(Input::Chat(rest.to_string())),
        _ => Err(ParseError::UnknownCommand(format!("/{name}"))),
    }
}

/// Bytes separated by spaces or commas, with or without a `0x` prefix.
fn parse_hex(line: &str) -> Result<Vec<u8>, ParseError> {
    line.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .map(|token| {
            let digits = token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token);
            u8::from_str_radix(digits, 16).map_err(|_| ParseError::InvalidByte(token.to_string()))
        })
        .collect()
}
