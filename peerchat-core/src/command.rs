//! Interactive command grammar. Anything that is not a known command is chat text.

use std::net::Ipv4Addr;

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/join [-p <port>] <address>`
    Join { address: Ipv4Addr, port: u16 },
    Leave,
    Exit,
    Age(u8),
    Zip(u32),
    Who,
    Message(String),
}

/// Malformed command arguments. Display is the usage hint shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UserInputError {
    #[error("[Join Failure - Expected: /join [-p <port>] <address>]")]
    Join,
    #[error("[Expected: /age <number>]")]
    Age,
    #[error("[Expected: /zip <number>]")]
    Zip,
}

impl Command {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Command>, UserInputError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(None);
        }
        let mut words = line.split_whitespace();
        let cmd = match words.next() {
            Some("/join") => parse_join(words)?,
            Some("/leave") => Command::Leave,
            Some("/exit") => Command::Exit,
            Some("/who") => Command::Who,
            Some("/age") => Command::Age(single(words).ok_or(UserInputError::Age)?),
            Some("/zip") => Command::Zip(single(words).ok_or(UserInputError::Zip)?),
            _ => Command::Message(line.to_string()),
        };
        Ok(Some(cmd))
    }
}

fn parse_join<'a>(mut words: impl Iterator<Item = &'a str>) -> Result<Command, UserInputError> {
    let (port, address) = match words.next() {
        Some("-p") => {
            let port = words
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or(UserInputError::Join)?;
            (port, words.next())
        }
        other => (DEFAULT_PORT, other),
    };
    let address = address
        .and_then(|a| a.parse().ok())
        .ok_or(UserInputError::Join)?;
    if words.next().is_some() {
        return Err(UserInputError::Join);
    }
    Ok(Command::Join { address, port })
}

fn single<'a, T: std::str::FromStr>(mut words: impl Iterator<Item = &'a str>) -> Option<T> {
    let value = words.next()?.parse().ok()?;
    words.next().is_none().then_some(value)
}
