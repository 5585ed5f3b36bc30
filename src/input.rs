//! Operator console input.
//!
//! Maps one line of text to a [`Command`].  Executing it is the binary's
//! job; this module only parses, so adding a command is a new variant plus
//! a match arm in [`parse_command`].
//!
//! ## For contributors
//!
//! To add a command:
//!
//! 1. Add the operation on [`crate::Relay`] (if one doesn't exist).
//! 2. Add a variant to [`Command`] and a match arm in [`parse_command`].
//! 3. Handle it in `main.rs` and extend [`HELP`].

use thiserror::Error;

use crate::item::DestinationId;

/// Items delivered by `fetch` when no limit is given.
pub const DEFAULT_FETCH_LIMIT: usize = 3;

/// Accounts listed by `search` when no limit is given.
pub const DEFAULT_SEARCH_LIMIT: usize = 5;

pub const HELP: &str = "\
commands:
  follow <handle> <destination>
  unfollow <handle> <destination>
  list <destination>
  fetch <handle> <destination> [limit]
  search <query> [limit]
  forget <destination>...
  help
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Follow {
        handle: String,
        destination: DestinationId,
    },
    Unfollow {
        handle: String,
        destination: DestinationId,
    },
    List {
        destination: DestinationId,
    },
    Fetch {
        handle: String,
        destination: DestinationId,
        limit: usize,
    },
    /// Free-text account lookup; the query may span several words.
    Search {
        query: String,
        limit: usize,
    },
    /// Destinations that no longer exist (deleted channel, left guild).
    Forget {
        destinations: Vec<DestinationId>,
    },
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty input")]
    Empty,
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("{0:?} is not a valid number")]
    NotANumber(String),
}

fn number<T: std::str::FromStr>(raw: &str) -> Result<T, ParseError> {
    raw.parse()
        .map_err(|_| ParseError::NotANumber(raw.to_string()))
}

fn destination(raw: &str) -> Result<DestinationId, ParseError> {
    number(raw).map(DestinationId)
}

/// Parse a single console line.
pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((name, args)) = words.split_first() else {
        return Err(ParseError::Empty);
    };

    match (name.to_lowercase().as_str(), args) {
        ("follow", [handle, dest]) => Ok(Command::Follow {
            handle: handle.to_string(),
            destination: destination(dest)?,
        }),
        ("follow", _) => Err(ParseError::Usage("follow <handle> <destination>")),

        ("unfollow", [handle, dest]) => Ok(Command::Unfollow {
            handle: handle.to_string(),
            destination: destination(dest)?,
        }),
        ("unfollow", _) => Err(ParseError::Usage("unfollow <handle> <destination>")),

        ("list", [dest]) => Ok(Command::List {
            destination: destination(dest)?,
        }),
        ("list", _) => Err(ParseError::Usage("list <destination>")),

        ("fetch", [handle, dest, rest @ ..]) if rest.len() <= 1 => Ok(Command::Fetch {
            handle: handle.to_string(),
            destination: destination(dest)?,
            limit: match rest.first() {
                Some(raw) => number(raw)?,
                None => DEFAULT_FETCH_LIMIT,
            },
        }),
        ("fetch", _) => Err(ParseError::Usage("fetch <handle> <destination> [limit]")),

        ("search", words) if !words.is_empty() => {
            // A trailing number is the limit, unless it is the whole query.
            let (query, limit) = match words.split_last() {
                Some((last, rest)) if !rest.is_empty() && last.parse::<usize>().is_ok() => {
                    (rest, number(last)?)
                }
                _ => (words, DEFAULT_SEARCH_LIMIT),
            };
            Ok(Command::Search {
                query: query.join(" "),
                limit,
            })
        }
        ("search", _) => Err(ParseError::Usage("search <query> [limit]")),

        ("forget", dests) if !dests.is_empty() => Ok(Command::Forget {
            destinations: dests
                .iter()
                .map(|d| destination(d))
                .collect::<Result<_, _>>()?,
        }),
        ("forget", _) => Err(ParseError::Usage("forget <destination>...")),

        ("help" | "?", _) => Ok(Command::Help),
        ("quit" | "exit", _) => Ok(Command::Quit),
        (other, _) => Err(ParseError::Unknown(other.to_string())),
    }
}
