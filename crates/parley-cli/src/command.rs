//! Parsing of REPL input lines.

use thiserror::Error;

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send a user message.
    Say(String),
    /// Regenerate an assistant reply; the last one when no index is given.
    Reload(Option<usize>),
    /// Delete a message and its turn partner.
    Delete(usize),
    /// Replace the content of a message.
    Edit(usize, String),
    /// Stop the running request.
    Stop,
    /// Set the system prompt.
    System(String),
    /// Print the conversation.
    History,
    /// Print the command list.
    Help,
    /// Leave the REPL.
    Quit,
}

/// Errors from parsing an input line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Unknown slash command.
    #[error("unknown command: /{0} (try /help)")]
    UnknownCommand(String),

    /// A required argument is missing.
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    /// A message number is not a positive integer.
    #[error("invalid message number: {0}")]
    InvalidIndex(String),
}

/// Command list printed by `/help`.
pub const HELP: &str = "\
Commands:
  <text>             send a message
  /reload [n]        regenerate reply n (default: the last reply)
  /delete <n>        delete message n and its turn partner
  /edit <n> <text>   replace the content of message n
  /stop              stop the running reply
  /system <text>     set the system prompt
  /history           list the conversation
  /quit              exit";

impl Command {
    /// Parse one input line. Returns `None` for a blank line.
    ///
    /// Message numbers are 1-based positions in the visible conversation.
    ///
    /// # Errors
    ///
    /// Returns a `ParseError` for unknown commands and bad arguments.
    pub fn parse(line: &str) -> Result<Option<Self>, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Self::Say(line.to_string())));
        };

        let (name, args) = rest
            .split_once(char::is_whitespace)
            .map_or((rest, ""), |(name, args)| (name, args.trim()));

        let command = match name {
            "reload" => Self::Reload(if args.is_empty() {
                None
            } else {
                Some(parse_index(args)?)
            }),
            "delete" => Self::Delete(parse_index(required(args, "message number")?)?),
            "edit" => {
                let args = required(args, "message number")?;
                let (index, text) = args
                    .split_once(char::is_whitespace)
                    .ok_or(ParseError::MissingArgument("text"))?;
                Self::Edit(parse_index(index)?, text.trim().to_string())
            }
            "stop" => Self::Stop,
            "system" => Self::System(required(args, "prompt")?.to_string()),
            "history" => Self::History,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(ParseError::UnknownCommand(other.to_string())),
        };

        Ok(Some(command))
    }
}

fn required<'a>(args: &'a str, what: &'static str) -> Result<&'a str, ParseError> {
    if args.is_empty() {
        Err(ParseError::MissingArgument(what))
    } else {
        Ok(args)
    }
}

fn parse_index(raw: &str) -> Result<usize, ParseError> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ParseError::InvalidIndex(raw.trim().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            Command::parse("  hello there \n").unwrap(),
            Some(Command::Say("hello there".into()))
        );
        assert_eq!(Command::parse("   ").unwrap(), None);
    }

    #[test]
    fn slash_commands() {
        assert_eq!(Command::parse("/reload").unwrap(), Some(Command::Reload(None)));
        assert_eq!(
            Command::parse("/reload 4").unwrap(),
            Some(Command::Reload(Some(4)))
        );
        assert_eq!(Command::parse("/delete 2").unwrap(), Some(Command::Delete(2)));
        assert_eq!(
            Command::parse("/edit 3   new  text ").unwrap(),
            Some(Command::Edit(3, "new  text".into()))
        );
        assert_eq!(Command::parse("/stop").unwrap(), Some(Command::Stop));
        assert_eq!(
            Command::parse("/system You are terse").unwrap(),
            Some(Command::System("You are terse".into()))
        );
        assert_eq!(Command::parse("/history").unwrap(), Some(Command::History));
        assert_eq!(Command::parse("/exit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn bad_arguments() {
        assert_eq!(
            Command::parse("/delete"),
            Err(ParseError::MissingArgument("message number"))
        );
        assert_eq!(
            Command::parse("/delete 0"),
            Err(ParseError::InvalidIndex("0".into()))
        );
        assert_eq!(
            Command::parse("/edit 2"),
            Err(ParseError::MissingArgument("text"))
        );
        assert_eq!(
            Command::parse("/edit two words"),
            Err(ParseError::InvalidIndex("two".into()))
        );
        assert_eq!(
            Command::parse("/frobnicate"),
            Err(ParseError::UnknownCommand("frobnicate".into()))
        );
    }
}
