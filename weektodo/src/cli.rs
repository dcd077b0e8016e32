//! Line commands of the headless client.

use std::path::PathBuf;

use weektodo_proto::task::{Day, TaskId};

use crate::transport::PeerId;

/// One parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add { day: Day, content: String },
    List { day: Option<Day> },
    Delete { id: TaskId },
    Move { id: TaskId, day: Day },
    Order { day: Day, ids: Vec<TaskId> },
    Connect { peer: Option<PeerId> },
    Disconnect { peer: Option<PeerId> },
    Sync,
    Status,
    Export { path: Option<PathBuf> },
    Import { path: PathBuf },
    Help,
    Quit,
}

/// Usage text printed by `help`.
pub const HELP: &str = "\
commands:
  add <day> <text>          add a task
  list [day]                list tasks
  delete <id>               delete a task
  move <id> <day>           move a task to another day
  order <day> <id>...       reorder a day
  connect [peer]            connect to a peer (no peer: show own id)
  disconnect [peer]         disconnect from a peer (no peer: everyone)
  sync                      request a full sync
  status                    show connection status
  export [file]             print or save all tasks
  import <file>             replace all tasks from a file
  quit";

/// Why a line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("unknown command {0:?}, try `help`")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("{0}")]
    Invalid(String),
}

impl Command {
    /// Parses one input line.
    ///
    /// # Errors
    ///
    /// [`ParseError`] describing what is wrong with the line.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err(ParseError::Empty);
        };
        let rest: Vec<&str> = words.collect();

        match verb.to_ascii_lowercase().as_str() {
            "add" => {
                let [day, content @ ..] = rest.as_slice() else {
                    return Err(ParseError::Usage("add <day> <text>"));
                };
                if content.is_empty() {
                    return Err(ParseError::Usage("add <day> <text>"));
                }
                Ok(Self::Add {
                    day: parse_day(day)?,
                    content: content.join(" "),
                })
            }
            "list" | "ls" => match rest.as_slice() {
                [] => Ok(Self::List { day: None }),
                [day] => Ok(Self::List {
                    day: Some(parse_day(day)?),
                }),
                _ => Err(ParseError::Usage("list [day]")),
            },
            "delete" | "rm" => match rest.as_slice() {
                [id] => Ok(Self::Delete { id: parse_id(id)? }),
                _ => Err(ParseError::Usage("delete <id>")),
            },
            "move" | "mv" => match rest.as_slice() {
                [id, day] => Ok(Self::Move {
                    id: parse_id(id)?,
                    day: parse_day(day)?,
                }),
                _ => Err(ParseError::Usage("move <id> <day>")),
            },
            "order" => {
                let [day, ids @ ..] = rest.as_slice() else {
                    return Err(ParseError::Usage("order <day> <id>..."));
                };
                Ok(Self::Order {
                    day: parse_day(day)?,
                    ids: ids.iter().map(|id| parse_id(id)).collect::<Result<_, _>>()?,
                })
            }
            "connect" => match rest.as_slice() {
                [] => Ok(Self::Connect { peer: None }),
                [peer] => Ok(Self::Connect {
                    peer: Some(PeerId::new(*peer)),
                }),
                _ => Err(ParseError::Usage("connect [peer]")),
            },
            "disconnect" => match rest.as_slice() {
                [] => Ok(Self::Disconnect { peer: None }),
                [peer] => Ok(Self::Disconnect {
                    peer: Some(PeerId::new(*peer)),
                }),
                _ => Err(ParseError::Usage("disconnect [peer]")),
            },
            "sync" => Ok(Self::Sync),
            "status" => Ok(Self::Status),
            "export" => match rest.as_slice() {
                [] => Ok(Self::Export { path: None }),
                [path] => Ok(Self::Export {
                    path: Some(PathBuf::from(path)),
                }),
                _ => Err(ParseError::Usage("export [file]")),
            },
            "import" => match rest.as_slice() {
                [path] => Ok(Self::Import {
                    path: PathBuf::from(path),
                }),
                _ => Err(ParseError::Usage("import <file>")),
            },
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

fn parse_day(raw: &str) -> Result<Day, ParseError> {
    raw.parse().map_err(|e: weektodo_proto::task::ParseDayError| ParseError::Invalid(e.to_string()))
}

fn parse_id(raw: &str) -> Result<TaskId, ParseError> {
    raw.parse::<i64>()
        .map(TaskId::new)
        .map_err(|_| ParseError::Invalid(format!("not a task id: {raw:?}")))
}
