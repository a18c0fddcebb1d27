use std::path::PathBuf;

use shared::domain::{ClientTempId, ConversationId, UserId};
use sync_core::transport::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Open(ConversationId),
    Close,
    Direct(UserId),
    Attach { path: PathBuf, caption: String },
    Gif { url: String, caption: String },
    Retry(ClientTempId),
    Discard(ClientTempId),
    Show,
    Status,
    Help,
    Quit,
    Say(String),
}

/// Parses one input line; `None` for blank input.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    let first_and_rest = || -> Result<(String, String), String> {
        let mut parts = args.splitn(2, char::is_whitespace);
        let first = parts
            .next()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| format!("/{name} needs an argument"))?;
        Ok((first.to_string(), parts.next().unwrap_or("").trim().to_string()))
    };
    let single = || -> Result<String, String> {
        if args.is_empty() {
            Err(format!("/{name} needs an argument"))
        } else {
            Ok(args.to_string())
        }
    };

    let command = match name {
        "list" | "ls" => Command::List,
        "open" => Command::Open(ConversationId::from(single()?)),
        "close" => Command::Close,
        "dm" => Command::Direct(UserId::from(single()?)),
        "attach" => {
            let (path, caption) = first_and_rest()?;
            Command::Attach {
                path: PathBuf::from(path),
                caption,
            }
        }
        "gif" => {
            let (url, caption) = first_and_rest()?;
            Command::Gif { url, caption }
        }
        "retry" => Command::Retry(ClientTempId::from(single()?)),
        "discard" => Command::Discard(ClientTempId::from(single()?)),
        "show" => Command::Show,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{other}; try /help")),
    };
    Ok(Some(command))
}

pub const HELP: &str = "\
/list                 refresh and show conversations
/open <id>            open a conversation
/close                close the open conversation
/dm <user>            start or reopen a direct conversation
/attach <path> [text] send a file with optional text
/gif <url> [text]     send a gif with optional text
/retry <temp-id>      resend a failed message
/discard <temp-id>    drop a failed message
/show                 print the open conversation
/status               show the live connection state
/quit                 disconnect and exit
anything else is sent to the open conversation";

pub fn describe_state(state: ConnectionState) -> String {
    match state {
        ConnectionState::Idle => "idle".into(),
        ConnectionState::Connecting => "connecting".into(),
        ConnectionState::Connected => "connected".into(),
        ConnectionState::Reconnecting { attempt } => format!("reconnecting (attempt {attempt})"),
        ConnectionState::Closed => "closed".into(),
    }
}

/// Best-effort content type from the file extension.
pub fn guess_mimetype(path: &std::path::Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("mp3") => "audio/mpeg",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
