use std::path::Path;

use super::*;

#[test]
fn plain_text_is_a_message() {
    assert_eq!(
        parse("  see you at 5 ").expect("parse"),
        Some(Command::Say("see you at 5".into()))
    );
    assert_eq!(parse("   ").expect("parse"), None);
}

#[test]
fn commands_with_arguments() {
    assert_eq!(
        parse("/open c42").expect("parse"),
        Some(Command::Open(ConversationId::from("c42")))
    );
    assert_eq!(
        parse("/attach ./notes.pdf the minutes").expect("parse"),
        Some(Command::Attach {
            path: PathBuf::from("./notes.pdf"),
            caption: "the minutes".into(),
        })
    );
    assert_eq!(
        parse("/gif https://media.test/wave.gif").expect("parse"),
        Some(Command::Gif {
            url: "https://media.test/wave.gif".into(),
            caption: String::new(),
        })
    );
}

#[test]
fn missing_argument_and_unknown_command_are_errors() {
    assert!(parse("/open").is_err());
    assert!(parse("/attach").is_err());
    assert!(parse("/frobnicate now").is_err());
}

#[test]
fn mimetype_follows_extension() {
    assert_eq!(guess_mimetype(Path::new("a/b/photo.JPG")), "image/jpeg");
    assert_eq!(guess_mimetype(Path::new("archive.tar.zst")), "application/octet-stream");
}

#[test]
fn status_command_and_state_labels() {
    assert_eq!(parse("/status").expect("parse"), Some(Command::Status));
    assert_eq!(describe_state(ConnectionState::Connected), "connected");
    assert_eq!(
        describe_state(ConnectionState::Reconnecting { attempt: 3 }),
        "reconnecting (attempt 3)"
    );
}
