use std::fmt;

/// Sender name stamped on every server-originated message.
pub const SERVER_NAME: &str = "Serveur";

/// The channel every session belongs to.
pub const GLOBAL_CHANNEL: &str = "global";

/// Recipient marker for fan-out messages.
pub const EVERYONE: &str = "all";

/// The record exchanged in both directions on every connection.
///
/// All fields are plain strings; the codec enforces their byte limits.
/// `cmd` is empty for ordinary chat lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub cmd: String,
    pub from: String,
    pub to: String,
    pub channel: String,
    pub message: String,
    pub color: String,
}

impl Message {
    pub fn new(cmd: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            message: body.into(),
            ..Self::default()
        }
    }

    /// A reply addressed to one client.
    pub fn reply(cmd: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(cmd, body).sender(SERVER_NAME).recipient(to)
    }

    /// A fan-out notice on `channel`. `from` is filled in by the registry
    /// when the notice is sent on behalf of a session.
    pub fn notice(cmd: impl Into<String>, channel: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(cmd, body)
            .sender(SERVER_NAME)
            .recipient(EVERYONE)
            .on_channel(channel)
    }

    pub fn sender(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn recipient(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }

    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// The channel this message targets; an empty field means "global".
    pub fn target_channel(&self) -> &str {
        if self.channel.is_empty() {
            GLOBAL_CHANNEL
        } else {
            &self.channel
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cmd.is_empty() {
            write!(f, "[{}] <{}> {}", self.target_channel(), self.from, self.message)
        } else {
            write!(
                f,
                "[{}] <{}> /{} {}",
                self.target_channel(),
                self.from,
                self.cmd,
                self.message
            )
        }
    }
}

/// Cut `text` to at most `max` bytes without splitting a character.
pub fn clip(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
