use crate::error::RelayError;

/// Commands a confirmed session can send on its chat connection.
///
/// Commands are a closed set, so dispatch is a single exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Empty `cmd`: relay the line to the members of its channel.
    Broadcast,
    Who,
    List,
    Dm,
    Fin,
    Upload,
    Download,
    /// Open the channel directory.
    Salon,
    /// Leave the channel named in the message.
    Exit,
}

impl Command {
    /// Parse the `cmd` field of a chat-connection message.
    pub fn parse(cmd: &str) -> Result<Self, RelayError> {
        match cmd {
            "" => Ok(Command::Broadcast),
            "who" => Ok(Command::Who),
            "list" => Ok(Command::List),
            "dm" => Ok(Command::Dm),
            "fin" => Ok(Command::Fin),
            "upload" => Ok(Command::Upload),
            "download" => Ok(Command::Download),
            "salon" => Ok(Command::Salon),
            "exit" => Ok(Command::Exit),
            other => Err(RelayError::UnknownCommand(other.to_string())),
        }
    }
}

/// Commands accepted on a channel-directory connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryCommand {
    Connect,
    Disconnect,
    Create,
    Delete,
    /// Leave the directory menu.
    Close,
}

impl DirectoryCommand {
    pub fn parse(cmd: &str) -> Result<Self, RelayError> {
        match cmd {
            "connect" => Ok(DirectoryCommand::Connect),
            "disc" => Ok(DirectoryCommand::Disconnect),
            "create" => Ok(DirectoryCommand::Create),
            "delete" => Ok(DirectoryCommand::Delete),
            "exitm" => Ok(DirectoryCommand::Close),
            other => Err(RelayError::UnknownCommand(other.to_string())),
        }
    }

    /// Whether the directory session ends after this command.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DirectoryCommand::Create | DirectoryCommand::Delete | DirectoryCommand::Close
        )
    }
}
