use std::fmt;

use crate::error::RelayError;

/// Longest username or channel name, in bytes.
pub const NAME_MAX: usize = 9;

/// Identities a client may never claim.
const RESERVED_NAMES: &[&str] = &["Serveur", "Server"];

/// Index of a connection slot in the registry table.
///
/// Wrapping `usize` in a newtype keeps slot indices from being mixed up
/// with counts or byte lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Return the raw index for Vec-based lookup.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0 + 1)
    }
}

/// What a worker task is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Chat,
    Upload,
    Download,
    Directory,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerKind::Chat => "chat",
            WorkerKind::Upload => "upload",
            WorkerKind::Download => "download",
            WorkerKind::Directory => "directory",
        };
        f.write_str(name)
    }
}

fn validate_name(kind: &str, name: &str) -> Result<(), RelayError> {
    if name.is_empty() {
        return Err(RelayError::InvalidName(format!("empty {kind}")));
    }
    if name.len() > NAME_MAX {
        return Err(RelayError::InvalidName(format!(
            "{kind} '{name}' is longer than {NAME_MAX} bytes"
        )));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '*' || c.is_whitespace() || c.is_control())
    {
        return Err(RelayError::InvalidName(format!(
            "{kind} '{name}' contains a forbidden character"
        )));
    }
    Ok(())
}

/// Check a candidate username before admission.
pub fn validate_username(name: &str) -> Result<(), RelayError> {
    validate_name("username", name)?;
    if RESERVED_NAMES.contains(&name) {
        return Err(RelayError::InvalidName(format!("'{name}' is reserved")));
    }
    Ok(())
}

/// Check a channel name used by the directory service.
pub fn validate_channel_name(name: &str) -> Result<(), RelayError> {
    validate_name("channel", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_are_bounded() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("ninechars").is_ok());
        assert!(validate_username("tenchars10").is_err());
        assert!(validate_username("").is_err());
    }

    #[test]
    fn reserved_and_malformed_usernames_are_rejected() {
        assert!(validate_username("Serveur").is_err());
        assert!(validate_username("Server").is_err());
        assert!(validate_username("a b").is_err());
        assert!(validate_username("a/b").is_err());
    }

    #[test]
    fn channel_names_reject_listing_markers() {
        assert!(validate_channel_name("dev").is_ok());
        assert!(validate_channel_name("*dev").is_err());
        assert!(validate_channel_name("d/ev").is_err());
    }

    #[test]
    fn slot_display_is_one_based() {
        assert_eq!(SlotId::new(0).to_string(), "client#1");
    }
}
