use std::collections::BTreeSet;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::message::{GLOBAL_CHANNEL, Message};
use crate::types::SlotId;

/// A confirmed client. Outgoing messages are queued on a bounded `outbox`;
/// the session's own chat worker drains the queue into its socket.
pub struct Session {
    pub slot: SlotId,
    pub username: String,
    pub peer: SocketAddr,
    outbox: mpsc::Sender<Message>,
    channels: BTreeSet<String>,
}

impl Session {
    pub fn new(
        slot: SlotId,
        username: String,
        peer: SocketAddr,
        outbox: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            slot,
            username,
            peer,
            outbox,
            channels: BTreeSet::from([GLOBAL_CHANNEL.to_string()]),
        }
    }

    /// Queue a message for this client without waiting. Fails if the client
    /// has stopped reading and its queue is full, or if the worker that owns
    /// the socket is already gone.
    pub fn send(&self, msg: Message) -> Result<(), TrySendError<Message>> {
        self.outbox.try_send(msg)
    }

    pub fn is_member(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    /// Returns `true` if the channel was newly joined.
    pub fn join(&mut self, channel: &str) -> bool {
        self.channels.insert(channel.to_string())
    }

    /// Returns `true` if the channel was left. "global" can never be left.
    pub fn leave(&mut self, channel: &str) -> bool {
        if channel == GLOBAL_CHANNEL {
            return false;
        }
        self.channels.remove(channel)
    }

    pub fn channels(&self) -> &BTreeSet<String> {
        &self.channels
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(slot = %self.slot, username = %self.username, "session reclaimed");
    }
}
