use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ChannelStore;
use crate::command::DirectoryCommand;
use crate::error::RelayError;
use crate::message::{GLOBAL_CHANNEL, Message, clip};
use crate::protocol::{BODY_MAX, MessageCodec};
use crate::registry::Registry;
use crate::server::{ServerState, accept_side};
use crate::types::{SlotId, validate_channel_name};

/// Join `channel` if its descriptor exists. Returns `false` if the session
/// was already a member.
pub async fn join_existing(
    channels: &ChannelStore,
    registry: &Registry,
    slot: SlotId,
    channel: &str,
) -> Result<bool, RelayError> {
    let _changes = channels.lock_changes().await;
    if !channels.exists(channel).await {
        return Err(RelayError::UnknownChannel(channel.to_string()));
    }
    Ok(registry.join_channel(slot, channel).await)
}

/// Write the descriptor for `channel` and make its creator a member.
pub async fn create_and_join(
    channels: &ChannelStore,
    registry: &Registry,
    slot: SlotId,
    channel: &str,
    description: &str,
) -> Result<(), RelayError> {
    let _changes = channels.lock_changes().await;
    channels.create(channel, description).await?;
    registry.join_channel(slot, channel).await;
    Ok(())
}

/// Remove `channel`: the descriptor goes first, then members get `end` so
/// their channel sub-connections close, then the channel is evicted from
/// every session. Returns how many sessions were members.
pub async fn remove_channel(
    channels: &ChannelStore,
    registry: &Registry,
    channel: &str,
) -> Result<usize, RelayError> {
    let _changes = channels.lock_changes().await;
    if !channels.delete(channel).await? {
        return Err(RelayError::UnknownChannel(channel.to_string()));
    }
    let end = Message::notice("end", channel, "this channel was deleted");
    registry.broadcast(None, &end).await;
    Ok(registry.evict_channel(channel).await)
}

/// One open channel menu. Lives until the client leaves the menu, creates
/// or deletes a channel, or hangs up.
struct DirectorySession {
    state: Arc<ServerState>,
    framed: Framed<TcpStream, MessageCodec>,
    slot: SlotId,
    username: String,
}

/// Directory worker: accept one connection on the directory port, send the
/// channel listing for `slot`, then apply directory commands.
///
/// Cancelling `cancel` before a connection arrives retires the worker
/// without accepting anything.
pub async fn serve_directory(
    state: Arc<ServerState>,
    slot: SlotId,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    let (stream, peer) = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(%slot, "directory request withdrawn");
            return Ok(());
        }
        accepted = accept_side(&state, &state.services.directory, "directory") => accepted?,
    };

    let (Some(username), Some(joined)) = (
        state.registry.username(slot).await,
        state.registry.memberships(slot).await,
    ) else {
        info!(%slot, %peer, "session ended before its directory connection arrived");
        return Ok(());
    };

    let listing = state.channels.listing(&joined).await?;
    let mut session = DirectorySession {
        framed: Framed::new(stream, MessageCodec),
        state,
        slot,
        username,
    };
    session
        .framed
        .send(Message::reply("salon", session.username.as_str(), listing))
        .await?;
    debug!(%slot, %peer, "directory opened");

    session.run().await
}

impl DirectorySession {
    async fn run(&mut self) -> Result<(), RelayError> {
        while let Some(request) = self.framed.next().await {
            let request = request?;
            let command = match DirectoryCommand::parse(&request.cmd) {
                Ok(command) => command,
                Err(e) => {
                    self.refuse(&e.to_string()).await?;
                    continue;
                }
            };

            let channel = request.channel;
            match command {
                DirectoryCommand::Connect => self.connect(&channel).await?,
                DirectoryCommand::Disconnect => self.disconnect(&channel).await?,
                DirectoryCommand::Create => self.create(&channel).await?,
                DirectoryCommand::Delete => self.delete(&channel).await?,
                DirectoryCommand::Close => debug!(slot = %self.slot, "directory closed"),
            }

            if command.is_terminal() {
                return Ok(());
            }
        }

        debug!(slot = %self.slot, "directory connection closed by peer");
        Ok(())
    }

    async fn refuse(&mut self, reason: &str) -> Result<(), RelayError> {
        let reply = Message::reply("error", self.username.as_str(), clip(reason, BODY_MAX));
        self.framed.send(reply).await?;
        Ok(())
    }

    async fn connect(&mut self, channel: &str) -> Result<(), RelayError> {
        let state = &self.state;
        match join_existing(&state.channels, &state.registry, self.slot, channel).await {
            Ok(true) => {
                info!(slot = %self.slot, username = %self.username, %channel, "joined channel");
                let notice = Message::notice("", channel, "joined the channel");
                state.registry.broadcast(Some(self.slot), &notice).await;
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e @ RelayError::UnknownChannel(_)) => self.refuse(&e.to_string()).await,
            Err(e) => Err(e),
        }
    }

    async fn disconnect(&mut self, channel: &str) -> Result<(), RelayError> {
        if self.state.registry.leave_channel(self.slot, channel).await {
            info!(slot = %self.slot, username = %self.username, %channel, "left channel");
            let notice = Message::notice("", channel, "left the channel");
            self.state.registry.broadcast(Some(self.slot), &notice).await;
        } else if channel == GLOBAL_CHANNEL {
            self.refuse("the global channel cannot be left").await?;
        }
        Ok(())
    }

    /// The description arrives in the message after the `create` request.
    async fn create(&mut self, channel: &str) -> Result<(), RelayError> {
        if let Err(e) = validate_channel_name(channel) {
            return self.refuse(&e.to_string()).await;
        }
        if channel == GLOBAL_CHANNEL {
            return self.refuse("the global channel is built in").await;
        }

        let Some(description) = self.framed.next().await else {
            debug!(slot = %self.slot, %channel, "peer left before describing the channel");
            return Ok(());
        };
        let description = description?.message;

        let state = &self.state;
        create_and_join(&state.channels, &state.registry, self.slot, channel, &description).await?;
        info!(slot = %self.slot, username = %self.username, %channel, "channel created");

        let notice = Message::notice(
            "",
            GLOBAL_CHANNEL,
            format!("channel '{channel}' was created by {}", self.username),
        );
        state.registry.broadcast(None, &notice).await;
        Ok(())
    }

    async fn delete(&mut self, channel: &str) -> Result<(), RelayError> {
        let state = &self.state;
        let evicted = match remove_channel(&state.channels, &state.registry, channel).await {
            Ok(evicted) => evicted,
            Err(RelayError::InvalidName(reason)) => return self.refuse(&reason).await,
            Err(e @ RelayError::UnknownChannel(_)) => {
                warn!(slot = %self.slot, %channel, "delete of a channel with no descriptor");
                return self.refuse(&e.to_string()).await;
            }
            Err(e) => return Err(e),
        };
        info!(slot = %self.slot, username = %self.username, %channel, evicted, "channel deleted");

        let notice = Message::notice(
            "",
            GLOBAL_CHANNEL,
            format!("channel '{channel}' was deleted by {}", self.username),
        );
        state.registry.broadcast(None, &notice).await;
        Ok(())
    }
}
