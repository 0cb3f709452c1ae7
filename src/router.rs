use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::command::Command;
use crate::connection::{Confirmed, Connection};
use crate::directory::serve_directory;
use crate::error::RelayError;
use crate::message::{GLOBAL_CHANNEL, Message, clip};
use crate::protocol::BODY_MAX;
use crate::server::ServerState;
use crate::transfer::{serve_download, serve_upload};
use crate::types::{SlotId, WorkerKind};

/// What the chat worker does after routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

/// Side-service requests a chat worker still has outstanding.
#[derive(Default)]
pub struct Outstanding {
    directory: Option<CancellationToken>,
}

impl Outstanding {
    /// A fresh token for a new directory request. Any earlier request that
    /// has not been served yet is withdrawn.
    fn replace_directory(&mut self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.directory.replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    fn withdraw_all(&mut self) {
        if let Some(directory) = self.directory.take() {
            directory.cancel();
        }
    }
}

/// Chat worker for one accepted connection.
///
/// Holds the capacity permit for the connection's whole lifetime and frees
/// the slot before giving the permit back.
pub async fn handle_client(
    state: Arc<ServerState>,
    stream: TcpStream,
    slot: SlotId,
    permit: OwnedSemaphorePermit,
) -> Result<(), RelayError> {
    let outcome = serve(&state, stream, slot).await;

    let released = state.registry.release(slot).await;
    let online = state.registry.confirmed_count().await;
    match released {
        Some(session) => info!(
            %slot,
            peer = %session.peer,
            username = %session.username,
            online,
            "client disconnected"
        ),
        None => info!(%slot, online, "client left before choosing a username"),
    }
    drop(permit);

    outcome
}

async fn serve(state: &Arc<ServerState>, stream: TcpStream, slot: SlotId) -> Result<(), RelayError> {
    let (outbox, mut inbox) = mpsc::channel(state.config.outbox_capacity);

    let pending = Connection::new(stream, slot)?;
    let Some(mut conn) = pending.admit(&state.registry, outbox).await? else {
        return Ok(());
    };
    info!(%slot, peer = %conn.peer(), username = %conn.username(), "client confirmed");

    let hello = Message::notice("", GLOBAL_CHANNEL, "joined the chat. Hello!");
    state.registry.broadcast(Some(slot), &hello).await;

    let mut outstanding = Outstanding::default();
    let outcome = relay(state, &mut conn, &mut outstanding, &mut inbox).await;
    outstanding.withdraw_all();

    // Every way out of a confirmed session announces the departure.
    let goodbye = Message::notice("", GLOBAL_CHANNEL, "left the chat. Goodbye!");
    state.registry.broadcast(Some(slot), &goodbye).await;

    outcome
}

/// Pump both directions until the client leaves: frames from the socket are
/// routed, messages queued for this session are written to the socket.
async fn relay(
    state: &Arc<ServerState>,
    conn: &mut Connection<Confirmed>,
    outstanding: &mut Outstanding,
    inbox: &mut mpsc::Receiver<Message>,
) -> Result<(), RelayError> {
    loop {
        tokio::select! {
            incoming = conn.recv() => match incoming {
                None => {
                    info!(slot = %conn.slot(), "peer closed the connection");
                    return Ok(());
                }
                Some(msg) => {
                    if route(state, conn, outstanding, msg?).await? == Flow::Disconnect {
                        return Ok(());
                    }
                }
            },
            Some(outgoing) = inbox.recv() => conn.send(outgoing).await?,
        }
    }
}

/// Dispatch one message from a confirmed session by its command.
pub async fn route(
    state: &Arc<ServerState>,
    conn: &mut Connection<Confirmed>,
    outstanding: &mut Outstanding,
    msg: Message,
) -> Result<Flow, RelayError> {
    let slot = conn.slot();
    let username = conn.username().to_string();

    let command = match Command::parse(&msg.cmd) {
        Ok(command) => command,
        Err(e) => {
            let reply = Message::reply("error", username.as_str(), clip(&e.to_string(), BODY_MAX));
            conn.send(reply).await?;
            return Ok(Flow::Continue);
        }
    };
    debug!(%slot, ?command, %msg, "routing");

    match command {
        Command::Broadcast => {
            state.registry.broadcast(Some(slot), &msg).await;
        }
        Command::Who => {
            conn.send(Message::reply("who", username.as_str(), username.as_str()))
                .await?;
        }
        Command::List => {
            let names = state.registry.usernames().await.join("\n");
            conn.send(Message::reply("list", username.as_str(), clip(&names, BODY_MAX)))
                .await?;
        }
        Command::Dm => {
            let target = msg.to.clone();
            let dm = Message {
                cmd: "dm".to_string(),
                from: username.clone(),
                ..msg
            };
            if let Err(e) = state.registry.send_to_user(&target, dm).await {
                let reply = Message::reply("error", username.as_str(), clip(&e.to_string(), BODY_MAX));
                conn.send(reply).await?;
            }
        }
        Command::Fin => {
            info!(%slot, %username, "client said goodbye");
            return Ok(Flow::Disconnect);
        }
        Command::Upload => {
            state
                .lifecycle
                .spawn(WorkerKind::Upload, serve_upload(Arc::clone(state), username));
            let notice = Message::notice("upload", GLOBAL_CHANNEL, "is uploading a file");
            state.registry.broadcast(Some(slot), &notice).await;
        }
        Command::Download => {
            state
                .lifecycle
                .spawn(WorkerKind::Download, serve_download(Arc::clone(state), username));
        }
        Command::Salon => {
            let cancel = outstanding.replace_directory();
            state.lifecycle.spawn(
                WorkerKind::Directory,
                serve_directory(Arc::clone(state), slot, cancel),
            );
        }
        Command::Exit => {
            let channel = msg.channel;
            if state.registry.leave_channel(slot, &channel).await {
                info!(%slot, %username, %channel, "left channel");
                let notice = Message::notice("", channel.as_str(), "left the channel");
                state.registry.broadcast(Some(slot), &notice).await;
            } else {
                let reason = if channel == GLOBAL_CHANNEL {
                    "the global channel cannot be left".to_string()
                } else {
                    format!("not a member of channel '{channel}'")
                };
                conn.send(Message::reply("error", username.as_str(), reason))
                    .await?;
            }
        }
    }

    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_new_directory_request_withdraws_the_previous_one() {
        let mut outstanding = Outstanding::default();
        let first = outstanding.replace_directory();
        let second = outstanding.replace_directory();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn leaving_withdraws_a_pending_directory_request() {
        let mut outstanding = Outstanding::default();
        let pending = outstanding.replace_directory();
        outstanding.withdraw_all();
        assert!(pending.is_cancelled());
        outstanding.withdraw_all();
    }
}
