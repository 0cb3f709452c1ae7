use std::marker::PhantomData;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::error::RelayError;
use crate::message::Message;
use crate::protocol::{CodecError, MessageCodec};
use crate::registry::{Admission, Registry};
use crate::types::SlotId;

// Typestate: encode the admission lifecycle as types.
//
// Connection<Pending> → Connection<Confirmed>
//
// Only a confirmed connection carries a username and can be routed.

/// Marker type: accepted, holding a slot, no username yet.
pub struct Pending;

/// Marker type: the registry holds a session for this connection.
pub struct Confirmed;

/// A chat connection in a particular state. PhantomData<S> makes the state
/// part of the type without using any memory.
pub struct Connection<S> {
    framed: Framed<TcpStream, MessageCodec>,
    peer: SocketAddr,
    slot: SlotId,
    username: Option<String>,
    _state: PhantomData<S>,
}

impl<S> Connection<S> {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), RelayError> {
        self.framed.send(msg).await?;
        Ok(())
    }
}

impl Connection<Pending> {
    pub fn new(stream: TcpStream, slot: SlotId) -> Result<Self, RelayError> {
        let peer = stream.peer_addr()?;
        Ok(Self {
            framed: Framed::new(stream, MessageCodec),
            peer,
            slot,
            username: None,
            _state: PhantomData,
        })
    }

    /// Negotiate a unique username. Each candidate arrives in the `from`
    /// field; the client gets `true` or `false` back and may retry until a
    /// name is accepted.
    ///
    /// Returns `None` if the peer hung up before a name was accepted. This
    /// method consumes self; the pending connection is gone either way.
    pub async fn admit(
        mut self,
        registry: &Registry,
        outbox: mpsc::Sender<Message>,
    ) -> Result<Option<Connection<Confirmed>>, RelayError> {
        while let Some(candidate) = self.framed.next().await {
            let candidate = candidate?;
            let name = candidate.from;

            match registry.confirm(self.slot, &name, outbox.clone()).await {
                Admission::Accepted => {
                    self.send(Message::reply(candidate.cmd, name.as_str(), "true"))
                        .await?;
                    return Ok(Some(Connection {
                        framed: self.framed,
                        peer: self.peer,
                        slot: self.slot,
                        username: Some(name),
                        _state: PhantomData,
                    }));
                }
                Admission::NameTaken => {
                    info!(slot = %self.slot, candidate = %name, "username already taken");
                }
                Admission::Invalid(reason) => {
                    debug!(slot = %self.slot, %reason, "username refused");
                }
            }

            self.send(Message::reply(candidate.cmd, name.as_str(), "false"))
                .await?;
        }

        Ok(None)
    }
}

impl Connection<Confirmed> {
    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or_default()
    }

    /// Read the next message. `None` means the peer closed the connection.
    pub async fn recv(&mut self) -> Option<Result<Message, CodecError>> {
        self.framed.next().await
    }
}
