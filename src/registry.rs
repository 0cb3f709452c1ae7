use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::message::Message;
use crate::session::Session;
use crate::types::{SlotId, validate_username};

enum Slot {
    Free,
    /// Accepted, still negotiating a username.
    Pending { peer: SocketAddr },
    Confirmed(Session),
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    NameTaken,
    Invalid(String),
}

/// The table of connection slots.
///
/// Pending slots, confirmed sessions, usernames and channel membership all
/// live in one table behind one lock, so a broadcast scan never has to
/// order two locks. Critical sections only touch memory: delivery is a
/// non-blocking push onto the recipient's bounded outbox.
pub struct Registry {
    table: Mutex<Vec<Slot>>,
    capacity: Arc<Semaphore>,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new((0..capacity).map(|_| Slot::Free).collect()),
            capacity: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Wait for room for one more connection. The permit must be held for
    /// as long as the connection occupies a slot.
    pub async fn reserve(&self) -> Result<OwnedSemaphorePermit, RelayError> {
        Arc::clone(&self.capacity)
            .acquire_owned()
            .await
            .map_err(|_| RelayError::ShuttingDown)
    }

    /// Stop handing out permits; pending `reserve` calls fail.
    pub fn close(&self) {
        self.capacity.close();
    }

    /// Place a freshly accepted connection in the first free slot.
    pub async fn claim_pending(&self, peer: SocketAddr) -> Option<SlotId> {
        let mut table = self.table.lock().await;
        let index = table.iter().position(|slot| matches!(slot, Slot::Free))?;
        table[index] = Slot::Pending { peer };
        Some(SlotId::new(index))
    }

    /// Try to promote a pending slot to a confirmed session named
    /// `username`. The uniqueness check and the promotion happen under the
    /// same lock.
    pub async fn confirm(
        &self,
        slot: SlotId,
        username: &str,
        outbox: mpsc::Sender<Message>,
    ) -> Admission {
        if let Err(e) = validate_username(username) {
            return Admission::Invalid(e.to_string());
        }

        let mut table = self.table.lock().await;
        let taken = table
            .iter()
            .any(|s| matches!(s, Slot::Confirmed(session) if session.username == username));
        if taken {
            return Admission::NameTaken;
        }

        let Some(entry) = table.get_mut(slot.index()) else {
            return Admission::Invalid(format!("{slot} does not exist"));
        };
        let Slot::Pending { peer } = *entry else {
            return Admission::Invalid(format!("{slot} is not awaiting a name"));
        };
        *entry = Slot::Confirmed(Session::new(slot, username.to_string(), peer, outbox));
        Admission::Accepted
    }

    /// Free a slot, returning the session it held if it was confirmed.
    pub async fn release(&self, slot: SlotId) -> Option<Session> {
        let mut table = self.table.lock().await;
        let entry = table.get_mut(slot.index())?;
        match std::mem::replace(entry, Slot::Free) {
            Slot::Confirmed(session) => Some(session),
            Slot::Pending { .. } | Slot::Free => None,
        }
    }

    pub async fn username(&self, slot: SlotId) -> Option<String> {
        let table = self.table.lock().await;
        match table.get(slot.index()) {
            Some(Slot::Confirmed(session)) => Some(session.username.clone()),
            _ => None,
        }
    }

    /// Usernames of every confirmed session, in slot order.
    pub async fn usernames(&self) -> Vec<String> {
        let table = self.table.lock().await;
        table
            .iter()
            .filter_map(|slot| match slot {
                Slot::Confirmed(session) => Some(session.username.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn confirmed_count(&self) -> usize {
        let table = self.table.lock().await;
        table
            .iter()
            .filter(|slot| matches!(slot, Slot::Confirmed(_)))
            .count()
    }

    /// Channels the session in `slot` belongs to, or `None` if the slot
    /// holds no confirmed session.
    pub async fn memberships(&self, slot: SlotId) -> Option<BTreeSet<String>> {
        let table = self.table.lock().await;
        match table.get(slot.index()) {
            Some(Slot::Confirmed(session)) => Some(session.channels().clone()),
            _ => None,
        }
    }

    /// Deliver `msg` to every confirmed session that belongs to its channel,
    /// except the sender. When `sender` is set, `from` is stamped with the
    /// sender's username. A failed delivery is logged and skipped.
    ///
    /// Returns the number of sessions the message was queued for.
    pub async fn broadcast(&self, sender: Option<SlotId>, msg: &Message) -> usize {
        let table = self.table.lock().await;

        let mut msg = msg.clone();
        if let Some(sender) = sender {
            if let Some(Slot::Confirmed(session)) = table.get(sender.index()) {
                msg.from = session.username.clone();
            }
        }
        if msg.channel.is_empty() {
            debug!(from = %msg.from, "message without channel, sending to global");
        }
        msg.channel = msg.target_channel().to_string();

        let mut delivered = 0;
        for entry in table.iter() {
            let Slot::Confirmed(session) = entry else {
                continue;
            };
            if Some(session.slot) == sender || !session.is_member(&msg.channel) {
                continue;
            }
            match session.send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    to = %session.username,
                    channel = %msg.channel,
                    reason = %e,
                    "delivery failed"
                ),
            }
        }

        debug!(channel = %msg.channel, from = %msg.from, delivered, "broadcast");
        delivered
    }

    /// Deliver `msg` to the session named `username` only.
    pub async fn send_to_user(&self, username: &str, msg: Message) -> Result<(), RelayError> {
        let table = self.table.lock().await;
        let session = table
            .iter()
            .find_map(|slot| match slot {
                Slot::Confirmed(session) if session.username == username => Some(session),
                _ => None,
            })
            .ok_or_else(|| RelayError::UnknownUser(username.to_string()))?;

        if let Err(e) = session.send(msg) {
            warn!(to = %username, reason = %e, "direct message dropped");
        }
        Ok(())
    }

    /// Returns `true` if the session joined a channel it was not in.
    pub async fn join_channel(&self, slot: SlotId, channel: &str) -> bool {
        let mut table = self.table.lock().await;
        match table.get_mut(slot.index()) {
            Some(Slot::Confirmed(session)) => session.join(channel),
            _ => false,
        }
    }

    /// Returns `true` if the session left a channel it was in.
    pub async fn leave_channel(&self, slot: SlotId, channel: &str) -> bool {
        let mut table = self.table.lock().await;
        match table.get_mut(slot.index()) {
            Some(Slot::Confirmed(session)) => session.leave(channel),
            _ => false,
        }
    }

    /// Remove `channel` from every session. Returns how many sessions were
    /// members.
    pub async fn evict_channel(&self, channel: &str) -> usize {
        let mut table = self.table.lock().await;
        let mut evicted = 0;
        for slot in table.iter_mut() {
            if let Slot::Confirmed(session) = slot {
                if session.leave(channel) {
                    evicted += 1;
                }
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::message::{GLOBAL_CHANNEL, SERVER_NAME};

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    async fn admit(
        registry: &Registry,
        name: &str,
    ) -> (SlotId, mpsc::Receiver<Message>) {
        let slot = registry.claim_pending(peer()).await.unwrap();
        let (tx, rx) = mpsc::channel(8);
        assert_eq!(registry.confirm(slot, name, tx).await, Admission::Accepted);
        (slot, rx)
    }

    #[tokio::test]
    async fn usernames_stay_unique() {
        let registry = Registry::new(4);
        let (_alice, _rx) = admit(&registry, "alice").await;

        let slot = registry.claim_pending(peer()).await.unwrap();
        let (tx, _rx2) = mpsc::channel(8);
        assert_eq!(
            registry.confirm(slot, "alice", tx.clone()).await,
            Admission::NameTaken
        );
        assert_eq!(
            registry.confirm(slot, "alice2", tx).await,
            Admission::Accepted
        );
        assert_eq!(registry.usernames().await, vec!["alice", "alice2"]);
    }

    #[tokio::test]
    async fn invalid_names_are_refused() {
        let registry = Registry::new(2);
        let slot = registry.claim_pending(peer()).await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            registry.confirm(slot, "Serveur", tx.clone()).await,
            Admission::Invalid(_)
        ));
        assert!(matches!(
            registry.confirm(slot, "", tx).await,
            Admission::Invalid(_)
        ));
        assert_eq!(registry.confirmed_count().await, 0);
    }

    #[tokio::test]
    async fn released_names_can_be_reused() {
        let registry = Registry::new(2);
        let (alice, _rx) = admit(&registry, "alice").await;
        let session = registry.release(alice).await.unwrap();
        assert_eq!(session.username, "alice");
        drop(session);

        let (_again, _rx) = admit(&registry, "alice").await;
        assert_eq!(registry.confirmed_count().await, 1);
    }

    #[tokio::test]
    async fn releasing_a_pending_slot_yields_no_session() {
        let registry = Registry::new(1);
        let slot = registry.claim_pending(peer()).await.unwrap();
        assert!(registry.claim_pending(peer()).await.is_none());
        assert!(registry.release(slot).await.is_none());
        assert!(registry.claim_pending(peer()).await.is_some());
    }

    #[tokio::test]
    async fn reserve_blocks_at_capacity() {
        let registry = Registry::new(1);
        let permit = registry.reserve().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), registry.reserve()).await;
        assert!(blocked.is_err());

        drop(permit);
        let again = tokio::time::timeout(Duration::from_millis(50), registry.reserve()).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn close_fails_waiting_reservations() {
        let registry = Registry::new(1);
        let _permit = registry.reserve().await.unwrap();
        registry.close();
        assert!(matches!(
            registry.reserve().await,
            Err(RelayError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn broadcast_reaches_channel_members_except_sender() {
        let registry = Registry::new(4);
        let (alice, mut alice_rx) = admit(&registry, "alice").await;
        let (bob, mut bob_rx) = admit(&registry, "bob").await;
        let (_carol, mut carol_rx) = admit(&registry, "carol").await;

        assert!(registry.join_channel(alice, "dev").await);
        assert!(registry.join_channel(bob, "dev").await);

        let msg = Message::new("", "hi dev").sender("spoofed").on_channel("dev");
        assert_eq!(registry.broadcast(Some(alice), &msg).await, 1);

        let got = bob_rx.try_recv().unwrap();
        assert_eq!(got.from, "alice");
        assert_eq!(got.message, "hi dev");
        assert!(alice_rx.try_recv().is_err());
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_without_channel_goes_to_global() {
        let registry = Registry::new(3);
        let (alice, _alice_rx) = admit(&registry, "alice").await;
        let (_bob, mut bob_rx) = admit(&registry, "bob").await;

        registry.broadcast(Some(alice), &Message::new("", "hello")).await;
        assert_eq!(bob_rx.try_recv().unwrap().channel, GLOBAL_CHANNEL);
    }

    #[tokio::test]
    async fn broadcast_skips_recipients_that_are_gone() {
        let registry = Registry::new(3);
        let (_alice, alice_rx) = admit(&registry, "alice").await;
        let (_bob, mut bob_rx) = admit(&registry, "bob").await;
        drop(alice_rx);

        let notice = Message::notice("", GLOBAL_CHANNEL, "maintenance");
        assert_eq!(registry.broadcast(None, &notice).await, 1);
        assert_eq!(bob_rx.try_recv().unwrap().from, SERVER_NAME);
    }

    #[tokio::test]
    async fn broadcast_skips_recipients_with_a_full_queue() {
        let registry = Registry::new(3);
        let (alice, _alice_rx) = admit(&registry, "alice").await;
        let (_bob, bob_rx) = admit(&registry, "bob").await;
        let (_carol, mut carol_rx) = admit(&registry, "carol").await;

        // Bob never reads.
        for n in 0..8 {
            let line = Message::new("", format!("line {n}"));
            assert_eq!(registry.broadcast(Some(alice), &line).await, 2);
            carol_rx.try_recv().unwrap();
        }
        let overflow = Message::new("", "one too many");
        assert_eq!(registry.broadcast(Some(alice), &overflow).await, 1);
        assert_eq!(carol_rx.try_recv().unwrap().message, "one too many");
        assert_eq!(bob_rx.len(), 8);
    }

    #[tokio::test]
    async fn direct_message_to_unknown_user_fails() {
        let registry = Registry::new(2);
        let (_alice, _rx) = admit(&registry, "alice").await;
        let err = registry
            .send_to_user("nobody", Message::new("dm", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownUser(_)));
    }

    #[tokio::test]
    async fn direct_message_reaches_only_the_target() {
        let registry = Registry::new(3);
        let (_alice, mut alice_rx) = admit(&registry, "alice").await;
        let (_bob, mut bob_rx) = admit(&registry, "bob").await;

        registry
            .send_to_user("bob", Message::new("dm", "psst").sender("alice"))
            .await
            .unwrap();
        assert_eq!(bob_rx.try_recv().unwrap().message, "psst");
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn evicting_a_channel_clears_every_membership() {
        let registry = Registry::new(3);
        let (alice, _a) = admit(&registry, "alice").await;
        let (bob, _b) = admit(&registry, "bob").await;
        registry.join_channel(alice, "dev").await;
        registry.join_channel(bob, "dev").await;

        assert_eq!(registry.evict_channel("dev").await, 2);
        for slot in [alice, bob] {
            let channels = registry.memberships(slot).await.unwrap();
            assert!(!channels.contains("dev"));
            assert!(channels.contains(GLOBAL_CHANNEL));
        }
    }

    #[tokio::test]
    async fn global_survives_leave_and_eviction() {
        let registry = Registry::new(1);
        let (alice, _a) = admit(&registry, "alice").await;
        assert!(!registry.leave_channel(alice, GLOBAL_CHANNEL).await);
        assert_eq!(registry.evict_channel(GLOBAL_CHANNEL).await, 0);
        assert!(registry
            .memberships(alice)
            .await
            .unwrap()
            .contains(GLOBAL_CHANNEL));
    }
}
