//! Validates and decodes one sync round's events into messages the
//! application can see, and synthesizes delivery acks (§4.5 of
//! SPEC_FULL.md).

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::{Address, PeerUserId};
use crate::display_name_cache::DisplayNameCache;
use crate::message::{parse_ndjson_body, OutboundMessage};
use crate::room_client::{Presence, RoomClient, RoomId, SyncBatch};
use crate::room_manager::RoomManager;

pub struct InboundEvent {
    pub sender: Address,
    pub message: OutboundMessage,
}

#[derive(Default)]
pub struct ProcessedSync {
    pub inbound: Vec<InboundEvent>,
    /// `Delivered` acks owed back to a sender, ready to hand to that
    /// peer's retry queue.
    pub acks: Vec<(Address, OutboundMessage)>,
    pub presence: Vec<(PeerUserId, Presence)>,
    /// Passed through unvalidated; the room manager owns invite
    /// acceptance policy.
    pub invites: Vec<(RoomId, crate::room_client::InviteState)>,
}

pub struct InboundPipeline {
    own_user_id: PeerUserId,
    display_names: Arc<DisplayNameCache>,
    room_manager: Arc<RoomManager>,
    whitelist: Mutex<HashSet<Address>>,
}

impl InboundPipeline {
    pub fn new(own_user_id: PeerUserId, display_names: Arc<DisplayNameCache>, room_manager: Arc<RoomManager>) -> Self {
        Self {
            own_user_id,
            display_names,
            room_manager,
            whitelist: Mutex::new(HashSet::new()),
        }
    }

    pub fn whitelist_address(&self, address: Address) {
        self.whitelist.lock().insert(address);
    }

    pub fn is_whitelisted(&self, address: &Address) -> bool {
        self.whitelist.lock().contains(address)
    }

    /// Validates and decodes one sync round. Messages from broadcast
    /// rooms, self-sent echoes, unsigned/spoofed senders, and
    /// non-whitelisted senders are dropped without surfacing an error —
    /// a protocol violation from an untrusted room is an expected event,
    /// not a fault (§7).
    pub async fn process_sync(&self, room_client: &dyn RoomClient, batch: SyncBatch) -> ProcessedSync {
        let mut processed = ProcessedSync {
            presence: batch.presence,
            invites: batch.invites,
            ..Default::default()
        };

        for (room_id, sender, body) in batch.messages {
            if self.room_manager.is_broadcast_room(&room_id) {
                continue;
            }
            if sender == self.own_user_id {
                continue;
            }
            self.handle_message(room_client, &room_id, &sender, &body, &mut processed).await;
        }

        processed
    }

    async fn handle_message(
        &self,
        room_client: &dyn RoomClient,
        room_id: &RoomId,
        sender: &PeerUserId,
        body: &str,
        processed: &mut ProcessedSync,
    ) {
        if self.display_names.get(sender).is_none() {
            if let Ok(Some(display_name)) = room_client.display_name(sender).await {
                self.display_names.set(sender.clone(), display_name);
            }
        }
        let Some(sender_address) = self.display_names.verified_address(sender) else {
            tracing::debug!(sender = %sender, "dropping message, display name does not verify");
            return;
        };
        if !self.is_whitelisted(&sender_address) {
            tracing::debug!(sender = %sender, "dropping message from non-whitelisted address");
            return;
        }
        // Rooms are only ever registered for a peer through the
        // invite/creation paths, never by receiving a message: a room
        // that was never registered for this peer is treated as spoofed
        // rather than adopted.
        if self.room_manager.get_room_for_address(&sender_address).as_ref() != Some(room_id) {
            tracing::warn!(sender = %sender, room_id = %room_id, "dropping message, unknown room for sender");
            return;
        }

        for message in parse_ndjson_body(body) {
            if let Some(message_identifier) = message.message_identifier() {
                processed.acks.push((
                    sender_address,
                    OutboundMessage::Delivered {
                        delivered_message_identifier: message_identifier,
                    },
                ));
            }
            processed.inbound.push(InboundEvent {
                sender: sender_address,
                message,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room_client::fake::{FakeNetwork, FakeRoomClient};
    use std::collections::HashSet as StdHashSet;

    fn addressed_user_id(byte: u8) -> PeerUserId {
        let address = Address([byte; 20]);
        PeerUserId::new(format!("@peer_{}:example.org", address.to_hex()))
    }

    struct NoopManagerCallbacks;
    impl crate::user_address_manager::AddressManagerCallbacks for NoopManagerCallbacks {
        fn on_address_reachability_changed(&self, _: Address, _: crate::user_address_manager::AddressReachability) {}
        fn on_user_presence_changed(&self, _: &PeerUserId, _: Presence) {}
    }

    #[tokio::test]
    async fn drops_messages_from_non_whitelisted_senders() {
        let network = FakeNetwork::new();
        let me = addressed_user_id(0x01);
        let sender = addressed_user_id(0x02);
        let client: Arc<dyn RoomClient> = Arc::new(FakeRoomClient::new(network.clone(), me.clone(), "sig".into()));
        let room_manager = Arc::new(RoomManager::new(
            client.clone(),
            crate::config::TransportConfig {
                server: "auto".into(),
                available_servers: vec![],
                broadcast_rooms: vec![],
                retries_before_backoff: 1,
                retry_interval_ms: 10,
                sync_timeout_ms: 1000,
                retry_queue_idle_after: 2,
                join_retries: 1,
                room_join_retry_interval_ms: 5,
                room_join_retry_interval_multiplier: 1.0,
                chain_id: 1,
                room_prefix: "freeq".into(),
                server_name: None,
            },
            Arc::new(DisplayNameCache::new()),
            Arc::new(crate::user_address_manager::UserAddressManager::new(Arc::new(NoopManagerCallbacks))),
            StdHashSet::new(),
        ));

        let pipeline = InboundPipeline::new(me, Arc::new(DisplayNameCache::new()), room_manager);

        let room_id = network.create_room(&sender, &[]);
        let batch = SyncBatch {
            messages: vec![(room_id, sender, "not json".to_string())],
            invites: vec![],
            presence: vec![],
        };
        let processed = pipeline.process_sync(&*client, batch).await;
        assert!(processed.inbound.is_empty());
        assert!(processed.acks.is_empty());
    }

    #[tokio::test]
    async fn drops_message_from_a_room_not_registered_for_the_sender() {
        let network = FakeNetwork::new();
        let me = addressed_user_id(0x03);
        let sender = addressed_user_id(0x04);
        let client: Arc<dyn RoomClient> = Arc::new(FakeRoomClient::new(network.clone(), me.clone(), "sig".into()));
        let sender_client = FakeRoomClient::new(network.clone(), sender.clone(), "sig2".into());
        let room_manager = Arc::new(RoomManager::new(
            client.clone(),
            crate::config::TransportConfig {
                server: "auto".into(),
                available_servers: vec![],
                broadcast_rooms: vec![],
                retries_before_backoff: 1,
                retry_interval_ms: 10,
                sync_timeout_ms: 1000,
                retry_queue_idle_after: 2,
                join_retries: 1,
                room_join_retry_interval_ms: 5,
                room_join_retry_interval_multiplier: 1.0,
                chain_id: 1,
                room_prefix: "freeq".into(),
                server_name: None,
            },
            Arc::new(DisplayNameCache::new()),
            Arc::new(crate::user_address_manager::UserAddressManager::new(Arc::new(NoopManagerCallbacks))),
            StdHashSet::new(),
        ));

        let sender_address = sender.parse_embedded_address().unwrap();
        let pipeline = InboundPipeline::new(me, Arc::new(DisplayNameCache::new()), room_manager);
        pipeline.whitelist_address(sender_address);

        // A room the sender never invited us to, or that was never
        // registered via `ensure_room_for`/`handle_invite`.
        let spoofed_room = network.create_room(&sender, &[]);
        let _ = sender_client.join_room(&spoofed_room).await;
        let batch = SyncBatch {
            messages: vec![(spoofed_room, sender, serde_json::json!({"type": "Ping"}).to_string())],
            invites: vec![],
            presence: vec![],
        };
        let processed = pipeline.process_sync(&*client, batch).await;
        assert!(processed.inbound.is_empty());
        assert!(processed.acks.is_empty());
    }
}
