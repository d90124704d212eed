//! Orchestrates every collaborator through the startup/shutdown
//! sequence and exposes the application-facing send/broadcast API
//! (§4.6 of SPEC_FULL.md).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::address::{Address, PeerUserId};
use crate::broadcast::BroadcastWorker;
use crate::config::TransportConfig;
use crate::display_name_cache::DisplayNameCache;
use crate::error::{Result, TransportError};
use crate::inbound::InboundPipeline;
use crate::message::OutboundMessage;
use crate::queue::QueueIdentifier;
use crate::retry_queue::{AppQueueView, RetryQueue};
use crate::room_client::{Presence, RoomClient, RoomId};
use crate::room_manager::RoomManager;
use crate::user_address_manager::{AddressManagerCallbacks, AddressReachability, UserAddressManager};

/// Delivers decoded inbound messages to the host application.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, sender: Address, message: OutboundMessage);
}

struct ReachabilityBridge {
    retry_queues: Arc<Mutex<HashMap<Address, Arc<RetryQueue>>>>,
}

impl AddressManagerCallbacks for ReachabilityBridge {
    fn on_address_reachability_changed(&self, address: Address, reachability: AddressReachability) {
        tracing::info!(address = %address, ?reachability, "peer reachability changed");
        if reachability == AddressReachability::Reachable {
            if let Some(queue) = self.retry_queues.lock().get(&address) {
                queue.notify();
            }
        }
    }

    fn on_user_presence_changed(&self, user_id: &PeerUserId, presence: Presence) {
        tracing::debug!(user_id = %user_id, ?presence, "peer presence changed");
    }
}

pub struct Transport {
    room_client: Arc<dyn RoomClient>,
    config: TransportConfig,
    display_names: Arc<DisplayNameCache>,
    user_address_manager: Arc<UserAddressManager>,
    room_manager: Arc<RoomManager>,
    inbound: Arc<InboundPipeline>,
    broadcast: Arc<BroadcastWorker>,
    app_queue_view: Arc<dyn AppQueueView>,
    message_handler: Arc<dyn MessageHandler>,
    retry_queues: Arc<Mutex<HashMap<Address, Arc<RetryQueue>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    /// Serializes the health-check critical section (§4.6 "Health
    /// check"); a single permit, matching the source's `Semaphore()`.
    health_check_lock: tokio::sync::Semaphore,
}

impl Transport {
    /// `broadcast_room_ids` are pre-resolved (room, suffix) pairs the
    /// host application already knows about; resolving an alias to a
    /// room id is an out-of-scope room-service concern (§1).
    pub fn new(
        room_client: Arc<dyn RoomClient>,
        config: TransportConfig,
        app_queue_view: Arc<dyn AppQueueView>,
        message_handler: Arc<dyn MessageHandler>,
        broadcast_room_ids: HashMap<String, RoomId>,
    ) -> Self {
        let retry_queues = Arc::new(Mutex::new(HashMap::new()));
        let user_address_manager = Arc::new(UserAddressManager::new(Arc::new(ReachabilityBridge {
            retry_queues: retry_queues.clone(),
        })));
        let display_names = Arc::new(DisplayNameCache::new());
        let room_manager = Arc::new(RoomManager::new(
            room_client.clone(),
            config.clone(),
            display_names.clone(),
            user_address_manager.clone(),
            broadcast_room_ids.values().cloned().collect(),
        ));
        let inbound = Arc::new(InboundPipeline::new(room_client.user_id(), display_names.clone(), room_manager.clone()));
        let broadcast = BroadcastWorker::new(room_client.clone(), broadcast_room_ids, config.retry_interval());

        Self {
            room_client,
            config,
            display_names,
            user_address_manager,
            room_manager,
            inbound,
            broadcast,
            app_queue_view,
            message_handler,
            retry_queues,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            health_check_lock: tokio::sync::Semaphore::new(1),
        }
    }

    /// Runs the startup sequence (§4.6): login, a message-less first
    /// sync, room inventory, broadcast-room joins, worker startup,
    /// presence announcement, then whitelisting and deferred invite
    /// processing for `initial_addresses`.
    pub async fn start(self: &Arc<Self>, initial_addresses: &[(Address, PeerUserId)]) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }

        self.room_client.login(None).await?;
        let first_sync = self.room_client.sync(true).await?;
        for (room_id, invite) in first_sync.invites {
            self.room_manager.handle_invite(room_id, invite).await?;
        }

        for room in self.room_client.rooms().await? {
            if self.room_manager.classify_and_register_if_broadcast(&room) {
                continue;
            }

            let mut partner_addresses = std::collections::HashSet::new();
            for member in &room.members {
                if member == &self.room_client.user_id() {
                    continue;
                }
                if self.display_names.get(member).is_none() {
                    if let Ok(Some(name)) = self.room_client.display_name(member).await {
                        self.display_names.set(member.clone(), name);
                    }
                }
                if let Some(address) = self.display_names.verified_address(member) {
                    partner_addresses.insert(address);
                }
            }

            match partner_addresses.len() {
                0 => {}
                1 => {
                    let address = *partner_addresses.iter().next().expect("len checked above");
                    self.room_manager.set_room_for_address(address, room.room_id.clone());
                }
                _ => {
                    tracing::warn!(room_id = %room.room_id, partners = partner_addresses.len(), "room has more than one validated partner, leaving");
                    if let Err(err) = self.room_client.leave_room(&room.room_id).await {
                        tracing::warn!(room_id = %room.room_id, error = %err, "failed to leave malformed room");
                    }
                }
            }
        }

        let this = self.clone();
        self.tasks.lock().push(tokio::spawn(async move { this.run_sync_loop().await }));
        let broadcast = self.broadcast.clone();
        self.tasks.lock().push(tokio::spawn(async move { broadcast.run().await }));

        self.room_client.set_presence(Presence::Online).await?;

        for (address, user_id) in initial_addresses {
            self.whitelist(*address, user_id.clone());
        }

        let parked = self.room_manager.start_accepting_invites();
        for (room_id, invite) in parked {
            self.room_manager.handle_invite(room_id, invite).await?;
        }

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        for queue in self.retry_queues.lock().values() {
            queue.request_stop();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.room_client.set_presence(Presence::Offline).await?;
        Ok(())
    }

    /// Registers `address` as reachable for application traffic, under
    /// the room-service identity `user_id`, and kicks off room creation
    /// if one doesn't already exist (§4.6 step "whitelist initial addresses").
    pub fn whitelist(&self, address: Address, user_id: PeerUserId) {
        self.user_address_manager.add_user_id(address, user_id);
        self.inbound.whitelist_address(address);

        if self.room_manager.get_room_for_address(&address).is_none() {
            let room_manager = self.room_manager.clone();
            tokio::spawn(async move {
                if let Err(err) = room_manager.ensure_room_for(address).await {
                    tracing::warn!(address = %address, error = %err, "failed to establish room for whitelisted peer");
                }
            });
        }
    }

    /// Whitelists `address` and, under the dedicated health-check
    /// permit, probes the user directory to seed every known user id
    /// for it (§4.6 "Health check").
    pub async fn health_check(&self, address: Address, user_id: PeerUserId) -> Result<()> {
        let _permit = self.health_check_lock.acquire().await.expect("health check semaphore is never closed");
        self.whitelist(address, user_id);

        let candidates = self.room_client.search_user_directory(&address.to_hex()).await?;
        self.display_names.warm_users(&*self.room_client, &candidates).await?;
        for candidate in candidates {
            if self.display_names.verified_address(&candidate) == Some(address) {
                self.user_address_manager.add_user_id(address, candidate);
            }
        }
        Ok(())
    }

    fn retry_queue_for(&self, address: Address) -> Arc<RetryQueue> {
        let mut queues = self.retry_queues.lock();
        if let Some(queue) = queues.get(&address) {
            return queue.clone();
        }
        let queue = RetryQueue::new(
            address,
            self.room_client.clone(),
            self.room_manager.clone(),
            self.user_address_manager.clone(),
            self.app_queue_view.clone(),
            self.broadcast.clone(),
            self.config.clone(),
        );
        queues.insert(address, queue.clone());
        let runner = queue.clone();
        self.tasks.lock().push(tokio::spawn(async move { runner.run().await }));
        queue
    }

    /// Enqueues a retryable message addressed to `recipient` on the
    /// given ordered (or unordered) queue. Delivery is attempted once
    /// the peer is reachable and a room exists; see [`RetryQueue`].
    pub fn send_async(&self, recipient: Address, queue_identifier: QueueIdentifier, message_identifier: u64, payload: serde_json::Value) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        let queue = self.retry_queue_for(recipient);
        queue.enqueue(
            queue_identifier,
            OutboundMessage::Retryable {
                message_identifier,
                payload,
            },
        );
        Ok(())
    }

    pub fn broadcast(&self, room_suffix: &str, payload: serde_json::Value) {
        let message = OutboundMessage::Retryable {
            message_identifier: 0,
            payload,
        };
        self.broadcast.enqueue(room_suffix, message.serialize());
    }

    async fn run_sync_loop(self: Arc<Self>) {
        loop {
            if !self.started.load(Ordering::SeqCst) {
                return;
            }
            match self.room_client.sync(false).await {
                Ok(batch) => self.dispatch_sync_batch(batch).await,
                Err(err) => {
                    tracing::warn!(error = %err, "sync round failed");
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn dispatch_sync_batch(&self, batch: crate::room_client::SyncBatch) {
        let processed = self.inbound.process_sync(&*self.room_client, batch).await;

        for (user_id, presence) in processed.presence {
            self.user_address_manager.update_presence(&user_id, presence);
        }
        for (room_id, invite) in processed.invites {
            if let Err(err) = self.room_manager.handle_invite(room_id, invite).await {
                tracing::warn!(error = %err, "failed to handle invite");
            }
        }
        for (sender, ack) in processed.acks {
            self.retry_queue_for(sender).enqueue_unordered(ack);
        }
        for event in processed.inbound {
            self.message_handler.on_message(event.sender, event.message);
        }
    }
}
