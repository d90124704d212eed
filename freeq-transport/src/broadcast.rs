//! Coalesced fire-and-forget posting to public/broadcast rooms (§4.2's
//! "broadcast-room detection" counterpart: the send-side worker).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::message::make_message_batches;
use crate::room_client::{RoomClient, RoomId};

/// Posts to a fixed set of known broadcast rooms, resolved once at
/// startup (§4.6 step 4: "join broadcast rooms"). Unlike [`crate::retry_queue::RetryQueue`]
/// these messages are never retried: broadcast traffic (presence,
/// discovery) is inherently best-effort.
pub struct BroadcastWorker {
    room_client: Arc<dyn RoomClient>,
    rooms: HashMap<String, RoomId>,
    queue: Mutex<HashMap<String, Vec<String>>>,
    notify: Notify,
    drained: Notify,
    prioritize: AtomicBool,
    poll_interval: Duration,
}

impl BroadcastWorker {
    pub fn new(room_client: Arc<dyn RoomClient>, rooms: HashMap<String, RoomId>, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            room_client,
            rooms,
            queue: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            drained: Notify::new(),
            prioritize: AtomicBool::new(false),
            poll_interval,
        })
    }

    /// Whether broadcast traffic is queued or being sent — the
    /// `prioritize_broadcast_messages` startup gate that
    /// [`crate::retry_queue::RetryQueue`] blocks on (§4.1).
    pub fn is_prioritized(&self) -> bool {
        self.prioritize.load(Ordering::SeqCst)
    }

    /// Blocks until the broadcast queue has drained, racing the check
    /// against the clearing notification so a drain that completes
    /// between the check and the wait is never missed.
    pub async fn wait_until_drained(&self) {
        loop {
            if !self.is_prioritized() {
                return;
            }
            let notified = self.drained.notified();
            if !self.is_prioritized() {
                return;
            }
            notified.await;
        }
    }

    /// Queues `text` for the broadcast room identified by `room_suffix`
    /// (e.g. `"discovery"`, `"monitoring"`). Unknown suffixes are
    /// dropped with a warning — there's no room to post them to.
    pub fn enqueue(&self, room_suffix: &str, text: String) {
        if !self.rooms.contains_key(room_suffix) {
            tracing::warn!(room_suffix, "dropping broadcast, no room resolved for suffix");
            return;
        }
        self.queue.lock().entry(room_suffix.to_string()).or_default().push(text);
        self.prioritize.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    async fn drain_once(&self) {
        let pending: HashMap<String, Vec<String>> = std::mem::take(&mut *self.queue.lock());
        for (suffix, texts) in pending {
            let Some(room_id) = self.rooms.get(&suffix) else { continue };
            for batch in make_message_batches(texts) {
                if let Err(err) = self.room_client.send_text(room_id, &batch).await {
                    tracing::warn!(room_suffix = %suffix, error = %err, "broadcast send failed, dropping batch");
                }
            }
        }
        self.prioritize.store(false, Ordering::SeqCst);
        self.drained.notify_waiters();
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            self.drain_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PeerUserId;
    use crate::room_client::fake::{FakeNetwork, FakeRoomClient};

    #[tokio::test]
    async fn drains_queued_text_into_the_resolved_room() {
        let network = FakeNetwork::new();
        let me = PeerUserId::new("@peer_aa:example.org".to_string());
        let client: Arc<dyn RoomClient> = Arc::new(FakeRoomClient::new(network.clone(), me.clone(), "sig".into()));
        let room_id = network.create_broadcast_room("#freeq_discovery_1:example.org");
        network.join(&room_id, &me).unwrap();

        let mut rooms = HashMap::new();
        rooms.insert("discovery".to_string(), room_id.clone());
        let worker = BroadcastWorker::new(client, rooms, Duration::from_millis(10));

        worker.enqueue("discovery", "hello".to_string());
        worker.drain_once().await;

        let reader_id = PeerUserId::new("@peer_bb:example.org".to_string());
        let reader = FakeRoomClient::new(network.clone(), reader_id.clone(), "sig2".into());
        reader.join_room(&room_id).await.unwrap();
        let info = reader.rooms().await.unwrap();
        assert!(info.iter().any(|room| room.room_id == room_id));
    }

    #[tokio::test]
    async fn unknown_suffix_is_dropped_without_panicking() {
        let network = FakeNetwork::new();
        let me = PeerUserId::new("@peer_cc:example.org".to_string());
        let client: Arc<dyn RoomClient> = Arc::new(FakeRoomClient::new(network.clone(), me, "sig".into()));
        let worker = BroadcastWorker::new(client, HashMap::new(), Duration::from_millis(10));
        worker.enqueue("unknown", "hello".to_string());
        worker.drain_once().await;
    }
}
