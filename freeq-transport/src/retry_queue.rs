//! Per-peer retry queue: batches, deduplicates and exponentially backs
//! off retryable messages addressed to one node, self-terminating once
//! idle (§4.1 of SPEC_FULL.md).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::address::Address;
use crate::backoff::{BackoffSchedule, ExpirationPredicate};
use crate::broadcast::BroadcastWorker;
use crate::config::TransportConfig;
use crate::message::{make_message_batches, OutboundMessage};
use crate::queue::QueueIdentifier;
use crate::room_client::RoomClient;
use crate::room_manager::RoomManager;
use crate::user_address_manager::{AddressReachability, UserAddressManager};

/// View onto the host application's live outbound queues, used to tell
/// whether a retryable message is still owed a delivery (§4.1: "a
/// message is removed from the retry queue once it no longer appears in
/// the application's live outbound queue").
pub trait AppQueueView: Send + Sync {
    fn contains(&self, queue_identifier: QueueIdentifier, message_identifier: u64) -> bool;
}

struct Entry {
    queue_identifier: QueueIdentifier,
    message: OutboundMessage,
    text: String,
    /// `None` for messages sent once and forgotten (`Delivered`/`Ping`/`Pong`).
    expiration: Option<ExpirationPredicate>,
}

pub struct RetryQueue {
    recipient: Address,
    room_client: Arc<dyn RoomClient>,
    room_manager: Arc<RoomManager>,
    user_address_manager: Arc<UserAddressManager>,
    app_queue_view: Arc<dyn AppQueueView>,
    broadcast: Arc<BroadcastWorker>,
    config: TransportConfig,
    entries: Mutex<Vec<Entry>>,
    notify: Notify,
    stopping: AtomicBool,
}

impl RetryQueue {
    pub fn new(
        recipient: Address,
        room_client: Arc<dyn RoomClient>,
        room_manager: Arc<RoomManager>,
        user_address_manager: Arc<UserAddressManager>,
        app_queue_view: Arc<dyn AppQueueView>,
        broadcast: Arc<BroadcastWorker>,
        config: TransportConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            recipient,
            room_client,
            room_manager,
            user_address_manager,
            app_queue_view,
            broadcast,
            config,
            entries: Mutex::new(Vec::new()),
            notify: Notify::new(),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn recipient(&self) -> Address {
        self.recipient
    }

    fn fresh_expiration(&self) -> ExpirationPredicate {
        ExpirationPredicate::new(BackoffSchedule::new(
            self.config.retries_before_backoff,
            self.config.retry_interval(),
            self.config.retry_interval_ceiling(),
        ))
    }

    /// Queues a message for an ordered or unordered channel. Re-enqueuing
    /// the same `(queue_identifier, message_identifier)` resets its
    /// backoff, matching a fresh retry cycle started by the application.
    pub fn enqueue(&self, queue_identifier: QueueIdentifier, message: OutboundMessage) {
        let text = message.serialize();
        let expiration = message.is_retryable().then(|| self.fresh_expiration());
        let mut entries = self.entries.lock();
        match message.message_identifier() {
            Some(message_identifier) => entries.retain(|entry| {
                !(entry.queue_identifier == queue_identifier
                    && entry.message.message_identifier() == Some(message_identifier))
            }),
            // Non-retryable messages (Delivered/Ping/Pong) have no identifier to
            // key on; dedup by exact (queue_identifier, message) equality instead
            // so a repeated ack doesn't double-send (§8 "Dedup").
            None => {
                if entries
                    .iter()
                    .any(|entry| entry.queue_identifier == queue_identifier && entry.message == message)
                {
                    return;
                }
            }
        }
        entries.push(Entry {
            queue_identifier,
            message,
            text,
            expiration,
        });
        drop(entries);
        self.notify();
    }

    pub fn enqueue_unordered(&self, message: OutboundMessage) {
        self.enqueue(QueueIdentifier::unordered(self.recipient), message);
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify();
    }

    pub fn is_idle(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Runs one tick of the retry loop synchronously, for tests that
    /// need deterministic control over when a send attempt happens.
    pub async fn tick(&self, now: Instant) -> bool {
        self.check_and_send(now).await
    }

    /// One tick of the retry loop: drops messages the application no
    /// longer owes, sends whatever is due, and reports whether the
    /// queue is now empty.
    async fn check_and_send(&self, now: Instant) -> bool {
        // §4.1: if the broadcast queue is prioritized (startup monitoring
        // traffic, or anything enqueued since), let it drain before this
        // peer's traffic goes out.
        if self.broadcast.is_prioritized() {
            self.broadcast.wait_until_drained().await;
        }

        if self.user_address_manager.get_address_reachability(&self.recipient) != AddressReachability::Reachable {
            tracing::debug!(recipient = %self.recipient, "skipping retry tick, recipient unreachable");
            return self.is_idle();
        }
        // Prefer a room the peer is currently known to be sitting in
        // (require_online_peer = true); fall back to the plain head
        // candidate only if no online-intersecting room surfaced at all
        // (e.g. the application's reachability view is ahead of the room
        // service's own member-join bookkeeping).
        let room_id = match self.room_manager.get_room_for_address_online(&self.recipient).await {
            Some(room_id) => room_id,
            None => match self.room_manager.get_room_for_address(&self.recipient) {
                Some(room_id) => room_id,
                None => {
                    tracing::debug!(recipient = %self.recipient, "skipping retry tick, no room yet");
                    return self.is_idle();
                }
            },
        };

        let due_texts = {
            let mut entries = self.entries.lock();
            entries.retain(|entry| match entry.message.message_identifier() {
                Some(message_identifier) => self.app_queue_view.contains(entry.queue_identifier, message_identifier),
                None => true,
            });

            let mut due = Vec::new();
            let mut sent_once = Vec::new();
            for (index, entry) in entries.iter_mut().enumerate() {
                match &mut entry.expiration {
                    Some(expiration) => {
                        if expiration.poll(now) {
                            due.push(entry.text.clone());
                        }
                    }
                    None => {
                        due.push(entry.text.clone());
                        sent_once.push(index);
                    }
                }
            }
            for index in sent_once.into_iter().rev() {
                entries.remove(index);
            }
            due
        };

        if !due_texts.is_empty() {
            for batch in make_message_batches(due_texts) {
                if let Err(err) = self.room_client.send_text(&room_id, &batch).await {
                    tracing::warn!(recipient = %self.recipient, error = %err, "send_text failed, will retry");
                }
            }
        }

        self.is_idle()
    }

    /// Runs until the application stops the queue or it has been idle
    /// for `retry_queue_idle_after` consecutive ticks (§4.1).
    pub async fn run(self: Arc<Self>) {
        let mut idle_ticks: u32 = 0;
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }

            let idle = self.check_and_send(Instant::now()).await;
            if idle {
                idle_ticks += 1;
                if idle_ticks >= self.config.retry_queue_idle_after {
                    tracing::debug!(recipient = %self.recipient, "retry queue idle, terminating");
                    return;
                }
            } else {
                idle_ticks = 0;
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.retry_interval()) => {}
            }
        }
    }
}
