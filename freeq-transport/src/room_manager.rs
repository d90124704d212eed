//! Per-peer room lifecycle: creator election, invite handling and room
//! candidate bookkeeping (§4.2 of SPEC_FULL.md).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::address::{my_place_or_yours, Address, PeerUserId};
use crate::config::TransportConfig;
use crate::display_name_cache::DisplayNameCache;
use crate::error::RoomServiceError;
use crate::room_client::{InviteState, RoomClient, RoomId, RoomInfo};
use crate::user_address_manager::UserAddressManager;

#[derive(Default)]
struct State {
    /// Candidate rooms per address, most-recently-registered first (§3
    /// "AddressMap"). Invariant 2: extras are tolerated, but the head is
    /// preferred.
    address_to_rooms: HashMap<Address, Vec<RoomId>>,
    parked_invites: Vec<(RoomId, InviteState)>,
}

/// Composes the well-known alias for a broadcast room (§6: "Broadcast
/// room alias format"). Resolving the alias to a room id is still an
/// out-of-scope room-service concern; this is only the naming rule.
pub fn broadcast_room_alias(prefix: &str, chain_id: u64, suffix: &str, server_name: &str) -> String {
    format!("#{prefix}_{chain_id}_{suffix}:{server_name}")
}

/// True iff any of the room's aliases (plus its canonical alias)
/// contains one of the configured broadcast suffixes (§4.2
/// "Broadcast-room detection").
fn room_matches_broadcast_suffix(room: &RoomInfo, suffixes: &[String]) -> bool {
    suffixes
        .iter()
        .any(|suffix| room.all_aliases().any(|alias| alias.contains(suffix.as_str())))
}

pub struct RoomManager {
    room_client: Arc<dyn RoomClient>,
    config: TransportConfig,
    own_address: Option<Address>,
    own_user_id: PeerUserId,
    display_names: Arc<DisplayNameCache>,
    user_address_manager: Arc<UserAddressManager>,
    broadcast_room_ids: Mutex<HashSet<RoomId>>,
    state: Mutex<State>,
    accepting_invites: std::sync::atomic::AtomicBool,
    /// One lock per address under creation, so two calls racing to
    /// create a room for the same peer serialize instead of
    /// double-creating (§5 "one RLock per address").
    creation_locks: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
}

impl RoomManager {
    pub fn new(
        room_client: Arc<dyn RoomClient>,
        config: TransportConfig,
        display_names: Arc<DisplayNameCache>,
        user_address_manager: Arc<UserAddressManager>,
        broadcast_room_ids: HashSet<RoomId>,
    ) -> Self {
        let own_user_id = room_client.user_id();
        let own_address = own_user_id.parse_embedded_address();
        Self {
            room_client,
            config,
            own_address,
            own_user_id,
            display_names,
            user_address_manager,
            broadcast_room_ids: Mutex::new(broadcast_room_ids),
            state: Mutex::new(State::default()),
            accepting_invites: std::sync::atomic::AtomicBool::new(false),
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `room_id` as the preferred room for `address`, promoting
    /// it to the head of the candidate list (§3 Invariant 2).
    pub fn set_room_for_address(&self, address: Address, room_id: RoomId) {
        let mut state = self.state.lock();
        let rooms = state.address_to_rooms.entry(address).or_default();
        rooms.retain(|existing| existing != &room_id);
        rooms.insert(0, room_id);
    }

    /// Registers `room_id` as *a* known candidate for `address` without
    /// displacing an already-preferred room, for the invite path where a
    /// second room for an address shouldn't silently take over as the
    /// one in use (§9 Open Question: extra rooms tolerated, not promoted).
    pub fn add_candidate_room(&self, address: Address, room_id: RoomId) {
        let mut state = self.state.lock();
        let rooms = state.address_to_rooms.entry(address).or_default();
        if !rooms.contains(&room_id) {
            rooms.push(room_id);
        }
    }

    /// Candidate rooms for `address`, most-recent first, filtered to
    /// rooms not known to be broadcast rooms (§4.2 "room candidate
    /// selection").
    fn candidates_for(&self, address: &Address) -> Vec<RoomId> {
        let rooms = self.state.lock().address_to_rooms.get(address).cloned().unwrap_or_default();
        rooms.into_iter().filter(|room_id| !self.is_broadcast_room(room_id)).collect()
    }

    /// §4.2 "room candidate selection" with `require_online_peer = false`:
    /// the preferred (head) non-broadcast candidate, if any.
    pub fn get_room_for_address(&self, address: &Address) -> Option<RoomId> {
        self.candidates_for(address).into_iter().next()
    }

    /// §4.2 "room candidate selection" with `require_online_peer = true`:
    /// the first non-broadcast candidate whose current membership
    /// includes one of `address`'s presently-online user ids. Returns
    /// `None` rather than falling back to an offline candidate.
    pub async fn get_room_for_address_online(&self, address: &Address) -> Option<RoomId> {
        let online_users: HashSet<PeerUserId> = self
            .user_address_manager
            .get_userids_for_address(address)
            .into_iter()
            .filter(|user_id| {
                matches!(
                    self.user_address_manager.get_userid_presence(user_id),
                    Some(crate::room_client::Presence::Online) | Some(crate::room_client::Presence::Unavailable)
                )
            })
            .collect();
        if online_users.is_empty() {
            return None;
        }
        for room_id in self.candidates_for(address) {
            if let Ok(members) = self.room_client.get_joined_members(&room_id, false).await {
                if members.iter().any(|member| online_users.contains(member)) {
                    return Some(room_id);
                }
            }
        }
        None
    }

    pub fn register_broadcast_room(&self, room_id: RoomId) {
        self.broadcast_room_ids.lock().insert(room_id);
    }

    pub fn is_broadcast_room(&self, room_id: &RoomId) -> bool {
        self.broadcast_room_ids.lock().contains(room_id)
    }

    /// Classifies a room from the startup inventory by alias, the way
    /// §4.2's "Broadcast-room detection" and §4.6 step 4 ("room
    /// inventory") require — registering it if it matches, independent
    /// of whether it was already known to [`Self::is_broadcast_room`].
    pub fn classify_and_register_if_broadcast(&self, room: &RoomInfo) -> bool {
        if self.is_broadcast_room(&room.room_id) || room_matches_broadcast_suffix(room, &self.config.broadcast_rooms) {
            self.register_broadcast_room(room.room_id.clone());
            true
        } else {
            false
        }
    }

    /// Enables invite processing. Parked invites accumulated before this
    /// call are returned for the caller to replay through
    /// [`Self::handle_invite`] (§4.6 step 9: "deferred invite processing").
    pub fn start_accepting_invites(&self) -> Vec<(RoomId, InviteState)> {
        self.accepting_invites.store(true, std::sync::atomic::Ordering::SeqCst);
        std::mem::take(&mut self.state.lock().parked_invites)
    }

    /// Validates and, if warranted, joins an invited room. Invites that
    /// arrive before startup has finished whitelisting peers are parked
    /// instead, since we can't yet tell a legitimate peer room from a
    /// spoofed one (§4.2, §4.6).
    pub async fn handle_invite(&self, room_id: RoomId, invite: InviteState) -> Result<(), RoomServiceError> {
        if !self.accepting_invites.load(std::sync::atomic::Ordering::SeqCst) {
            self.state.lock().parked_invites.push((room_id, invite));
            return Ok(());
        }

        if !invite.self_invited || !invite.sender_has_joined {
            tracing::debug!(room_id = %room_id, "ignoring invite missing self-invite or sender join event");
            return Ok(());
        }
        let Some(sender) = &invite.sender else {
            return Ok(());
        };
        self.display_names.warm_users(&*self.room_client, std::slice::from_ref(sender)).await?;
        let Some(sender_address) = self.display_names.verified_address(sender) else {
            tracing::warn!(room_id = %room_id, sender = %sender, "ignoring invite, sender display name does not validate");
            return Ok(());
        };

        self.join_room_with_retry(&room_id).await?;
        if self.is_broadcast_room(&room_id) {
            tracing::debug!(room_id = %room_id, "invite to a known broadcast room, ignoring");
            return Ok(());
        }
        self.add_candidate_room(sender_address, room_id);
        Ok(())
    }

    async fn join_room_with_retry(&self, room_id: &RoomId) -> Result<RoomInfo, RoomServiceError> {
        let mut interval = self.config.room_join_retry_interval();
        let mut last_err = None;
        for attempt in 0..self.config.join_retries.max(1) {
            match self.room_client.join_room(room_id).await {
                Ok(info) => return Ok(info),
                Err(err) => {
                    tracing::debug!(room_id = %room_id, attempt, error = %err, "join_room failed, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(interval).await;
                    interval = Duration::from_secs_f64(interval.as_secs_f64() * self.config.room_join_retry_interval_multiplier);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RoomServiceError::new("join_room retries exhausted")))
    }

    fn lock_for(&self, address: Address) -> Arc<tokio::sync::Mutex<()>> {
        self.creation_locks.lock().entry(address).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
    }

    /// Resolves, creating if necessary, the room used to talk to
    /// `peer_address`. The lexicographically smaller address is
    /// responsible for creating the room (§4.2 "asymmetric creator
    /// election"); the other side waits for the invite to land and
    /// retries joining with the configured backoff.
    pub async fn ensure_room_for(&self, peer_address: Address) -> Result<RoomId, RoomServiceError> {
        let own_address = self
            .own_address
            .ok_or_else(|| RoomServiceError::new("own user id does not embed a valid address"))?;

        if let Some(room_id) = self.get_room_for_address(&peer_address) {
            return Ok(room_id);
        }

        let creator = my_place_or_yours(own_address, peer_address);
        if creator != own_address {
            return self.wait_for_peer_created_room(peer_address).await;
        }

        let lock = self.lock_for(peer_address);
        let _guard = lock.lock().await;
        // Re-check: another task may have finished creation while we waited.
        if let Some(room_id) = self.get_room_for_address(&peer_address) {
            return Ok(room_id);
        }
        self.create_room_for(peer_address).await
    }

    async fn wait_for_peer_created_room(&self, peer_address: Address) -> Result<RoomId, RoomServiceError> {
        let mut interval = self.config.room_join_retry_interval();
        for attempt in 0..self.config.join_retries {
            if let Some(room_id) = self.get_room_for_address(&peer_address) {
                return Ok(room_id);
            }
            tracing::debug!(peer = %peer_address, attempt, "waiting for peer to create room");
            tokio::time::sleep(interval).await;
            interval = Duration::from_secs_f64(interval.as_secs_f64() * self.config.room_join_retry_interval_multiplier);
        }

        self.get_room_for_address(&peer_address)
            .ok_or_else(|| RoomServiceError::new("peer never created a room for us"))
    }

    /// §4.2 "Ensure-room-for" steps (a)-(f): directory search, warm and
    /// validate display names, create the room, poll membership, leave
    /// it if anyone unexpected ends up inside, and register the room
    /// under the peer's address otherwise.
    async fn create_room_for(&self, peer_address: Address) -> Result<RoomId, RoomServiceError> {
        let address_hex = peer_address.to_hex();
        let candidates = self.room_client.search_user_directory(&address_hex).await?;
        if candidates.is_empty() {
            return Err(RoomServiceError::new("no room-service users found for peer address"));
        }
        self.display_names.warm_users(&*self.room_client, &candidates).await?;

        let validated: Vec<PeerUserId> = candidates
            .into_iter()
            .filter(|user_id| self.display_names.verified_address(user_id) == Some(peer_address))
            .collect();
        if validated.is_empty() {
            return Err(RoomServiceError::new("no directory candidate validated against the peer address"));
        }

        let room_id = self.room_client.create_room(&validated).await?;

        let allowed: HashSet<PeerUserId> = validated.iter().cloned().chain(std::iter::once(self.own_user_id.clone())).collect();
        let mut interval = self.config.room_join_retry_interval();
        let mut members = Vec::new();
        for attempt in 0..self.config.join_retries.max(1) {
            members = self.room_client.get_joined_members(&room_id, false).await?;
            if members.iter().all(|member| allowed.contains(member)) && members.len() > 1 {
                break;
            }
            tracing::debug!(room_id = %room_id, attempt, "waiting for peer to join freshly created room");
            tokio::time::sleep(interval).await;
            interval = Duration::from_secs_f64(interval.as_secs_f64() * self.config.room_join_retry_interval_multiplier);
        }

        if members.iter().any(|member| !allowed.contains(member)) {
            tracing::warn!(room_id = %room_id, "room has an unexpected member, leaving");
            self.room_client.leave_room(&room_id).await?;
            return Err(RoomServiceError::new("room ended up with a member outside the validated set"));
        }

        for user_id in &validated {
            self.user_address_manager.add_user_id(peer_address, user_id.clone());
        }
        self.set_room_for_address(peer_address, room_id.clone());
        Ok(room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::test_signed_identity;
    use crate::room_client::fake::{FakeNetwork, FakeRoomClient};
    use crate::user_address_manager::{AddressManagerCallbacks, AddressReachability};

    fn config() -> TransportConfig {
        TransportConfig {
            server: "auto".into(),
            available_servers: vec![],
            broadcast_rooms: vec!["discovery".into()],
            retries_before_backoff: 1,
            retry_interval_ms: 10,
            sync_timeout_ms: 1000,
            retry_queue_idle_after: 2,
            join_retries: 3,
            room_join_retry_interval_ms: 5,
            room_join_retry_interval_multiplier: 1.0,
            chain_id: 1,
            room_prefix: "freeq".into(),
            server_name: None,
        }
    }

    struct NoopCallbacks;
    impl AddressManagerCallbacks for NoopCallbacks {
        fn on_address_reachability_changed(&self, _: Address, _: AddressReachability) {}
        fn on_user_presence_changed(&self, _: &PeerUserId, _: crate::room_client::Presence) {}
    }

    fn manager_for(client: Arc<dyn RoomClient>) -> RoomManager {
        RoomManager::new(
            client,
            config(),
            Arc::new(DisplayNameCache::new()),
            Arc::new(UserAddressManager::new(Arc::new(NoopCallbacks))),
            HashSet::new(),
        )
    }

    #[tokio::test]
    async fn lower_address_creates_the_room() {
        let network = FakeNetwork::new();
        let (low_addr, low_id, low_name) = test_signed_identity("example.org");
        let (high_addr, high_id, high_name) = test_signed_identity("example.org");
        let client_low: Arc<dyn RoomClient> = Arc::new(FakeRoomClient::new(network.clone(), low_id, low_name));
        // Register the peer's directory entry so the creator side can find it.
        let _peer_client = FakeRoomClient::new(network.clone(), high_id.clone(), high_name);

        let manager = manager_for(client_low);
        let room_id = manager.ensure_room_for(high_addr).await.unwrap();
        assert_eq!(manager.get_room_for_address(&high_addr), Some(room_id));
        let _ = low_addr;
    }

    #[tokio::test]
    async fn higher_address_waits_for_invite_then_finds_the_room() {
        let network = FakeNetwork::new();
        let (low_addr, low_id, _low_name) = test_signed_identity("example.org");
        let (high_addr, high_id, high_name) = test_signed_identity("example.org");
        let client_high: Arc<dyn RoomClient> = Arc::new(FakeRoomClient::new(network.clone(), high_id, high_name));

        let manager = manager_for(client_high);
        let room_id = network.create_room(&low_id, &[]);
        manager.set_room_for_address(low_addr, room_id.clone());

        let resolved = manager.ensure_room_for(low_addr).await.unwrap();
        assert_eq!(resolved, room_id);
        let _ = high_addr;
    }

    #[tokio::test]
    async fn invite_before_startup_is_parked_then_replayed() {
        let network = FakeNetwork::new();
        let (_me_addr, me_id, me_name) = test_signed_identity("example.org");
        let (sender_addr, sender_id, sender_name) = test_signed_identity("example.org");
        let client: Arc<dyn RoomClient> = Arc::new(FakeRoomClient::new(network.clone(), me_id, me_name));
        let _sender_client = FakeRoomClient::new(network.clone(), sender_id.clone(), sender_name);
        let manager = manager_for(client);

        let room_id = network.create_room(&sender_id, &[]);
        let invite = InviteState {
            self_invited: true,
            sender: Some(sender_id.clone()),
            sender_has_joined: true,
            invite_only: true,
        };
        manager.handle_invite(room_id.clone(), invite.clone()).await.unwrap();
        assert_eq!(manager.get_room_for_address(&sender_addr), None);

        let parked = manager.start_accepting_invites();
        assert_eq!(parked.len(), 1);
        manager.handle_invite(parked[0].0.clone(), parked[0].1.clone()).await.unwrap();
        assert_eq!(manager.get_room_for_address(&sender_addr), Some(room_id));
    }

    #[tokio::test]
    async fn create_room_for_registers_validated_peer_user_id() {
        let network = FakeNetwork::new();
        let (me_addr, me_id, me_name) = test_signed_identity("example.org");
        let (peer_addr, peer_id, peer_name) = test_signed_identity("example.org");
        let client: Arc<dyn RoomClient> = Arc::new(FakeRoomClient::new(network.clone(), me_id, me_name));
        let _peer_client = FakeRoomClient::new(network.clone(), peer_id.clone(), peer_name);

        let user_address_manager = Arc::new(UserAddressManager::new(Arc::new(NoopCallbacks)));
        let manager = RoomManager::new(
            client,
            config(),
            Arc::new(DisplayNameCache::new()),
            user_address_manager.clone(),
            HashSet::new(),
        );

        manager.create_room_for(peer_addr).await.unwrap();
        assert_eq!(user_address_manager.get_userids_for_address(&peer_addr), vec![peer_id]);
        let _ = me_addr;
    }

    #[tokio::test]
    async fn create_room_for_fails_when_no_directory_candidate_validates() {
        let network = FakeNetwork::new();
        let (_me_addr, me_id, me_name) = test_signed_identity("example.org");
        let client: Arc<dyn RoomClient> = Arc::new(FakeRoomClient::new(network.clone(), me_id, me_name));
        let manager = manager_for(client);

        // No room-service account was ever registered for this address,
        // so the directory search comes back empty.
        let nobody = Address([0x42; 20]);
        let err = manager.create_room_for(nobody).await.unwrap_err();
        assert!(err.0.contains("no room-service users"));
    }

    #[tokio::test]
    async fn online_room_selection_skips_candidates_missing_the_online_peer() {
        let network = FakeNetwork::new();
        let (_me_addr, me_id, me_name) = test_signed_identity("example.org");
        let (peer_addr, peer_id, peer_name) = test_signed_identity("example.org");
        let client: Arc<dyn RoomClient> = Arc::new(FakeRoomClient::new(network.clone(), me_id, me_name));
        let peer_client = FakeRoomClient::new(network.clone(), peer_id.clone(), peer_name);

        let user_address_manager = Arc::new(UserAddressManager::new(Arc::new(NoopCallbacks)));
        let manager = RoomManager::new(
            client,
            config(),
            Arc::new(DisplayNameCache::new()),
            user_address_manager.clone(),
            HashSet::new(),
        );
        user_address_manager.add_user_id(peer_addr, peer_id.clone());

        // Stale room: the peer never joined it.
        let (_, bystander_id, _) = test_signed_identity("example.org");
        let stale_room = network.create_room(&bystander_id, &[]);
        manager.set_room_for_address(peer_addr, stale_room.clone());
        assert!(manager.get_room_for_address_online(&peer_addr).await.is_none());

        // Fresh room the peer has actually joined, registered second (not head).
        let live_room = network.create_room(&peer_id, &[]);
        let _ = peer_client.join_room(&live_room).await;
        manager.add_candidate_room(peer_addr, live_room.clone());
        user_address_manager.update_presence(&peer_id, crate::room_client::Presence::Online);

        assert_eq!(manager.get_room_for_address(&peer_addr), Some(stale_room));
        assert_eq!(manager.get_room_for_address_online(&peer_addr).await, Some(live_room));
    }

    #[test]
    fn broadcast_alias_matches_configured_suffix() {
        let room = RoomInfo {
            room_id: RoomId("!broadcast:example.org".into()),
            aliases: vec!["#freeq_1_discovery:example.org".into()],
            canonical_alias: None,
            invite_only: false,
            members: vec![],
        };
        assert!(room_matches_broadcast_suffix(&room, &["discovery".to_string()]));
        assert!(!room_matches_broadcast_suffix(&room, &["monitoring".to_string()]));
    }

    #[test]
    fn broadcast_room_alias_format_matches_spec() {
        assert_eq!(
            broadcast_room_alias("freeq", 1, "discovery", "example.org"),
            "#freeq_1_discovery:example.org"
        );
    }
}
