//! The `RoomClient` collaborator interface (§4.7, §1 "out of scope:
//! the room-service client"). The transport core only ever talks to
//! the room service through this trait, so it can run against a real
//! IRC/Matrix-style client or, in tests, an in-process fake.

use async_trait::async_trait;

use crate::address::PeerUserId;
use crate::error::RoomServiceError;

pub type Result<T> = std::result::Result<T, RoomServiceError>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(pub String);

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Online,
    Unavailable,
    Offline,
}

#[derive(Clone, Debug)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub aliases: Vec<String>,
    pub canonical_alias: Option<String>,
    pub invite_only: bool,
    pub members: Vec<PeerUserId>,
}

impl RoomInfo {
    pub fn all_aliases(&self) -> impl Iterator<Item = &str> {
        self.aliases
            .iter()
            .map(String::as_str)
            .chain(self.canonical_alias.as_deref())
    }
}

/// The state of a pending invite, pre-extracted from the room-service
/// event stream the way §4.2 "Invite handling" needs it.
#[derive(Clone, Debug)]
pub struct InviteState {
    /// The membership-invite event targeting us, if present.
    pub self_invited: bool,
    /// Who sent the invite.
    pub sender: Option<PeerUserId>,
    /// Whether the sender's own `join` event is present in the state.
    pub sender_has_joined: bool,
    /// `m.room.join_rules` content, if any (`true` == invite-only).
    pub invite_only: bool,
}

#[derive(Clone, Debug, Default)]
pub struct SyncBatch {
    /// (room, sender, raw NDJSON body) for `m.text` messages.
    pub messages: Vec<(RoomId, PeerUserId, String)>,
    pub invites: Vec<(RoomId, InviteState)>,
    pub presence: Vec<(PeerUserId, Presence)>,
}

/// Async collaborator interface for the room-based chat substrate.
/// Concrete wire-protocol implementations (connection, CAP/SASL
/// negotiation, TLS) live outside this crate; see SPEC_FULL.md §1.
#[async_trait]
pub trait RoomClient: Send + Sync {
    /// Our own room-service identity, valid after `login`.
    fn user_id(&self) -> PeerUserId;

    async fn login(&self, prev_auth_data: Option<&str>) -> Result<()>;

    /// Runs one sync round. `first_sync` requests inventory/invites
    /// only, without historical messages (§4.6 step 3).
    async fn sync(&self, first_sync: bool) -> Result<SyncBatch>;

    /// Room inventory known at the moment of the call (§4.6 step 4).
    async fn rooms(&self) -> Result<Vec<RoomInfo>>;

    async fn search_user_directory(&self, address_hex: &str) -> Result<Vec<PeerUserId>>;

    /// Display name as currently known to the room service (used by
    /// [`crate::display_name_cache::DisplayNameCache`] to warm its cache).
    async fn display_name(&self, user_id: &PeerUserId) -> Result<Option<String>>;

    async fn create_room(&self, invitees: &[PeerUserId]) -> Result<RoomId>;
    async fn join_room(&self, room_id: &RoomId) -> Result<RoomInfo>;
    async fn leave_room(&self, room_id: &RoomId) -> Result<()>;
    async fn invite_user(&self, room_id: &RoomId, user_id: &PeerUserId) -> Result<()>;
    async fn get_joined_members(&self, room_id: &RoomId, force_resync: bool) -> Result<Vec<PeerUserId>>;

    async fn send_text(&self, room_id: &RoomId, text: &str) -> Result<()>;
    async fn set_presence(&self, presence: Presence) -> Result<()>;
}

pub mod fake {
    //! An in-process [`RoomClient`] backed by shared state, standing
    //! in for a real network client in unit and scenario tests — the
    //! loopback double for this transport's only external collaborator.

    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Room {
        invite_only: bool,
        members: Vec<PeerUserId>,
        aliases: Vec<String>,
        messages: Vec<(PeerUserId, String)>,
    }

    /// Shared substrate state that every [`FakeRoomClient`] attached to
    /// it observes, simulating a single room-service homeserver.
    #[derive(Default)]
    pub struct FakeNetwork {
        rooms: Mutex<HashMap<RoomId, Room>>,
        next_room_id: Mutex<u64>,
        display_names: Mutex<HashMap<PeerUserId, String>>,
        presence: Mutex<HashMap<PeerUserId, Presence>>,
        directory: Mutex<Vec<PeerUserId>>,
        /// Per-user pending sync queues (messages/invites/presence
        /// deltas not yet delivered to that user's `sync`).
        inboxes: Mutex<HashMap<PeerUserId, SyncBatch>>,
    }

    impl FakeNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn register_identity(&self, user_id: PeerUserId, display_name: String) {
            self.display_names.lock().insert(user_id.clone(), display_name);
            self.directory.lock().push(user_id.clone());
            self.inboxes.lock().entry(user_id).or_default();
        }

        pub fn set_presence(&self, user_id: &PeerUserId, presence: Presence) {
            self.presence.lock().insert(user_id.clone(), presence);
            let mut inboxes = self.inboxes.lock();
            for (member, inbox) in inboxes.iter_mut() {
                if member != user_id {
                    inbox.presence.push((user_id.clone(), presence));
                }
            }
        }

        fn fresh_room_id(&self) -> RoomId {
            let mut counter = self.next_room_id.lock();
            *counter += 1;
            RoomId(format!("!room{}", counter))
        }

        pub fn create_room(&self, creator: &PeerUserId, invitees: &[PeerUserId]) -> RoomId {
            let room_id = self.fresh_room_id();
            let mut members = vec![creator.clone()];
            members.extend(invitees.iter().cloned());
            self.rooms.lock().insert(
                room_id.clone(),
                Room {
                    invite_only: true,
                    members,
                    aliases: Vec::new(),
                    messages: Vec::new(),
                },
            );
            let mut inboxes = self.inboxes.lock();
            for invitee in invitees {
                inboxes.entry(invitee.clone()).or_default().invites.push((
                    room_id.clone(),
                    InviteState {
                        self_invited: true,
                        sender: Some(creator.clone()),
                        sender_has_joined: true,
                        invite_only: true,
                    },
                ));
            }
            room_id
        }

        pub fn create_broadcast_room(&self, alias: &str) -> RoomId {
            let room_id = self.fresh_room_id();
            self.rooms.lock().insert(
                room_id.clone(),
                Room {
                    invite_only: false,
                    members: Vec::new(),
                    aliases: vec![alias.to_string()],
                    messages: Vec::new(),
                },
            );
            room_id
        }

        pub fn join(&self, room_id: &RoomId, user_id: &PeerUserId) -> Result<RoomInfo> {
            let mut rooms = self.rooms.lock();
            let room = rooms
                .get_mut(room_id)
                .ok_or_else(|| RoomServiceError::new("no such room"))?;
            if !room.members.contains(user_id) {
                room.members.push(user_id.clone());
            }
            Ok(RoomInfo {
                room_id: room_id.clone(),
                aliases: room.aliases.clone(),
                canonical_alias: None,
                invite_only: room.invite_only,
                members: room.members.clone(),
            })
        }

        pub fn send_text(&self, room_id: &RoomId, sender: &PeerUserId, text: &str) -> Result<()> {
            let members = {
                let mut rooms = self.rooms.lock();
                let room = rooms
                    .get_mut(room_id)
                    .ok_or_else(|| RoomServiceError::new("no such room"))?;
                room.messages.push((sender.clone(), text.to_string()));
                room.members.clone()
            };
            let mut inboxes = self.inboxes.lock();
            for member in members {
                if &member != sender {
                    inboxes
                        .entry(member)
                        .or_default()
                        .messages
                        .push((room_id.clone(), sender.clone(), text.to_string()));
                }
            }
            Ok(())
        }
    }

    pub struct FakeRoomClient {
        pub network: Arc<FakeNetwork>,
        pub user_id: PeerUserId,
    }

    impl FakeRoomClient {
        pub fn new(network: Arc<FakeNetwork>, user_id: PeerUserId, display_name: String) -> Self {
            network.register_identity(user_id.clone(), display_name);
            Self { network, user_id }
        }
    }

    #[async_trait]
    impl RoomClient for FakeRoomClient {
        fn user_id(&self) -> PeerUserId {
            self.user_id.clone()
        }

        async fn login(&self, _prev_auth_data: Option<&str>) -> Result<()> {
            Ok(())
        }

        async fn sync(&self, _first_sync: bool) -> Result<SyncBatch> {
            let mut inboxes = self.network.inboxes.lock();
            Ok(inboxes.entry(self.user_id.clone()).or_default().drain())
        }

        async fn rooms(&self) -> Result<Vec<RoomInfo>> {
            let rooms = self.network.rooms.lock();
            Ok(rooms
                .iter()
                .filter(|(_, room)| room.members.contains(&self.user_id) || !room.aliases.is_empty())
                .map(|(room_id, room)| RoomInfo {
                    room_id: room_id.clone(),
                    aliases: room.aliases.clone(),
                    canonical_alias: None,
                    invite_only: room.invite_only,
                    members: room.members.clone(),
                })
                .collect())
        }

        async fn search_user_directory(&self, address_hex: &str) -> Result<Vec<PeerUserId>> {
            let directory = self.network.directory.lock();
            Ok(directory
                .iter()
                .filter(|user_id| user_id.0.contains(address_hex))
                .cloned()
                .collect())
        }

        async fn display_name(&self, user_id: &PeerUserId) -> Result<Option<String>> {
            Ok(self.network.display_names.lock().get(user_id).cloned())
        }

        async fn create_room(&self, invitees: &[PeerUserId]) -> Result<RoomId> {
            Ok(self.network.create_room(&self.user_id, invitees))
        }

        async fn join_room(&self, room_id: &RoomId) -> Result<RoomInfo> {
            self.network.join(room_id, &self.user_id)
        }

        async fn leave_room(&self, room_id: &RoomId) -> Result<()> {
            let mut rooms = self.network.rooms.lock();
            if let Some(room) = rooms.get_mut(room_id) {
                room.members.retain(|m| m != &self.user_id);
            }
            Ok(())
        }

        async fn invite_user(&self, room_id: &RoomId, user_id: &PeerUserId) -> Result<()> {
            let mut inboxes = self.network.inboxes.lock();
            inboxes.entry(user_id.clone()).or_default().invites.push((
                room_id.clone(),
                InviteState {
                    self_invited: true,
                    sender: Some(self.user_id.clone()),
                    sender_has_joined: true,
                    invite_only: true,
                },
            ));
            Ok(())
        }

        async fn get_joined_members(&self, room_id: &RoomId, _force_resync: bool) -> Result<Vec<PeerUserId>> {
            let rooms = self.network.rooms.lock();
            Ok(rooms
                .get(room_id)
                .map(|room| room.members.clone())
                .unwrap_or_default())
        }

        async fn send_text(&self, room_id: &RoomId, text: &str) -> Result<()> {
            self.network.send_text(room_id, &self.user_id, text)
        }

        async fn set_presence(&self, presence: Presence) -> Result<()> {
            self.network.set_presence(&self.user_id, presence);
            Ok(())
        }
    }

    impl SyncBatch {
        fn drain(&mut self) -> SyncBatch {
            std::mem::take(self)
        }
    }
}
